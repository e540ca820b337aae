//! Failure classification for downstream service errors.
//!
//! Both external services fail in the same handful of ways; this module maps
//! an observed failure (HTTP status, message, error name) onto a retry
//! decision and a short human-readable condition for the UI. Rules are
//! ordered; the first match wins.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref INPUT_TOO_LONG: Regex =
        Regex::new(r"(?i)context length|too long|max.*tokens").expect("valid regex");
    static ref THROTTLED: Regex =
        Regex::new(r"(?i)throttl|rate limit|too many requests").expect("valid regex");
    static ref NETWORK_FLAKE: Regex =
        Regex::new(r"(?i)econnreset|connection reset|eai_again|etimedout|dns|broken pipe")
            .expect("valid regex");
    static ref TIMED_OUT: Regex = Regex::new(r"(?i)timed? ?out|abort").expect("valid regex");
}

/// Retry decision for one observed failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_transient: bool,
    pub user_message: String,
    pub retry_after: Option<Duration>,
}

impl Classification {
    fn transient(user_message: impl Into<String>) -> Self {
        Self {
            is_transient: true,
            user_message: user_message.into(),
            retry_after: None,
        }
    }

    fn permanent(user_message: impl Into<String>) -> Self {
        Self {
            is_transient: false,
            user_message: user_message.into(),
            retry_after: None,
        }
    }
}

/// Classify a failure from status code, message, and error name.
///
/// `retry_after` carries the service's `Retry-After` hint (seconds) when one
/// accompanied a 429.
pub fn classify(
    status: Option<u16>,
    message: &str,
    name: &str,
    retry_after_secs: Option<u64>,
) -> Classification {
    if let Some(status) = status {
        match status {
            401 | 403 => return Classification::permanent("authentication failed"),
            429 => {
                return Classification {
                    is_transient: true,
                    user_message: "rate limited".into(),
                    retry_after: retry_after_secs.map(Duration::from_secs),
                }
            }
            400 if INPUT_TOO_LONG.is_match(message) => {
                return Classification::permanent("input too long")
            }
            400..=499 => return Classification::permanent(short_condition(message)),
            500..=599 => return Classification::transient(short_condition(message)),
            _ => {}
        }
    }

    if TIMED_OUT.is_match(message) || TIMED_OUT.is_match(name) {
        return Classification::transient("request timed out");
    }
    if NETWORK_FLAKE.is_match(message) || NETWORK_FLAKE.is_match(name) {
        return Classification::transient("network error");
    }

    // Unknown shape without a status: assume transient so one more attempt
    // is made before the item fails.
    Classification::transient(short_condition(message))
}

/// GraphQL responses can report throttling inside a 200. Returns a transient
/// classification when any error message matches the throttle patterns.
pub fn classify_graphql_messages(messages: &[String]) -> Option<Classification> {
    if messages.iter().any(|m| THROTTLED.is_match(m)) {
        return Some(Classification::transient("rate limited"));
    }
    None
}

/// A body that was required to be JSON but did not parse is retried once
/// more as a transient flake.
pub fn classify_unparsable_body() -> Classification {
    Classification::transient("service returned a malformed response")
}

fn short_condition(message: &str) -> String {
    let condensed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if condensed.is_empty() {
        "request failed".into()
    } else {
        crate::common::clip(&condensed, 200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_permanent() {
        for status in [401, 403] {
            let c = classify(Some(status), "no", "HttpError", None);
            assert!(!c.is_transient);
            assert_eq!(c.user_message, "authentication failed");
        }
    }

    #[test]
    fn rate_limits_keep_the_retry_after_hint() {
        let c = classify(Some(429), "Too Many Requests", "HttpError", Some(12));
        assert!(c.is_transient);
        assert_eq!(c.user_message, "rate limited");
        assert_eq!(c.retry_after, Some(Duration::from_secs(12)));
    }

    #[test]
    fn oversized_input_is_permanent() {
        let c = classify(
            Some(400),
            "This model's maximum context length is 128000 tokens",
            "BadRequest",
            None,
        );
        assert!(!c.is_transient);
        assert_eq!(c.user_message, "input too long");
    }

    #[test]
    fn other_4xx_are_permanent_5xx_transient() {
        assert!(!classify(Some(422), "invalid field", "x", None).is_transient);
        assert!(classify(Some(503), "upstream sad", "x", None).is_transient);
    }

    #[test]
    fn timeouts_and_network_flakes_are_transient() {
        assert!(classify(None, "store API timed out after 30000 ms", "CallTimeout", None).is_transient);
        assert!(classify(None, "connection reset by peer", "io", None).is_transient);
        assert!(classify(None, "getaddrinfo EAI_AGAIN shop.example", "dns", None).is_transient);
    }

    #[test]
    fn throttle_inside_200_is_transient() {
        let messages = vec!["Throttled".to_string()];
        let c = classify_graphql_messages(&messages).unwrap();
        assert!(c.is_transient);
        assert_eq!(c.user_message, "rate limited");

        assert!(classify_graphql_messages(&["field missing".into()]).is_none());
    }

    #[test]
    fn first_match_wins_over_later_rules() {
        // 429 whose message also mentions a timeout is still "rate limited".
        let c = classify(Some(429), "timed out while rate limited", "x", None);
        assert_eq!(c.user_message, "rate limited");
    }

    #[test]
    fn long_messages_are_condensed() {
        let noisy = "boom   ".repeat(200);
        let c = classify(Some(500), &noisy, "x", None);
        assert!(c.user_message.chars().count() <= 200);
    }
}
