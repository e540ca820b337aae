//! Backoff and timeout primitives shared by every external call path.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Exponent is capped so waits stay bounded even at high attempt counts.
const MAX_EXPONENT: u32 = 3;

/// Jittered exponential backoff for retry attempt `attempt` (1-based).
///
/// `base * 2^min(3, attempt-1) + attempt * 500ms + U(0, 250ms)`
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let attempt = attempt.max(1);
    let exponent = (attempt - 1).min(MAX_EXPONENT);
    let scaled = base.saturating_mul(2u32.pow(exponent));
    let linear = Duration::from_millis(u64::from(attempt) * 500);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    scaled + linear + jitter
}

/// A call that did not complete within its deadline.
///
/// Distinguished from other failures so the classifier can treat it as
/// transient. Dropping the future is the only cancellation performed; any
/// transport-level cancellation is best effort.
#[derive(Debug, Error)]
#[error("{label} timed out after {ms} ms")]
pub struct CallTimeout {
    pub label: &'static str,
    pub ms: u64,
}

/// Run `op` with a deadline, mapping expiry to [`CallTimeout`].
pub async fn with_timeout<F, T, E>(
    op: F,
    deadline: Duration,
    label: &'static str,
) -> Result<Result<T, E>, CallTimeout>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => Ok(result),
        Err(_) => Err(CallTimeout {
            label,
            ms: deadline.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(attempt: u32, base_ms: u64) -> (u128, u128) {
        let exponent = (attempt - 1).min(MAX_EXPONENT);
        let fixed = u128::from(base_ms) * 2u128.pow(exponent) + u128::from(attempt) * 500;
        (fixed, fixed + 250)
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter_window() {
        let base = Duration::from_millis(1000);
        for attempt in 1..=3 {
            let (lo, hi) = bounds(attempt, 1000);
            let delay = backoff_delay(attempt, base).as_millis();
            assert!(delay >= lo && delay < hi, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn backoff_exponent_is_capped() {
        let base = Duration::from_millis(1000);
        // Attempts 4 and 9 share the same 2^3 scaling; only the linear
        // component differs.
        let (lo4, _) = bounds(4, 1000);
        let (lo9, hi9) = bounds(9, 1000);
        assert_eq!(lo4 + 5 * 500, lo9);
        let delay = backoff_delay(9, base).as_millis();
        assert!(delay >= lo9 && delay < hi9);
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let a = backoff_delay(0, Duration::from_millis(100)).as_millis();
        let (lo, hi) = bounds(1, 100);
        assert!(a >= lo && a < hi);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_label_and_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok::<_, std::convert::Infallible>(())
        };
        let err = with_timeout(slow, Duration::from_secs(30), "store API")
            .await
            .unwrap_err();
        assert_eq!(err.label, "store API");
        assert_eq!(err.ms, 30_000);
    }

    #[tokio::test]
    async fn timeout_passes_through_completed_calls() {
        let quick = async { Ok::<_, std::convert::Infallible>(7) };
        let value = with_timeout(quick, Duration::from_secs(1), "generator")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
    }
}
