//! Wire and domain types for the store admin API.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GraphQL envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct GraphqlRequest<'a> {
    pub query: &'a str,
    pub variables: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct GraphqlResponse {
    pub data: Option<serde_json::Value>,
    pub errors: Option<Vec<GraphqlErrorEntry>>,
    pub extensions: Option<Extensions>,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlErrorEntry {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct Extensions {
    pub cost: Option<CostInfo>,
}

#[derive(Debug, Deserialize)]
pub struct CostInfo {
    #[serde(rename = "throttleStatus")]
    pub throttle_status: Option<ThrottleStatus>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleStatus {
    pub currently_available: f64,
    pub restore_rate: f64,
}

// ---------------------------------------------------------------------------
// Domain snapshots
// ---------------------------------------------------------------------------

/// The SEO state of a product or article as currently live in the store:
/// the native `seo { … }` pair (products only) and the two metafields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSeo {
    pub native_title: Option<String>,
    pub native_description: Option<String>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MediaImage {
    pub id: String,
    pub alt: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProductSnapshot {
    pub id: String,
    pub title: String,
    pub description_html: String,
    pub seo: LiveSeo,
    pub media: Vec<MediaImage>,
}

#[derive(Debug, Clone)]
pub struct ArticleSnapshot {
    pub id: String,
    pub title: String,
    pub body: String,
    pub seo: LiveSeo,
}

/// Which of the two SEO fields the job writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeoFlags {
    pub title: bool,
    pub description: bool,
}

/// One staged metafield write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetafieldWrite {
    pub key: &'static str,
    pub value: String,
}

pub const TITLE_TAG: &str = "title_tag";
pub const DESCRIPTION_TAG: &str = "description_tag";
pub const SEO_NAMESPACE: &str = "global";
pub const TEXT_FIELD_TYPE: &str = "single_line_text_field";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_status_parses_from_extensions() {
        let body = r#"{
            "data": {},
            "extensions": {"cost": {"throttleStatus": {"currentlyAvailable": 50.0, "restoreRate": 50.0}}}
        }"#;
        let parsed: GraphqlResponse = serde_json::from_str(body).unwrap();
        let throttle = parsed
            .extensions
            .unwrap()
            .cost
            .unwrap()
            .throttle_status
            .unwrap();
        assert_eq!(throttle.currently_available, 50.0);
        assert_eq!(throttle.restore_rate, 50.0);
    }

    #[test]
    fn errors_parse_without_data() {
        let body = r#"{"errors": [{"message": "Throttled"}]}"#;
        let parsed: GraphqlResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.data.is_none());
        assert_eq!(parsed.errors.unwrap()[0].message, "Throttled");
    }
}
