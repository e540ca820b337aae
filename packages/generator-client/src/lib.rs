//! Pure REST client for the text-completion service.
//!
//! A minimal client with no domain-specific logic: it sends a system/user
//! prompt pair, asks for a JSON object back, and returns the raw content
//! string. Prompt assembly, retries, and output validation belong to the
//! caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use generator_client::GeneratorClient;
//!
//! let client = GeneratorClient::new(api_url, api_key, "gpt-4o-mini", timeout)?;
//! let raw = client
//!     .complete_json("You write SEO metadata.", "Title the product …")
//!     .await?;
//! let fields: serde_json::Value = serde_json::from_str(&raw)?;
//! ```

pub mod error;
pub mod types;

use std::time::Duration;

use reqwest::Client;

pub use error::{GeneratorError, Result};
use types::{
    ApiErrorBody, CompletionRequest, CompletionResponse, Message, ResponseFormat,
};

/// Client for the text-completion service.
pub struct GeneratorClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl GeneratorClient {
    /// Create a new client.
    ///
    /// `timeout` bounds a single completion call end to end.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(GeneratorError::Config("API key is empty".into()));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeneratorError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout,
        })
    }

    /// Request a completion constrained to a JSON object and return the raw
    /// content string. The caller parses and validates the JSON.
    pub async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::system(system), Message::user(user)],
            temperature: Some(0.4),
            response_format: Some(ResponseFormat::json_object()),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or(body);

            tracing::warn!(status = status.as_u16(), "completion request failed");
            return Err(GeneratorError::Api {
                status: status.as_u16(),
                message,
                retry_after_secs,
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Parse(format!("invalid completion body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GeneratorError::Parse("completion had no content".into()))
    }

    fn map_transport_error(&self, err: reqwest::Error) -> GeneratorError {
        if err.is_timeout() {
            GeneratorError::Timeout(self.timeout.as_millis() as u64)
        } else {
            GeneratorError::Network(err.to_string())
        }
    }
}
