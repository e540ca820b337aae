//! Store admin API client.
//!
//! GraphQL-over-HTTP against the tenant's store, with the call policy every
//! operation shares: a per-call timeout, failure classification, cost-based
//! pacing from the response's throttle telemetry, and a bounded retry loop.
//! Typed reads and writes live in the sibling modules.

pub mod articles;
pub mod images;
pub mod products;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::common::backoff::{backoff_delay, with_timeout};
use crate::kernel::classify::{classify, classify_graphql_messages, classify_unparsable_body, Classification};
use crate::kernel::telemetry::CallObserver;

pub use types::{
    ArticleSnapshot, LiveSeo, MediaImage, MetafieldWrite, ProductSnapshot, SeoFlags,
};
use types::{GraphqlRequest, GraphqlResponse, ThrottleStatus};

/// Terminal failure of a store API call, after retries.
#[derive(Debug, Clone, Error)]
#[error("{user_message}")]
pub struct StoreCallError {
    pub user_message: String,
    pub permanent: bool,
}

impl StoreCallError {
    pub fn permanent(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            permanent: true,
        }
    }

    pub fn exhausted(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            permanent: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreApiConfig {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    /// Sleep when the cost bucket drops below this many points.
    pub throttle_min_available: f64,
    pub throttle_max_wait: Duration,
}

impl Default for StoreApiConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            throttle_min_available: 100.0,
            throttle_max_wait: Duration::from_secs(5),
        }
    }
}

/// Raw transport reply: HTTP status, body text, and the retry-after hint.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: String,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

/// Transport seam so the retry/pacing machinery is testable without a
/// network.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn execute(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<TransportReply, TransportError>;
}

/// reqwest-backed transport for one tenant's store.
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl GraphqlTransport for HttpTransport {
    async fn execute(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<TransportReply, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Store-Access-Token", &self.token)
            .json(&GraphqlRequest { query, variables })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(0)
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(TransportReply {
            status,
            body,
            retry_after_secs,
        })
    }
}

/// Retry loop states for one GraphQL call.
enum CallState {
    Calling { attempt: u32 },
    Sleeping { attempt: u32, wait: Duration, reason: String },
    Done(serde_json::Value),
    Failed(StoreCallError),
}

/// Store API client for one tenant.
pub struct StoreApiClient {
    transport: Arc<dyn GraphqlTransport>,
    config: StoreApiConfig,
}

impl StoreApiClient {
    pub fn new(transport: Arc<dyn GraphqlTransport>, config: StoreApiConfig) -> Self {
        Self { transport, config }
    }

    /// Execute a GraphQL operation with the shared call policy. Returns the
    /// `data` value.
    pub(crate) async fn call(
        &self,
        label: &'static str,
        query: &str,
        variables: serde_json::Value,
        observer: &dyn CallObserver,
    ) -> Result<serde_json::Value, StoreCallError> {
        let mut state = CallState::Calling { attempt: 1 };
        loop {
            state = match state {
                CallState::Calling { attempt } => {
                    observer.on_attempt(attempt).await;
                    let outcome = with_timeout(
                        self.transport.execute(query, variables.clone()),
                        self.config.timeout,
                        "store API",
                    )
                    .await;

                    match outcome {
                        Ok(Ok(reply)) => self.handle_reply(attempt, label, reply, observer).await,
                        Ok(Err(err)) => {
                            let name = match &err {
                                TransportError::Network(_) => "Network",
                                TransportError::Timeout(_) => "Timeout",
                            };
                            self.next_state(attempt, classify(None, &err.to_string(), name, None))
                        }
                        Err(timeout) => self.next_state(
                            attempt,
                            classify(None, &timeout.to_string(), "CallTimeout", None),
                        ),
                    }
                }
                CallState::Sleeping { attempt, wait, reason } => {
                    observer.on_retry(wait, &reason).await;
                    tokio::time::sleep(wait).await;
                    CallState::Calling { attempt: attempt + 1 }
                }
                CallState::Done(data) => return Ok(data),
                CallState::Failed(err) => {
                    tracing::warn!(label, error = %err, permanent = err.permanent, "store API call failed");
                    return Err(err);
                }
            };
        }
    }

    async fn handle_reply(
        &self,
        attempt: u32,
        label: &'static str,
        reply: TransportReply,
        observer: &dyn CallObserver,
    ) -> CallState {
        let parsed: GraphqlResponse = match serde_json::from_str(&reply.body) {
            Ok(parsed) => parsed,
            Err(_) => return self.next_state(attempt, classify_unparsable_body()),
        };

        if !(200..300).contains(&reply.status) {
            let message = parsed
                .errors
                .as_ref()
                .and_then(|e| e.first())
                .map(|e| e.message.clone())
                .unwrap_or_else(|| reply.body.clone());
            return self.next_state(
                attempt,
                classify(Some(reply.status), &message, "HttpError", reply.retry_after_secs),
            );
        }

        if let Some(errors) = &parsed.errors {
            let messages: Vec<String> = errors.iter().map(|e| e.message.clone()).collect();
            if let Some(throttle) = classify_graphql_messages(&messages) {
                return self.next_state(attempt, throttle);
            }
            return CallState::Failed(StoreCallError::permanent(messages.join("; ")));
        }

        let Some(data) = parsed.data else {
            return self.next_state(attempt, classify_unparsable_body());
        };

        // Cost pacing: stay ahead of the bucket instead of hitting 429s.
        if let Some(throttle) = parsed
            .extensions
            .and_then(|e| e.cost)
            .and_then(|c| c.throttle_status)
        {
            if let Some(wait) = self.throttle_wait(throttle) {
                observer
                    .on_throttle(wait, throttle.currently_available, throttle.restore_rate)
                    .await;
                tokio::time::sleep(wait).await;
            }
        }

        tracing::debug!(label, "store API call succeeded");
        CallState::Done(data)
    }

    fn throttle_wait(&self, throttle: ThrottleStatus) -> Option<Duration> {
        if throttle.currently_available >= self.config.throttle_min_available {
            return None;
        }
        if throttle.restore_rate <= 0.0 {
            return Some(self.config.throttle_max_wait);
        }
        let deficit = self.config.throttle_min_available - throttle.currently_available;
        let secs = (deficit / throttle.restore_rate).ceil();
        let wait = Duration::from_secs_f64(secs.max(0.0));
        Some(wait.min(self.config.throttle_max_wait))
    }

    fn next_state(&self, attempt: u32, classification: Classification) -> CallState {
        if classification.is_transient && attempt < self.config.max_attempts {
            let wait = backoff_delay(attempt, self.config.backoff_base)
                .max(classification.retry_after.unwrap_or_default());
            CallState::Sleeping {
                attempt,
                wait,
                reason: classification.user_message,
            }
        } else if classification.is_transient {
            CallState::Failed(StoreCallError::exhausted(classification.user_message))
        } else {
            CallState::Failed(StoreCallError::permanent(classification.user_message))
        }
    }

    /// Decode a typed value out of the `data` payload.
    pub(crate) fn decode<T: DeserializeOwned>(
        data: serde_json::Value,
        label: &'static str,
    ) -> Result<T, StoreCallError> {
        serde_json::from_value(data)
            .with_context(|| format!("unexpected {label} response shape"))
            .map_err(|e| StoreCallError::permanent(e.to_string()))
    }
}

/// Everything the phases need from the store, per tenant.
#[async_trait]
pub trait StoreApi: Send + Sync {
    async fn fetch_product(&self, id: &str) -> Result<ProductSnapshot, StoreCallError>;

    async fn fetch_article(&self, id: &str) -> Result<ArticleSnapshot, StoreCallError>;

    async fn fetch_images(&self, product_id: &str) -> Result<Vec<MediaImage>, StoreCallError>;

    async fn fetch_product_seo_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError>;

    async fn fetch_article_seo_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError>;

    async fn write_product_seo(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        flags: SeoFlags,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError>;

    async fn write_article_seo(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        flags: SeoFlags,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError>;

    async fn write_image_alt(
        &self,
        product_id: &str,
        media_id: &str,
        alt: &str,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError>;
}

#[async_trait]
impl StoreApi for StoreApiClient {
    async fn fetch_product(&self, id: &str) -> Result<ProductSnapshot, StoreCallError> {
        self.fetch_product_impl(id, &crate::kernel::telemetry::NoopObserver)
            .await
    }

    async fn fetch_article(&self, id: &str) -> Result<ArticleSnapshot, StoreCallError> {
        self.fetch_article_impl(id, &crate::kernel::telemetry::NoopObserver)
            .await
    }

    async fn fetch_images(&self, product_id: &str) -> Result<Vec<MediaImage>, StoreCallError> {
        self.fetch_images_impl(product_id, &crate::kernel::telemetry::NoopObserver)
            .await
    }

    async fn fetch_product_seo_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError> {
        self.fetch_product_seo_batch_impl(ids, &crate::kernel::telemetry::NoopObserver)
            .await
    }

    async fn fetch_article_seo_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError> {
        self.fetch_article_seo_batch_impl(ids, &crate::kernel::telemetry::NoopObserver)
            .await
    }

    async fn write_product_seo(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        flags: SeoFlags,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        self.write_product_seo_impl(id, title, description, flags, observer)
            .await
    }

    async fn write_article_seo(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        flags: SeoFlags,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        self.write_article_seo_impl(id, title, description, flags, observer)
            .await
    }

    async fn write_image_alt(
        &self,
        product_id: &str,
        media_id: &str,
        alt: &str,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        self.write_image_alt_impl(product_id, media_id, alt, observer)
            .await
    }
}

/// Opens a [`StoreApi`] for a tenant's endpoint and token.
pub trait StoreApiFactory: Send + Sync {
    fn open(&self, endpoint: &str, token: &str) -> Arc<dyn StoreApi>;
}

/// Factory producing HTTP-backed clients sharing one connection pool.
pub struct HttpStoreApiFactory {
    http: reqwest::Client,
    config: StoreApiConfig,
}

impl HttpStoreApiFactory {
    pub fn new(config: StoreApiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout + Duration::from_secs(5))
            .build()
            .context("failed to build store API HTTP client")?;
        Ok(Self { http, config })
    }
}

impl StoreApiFactory for HttpStoreApiFactory {
    fn open(&self, endpoint: &str, token: &str) -> Arc<dyn StoreApi> {
        let transport = Arc::new(HttpTransport::new(self.http.clone(), endpoint, token));
        Arc::new(StoreApiClient::new(transport, self.config.clone()))
    }
}
