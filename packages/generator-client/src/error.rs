//! Error types for the generator client.

use thiserror::Error;

/// Result type for generator client operations.
pub type Result<T> = std::result::Result<T, GeneratorError>;

/// Generator client errors.
///
/// The HTTP status is kept on `Api` so callers can classify failures
/// (auth vs. rate limit vs. server error) without string matching.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// Configuration error (missing API key, invalid base URL)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, reset, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete within the configured deadline
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// API error (non-2xx response)
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        /// `Retry-After` header in seconds, when the service sent one
        retry_after_secs: Option<u64>,
    },

    /// Parse error (response body was not the expected shape)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl GeneratorError {
    /// HTTP status of the failure, when one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            GeneratorError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `Retry-After` hint in seconds, when the service sent one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GeneratorError::Api {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}
