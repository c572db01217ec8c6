//! Error types for fetch orchestration

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("All {attempts} attempts failed, last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] slipstream_cache::CacheError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl FetchError {
    /// Check if error is retryable
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Cancelled | Self::Upstream(_) => true,
            Self::Http(e) => !e.is_builder() && !e.is_redirect(),
            Self::InvalidRequest(_)
            | Self::Exhausted { .. }
            | Self::Cache(_)
            | Self::InvalidConfiguration(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout(),
            Self::Exhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors raised while decorating an HTML response
#[derive(Debug, Error)]
pub enum AugmentError {
    #[error("Response body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Device profile could not be encoded: {0}")]
    Profile(#[from] serde_json::Error),
}
