//! Error types for cache operations

use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error while reading or writing a persisted entry
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry metadata could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisted entry metadata could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Invalid cache configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// Store backend is unavailable or refused the operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Persisted entry is inconsistent (metadata without body or vice versa)
    #[error("Cache corruption detected: {0}")]
    Corruption(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Io(err.into())
        } else {
            Self::Deserialization(err.to_string())
        }
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
