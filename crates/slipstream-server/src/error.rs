//! Error types for the slipstream server.

use slipstream_cache::CacheError;
use slipstream_fetch::FetchError;
use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Upstream origin is not an absolute http(s) URL
    #[error("Invalid upstream origin '{url}': {reason}")]
    InvalidUpstream {
        /// The rejected origin
        url: String,
        /// Reason for rejection
        reason: String,
    },

    /// A device override is out of range
    #[error("Invalid device override {name}: {reason}")]
    InvalidOverride {
        /// Override name as given on the command line
        name: &'static str,
        /// Reason for rejection
        reason: String,
    },
}

/// Server runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind HTTP server
    #[error("Failed to bind HTTP server to {addr}: {source}")]
    HttpBindFailed {
        /// Address that failed to bind
        addr: std::net::SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Orchestrator construction or configuration error
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Cache store error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Server shutdown error
    #[error("Server shutdown error: {0}")]
    Shutdown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::InvalidOverride {
            name: "rtt",
            reason: "must be finite and non-negative".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid device override rtt: must be finite and non-negative"
        );
    }

    #[test]
    fn test_server_error_conversion() {
        let err: ServerError = FetchError::InvalidConfiguration("retry".to_string()).into();
        assert!(err.to_string().starts_with("Fetch error:"));

        let err: ServerError = ConfigError::InvalidUpstream {
            url: "ftp://x".to_string(),
            reason: "unsupported scheme".to_string(),
        }
        .into();
        assert!(err.to_string().contains("ftp://x"));
    }
}
