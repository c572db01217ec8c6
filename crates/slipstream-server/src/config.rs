//! Server configuration management.
//!
//! Host settings come from CLI arguments and `SLIPSTREAM_*` environment
//! variables. Orchestration settings (timeouts, retries, cache limits, URL
//! tables) are read separately by
//! [`FetchConfig::from_env`](slipstream_fetch::FetchConfig::from_env).
//!
//! A server host has no browser navigator, so the connection metadata and user
//! agent that device profiling would normally observe are supplied here as
//! overrides.
//!
//! # Example
//!
//! ```no_run
//! use slipstream_server::ServerConfig;
//!
//! let config = ServerConfig::from_args();
//! config.validate().expect("Invalid configuration");
//!
//! println!("Listening on {}", config.bind);
//! println!("Persistent cache: {:?}", config.cache_dir);
//! ```

use crate::error::ConfigError;
use clap::Parser;
use slipstream_fetch::{ConnectionInfo, DeviceOverrides};
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

/// Effective connection types a client may report
const EFFECTIVE_TYPES: &[&str] = &["slow-2g", "2g", "3g", "4g"];

/// Server configuration loaded from CLI args and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "slipstream-server",
    about = "Device-aware caching fetch proxy for slow devices and poor connections",
    version
)]
pub struct ServerConfig {
    /// HTTP bind address
    #[arg(long, env = "SLIPSTREAM_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Origin that relative proxy and pre-cache URLs resolve against
    #[arg(long, env = "SLIPSTREAM_UPSTREAM")]
    pub upstream: Option<Url>,

    /// Directory holding persistent cache generations (in-memory cache if unset)
    #[arg(long, env = "SLIPSTREAM_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// User agent used for device-type hints
    #[arg(long, env = "SLIPSTREAM_DEVICE_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Logical core count, instead of the host's
    #[arg(long, env = "SLIPSTREAM_DEVICE_CORES")]
    pub cores: Option<usize>,

    /// Device memory in GB, instead of the host's
    #[arg(long, env = "SLIPSTREAM_DEVICE_MEMORY_GB")]
    pub memory_gb: Option<f64>,

    /// Effective connection type (slow-2g, 2g, 3g, 4g)
    #[arg(long, env = "SLIPSTREAM_DEVICE_EFFECTIVE_TYPE")]
    pub effective_type: Option<String>,

    /// Downlink estimate in Mbps
    #[arg(long, env = "SLIPSTREAM_DEVICE_DOWNLINK")]
    pub downlink: Option<f64>,

    /// Round-trip time estimate in milliseconds
    #[arg(long, env = "SLIPSTREAM_DEVICE_RTT")]
    pub rtt: Option<f64>,
}

impl ServerConfig {
    /// Parse configuration from command-line arguments.
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Configuration bound to `bind` with nothing overridden.
    #[must_use]
    pub const fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            upstream: None,
            cache_dir: None,
            user_agent: None,
            cores: None,
            memory_gb: None,
            effective_type: None,
            downlink: None,
            rtt: None,
        }
    }

    /// Device signals to use instead of measuring them.
    #[must_use]
    pub fn device_overrides(&self) -> DeviceOverrides {
        let connection = (self.effective_type.is_some()
            || self.downlink.is_some()
            || self.rtt.is_some())
        .then(|| ConnectionInfo {
            effective_type: self.effective_type.clone(),
            downlink_mbps: self.downlink,
            rtt_ms: self.rtt,
        });

        DeviceOverrides {
            user_agent: self.user_agent.clone(),
            cores: self.cores,
            memory_gb: self.memory_gb,
            connection,
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - The upstream is not an absolute http(s) URL with a host
    /// - A numeric override is zero, negative or not finite
    /// - The effective connection type is not one a client can report
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(upstream) = &self.upstream {
            if !matches!(upstream.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidUpstream {
                    url: upstream.to_string(),
                    reason: format!("unsupported scheme '{}'", upstream.scheme()),
                });
            }
            if upstream.host_str().is_none() {
                return Err(ConfigError::InvalidUpstream {
                    url: upstream.to_string(),
                    reason: "missing host".to_string(),
                });
            }
        }

        if self.cores == Some(0) {
            return Err(ConfigError::InvalidOverride {
                name: "cores",
                reason: "must be at least 1".to_string(),
            });
        }

        if let Some(memory) = self.memory_gb
            && !(memory.is_finite() && memory > 0.0)
        {
            return Err(ConfigError::InvalidOverride {
                name: "memory-gb",
                reason: format!("must be positive, got {memory}"),
            });
        }

        for (name, value) in [("downlink", self.downlink), ("rtt", self.rtt)] {
            if let Some(value) = value
                && !(value.is_finite() && value >= 0.0)
            {
                return Err(ConfigError::InvalidOverride {
                    name,
                    reason: format!("must be finite and non-negative, got {value}"),
                });
            }
        }

        if let Some(kind) = &self.effective_type
            && !EFFECTIVE_TYPES.contains(&kind.as_str())
        {
            return Err(ConfigError::InvalidOverride {
                name: "effective-type",
                reason: format!("expected one of {}, got '{kind}'", EFFECTIVE_TYPES.join(", ")),
            });
        }

        Ok(())
    }
}
