//! HTTP host for the slipstream fetch orchestrator.
//!
//! Builds the per-process state (device profile, connection registry, response
//! cache) once at start and exposes it over HTTP:
//!
//! - `/proxy?url=<target>`: any method, served cache-first with retries, stale
//!   fallback and a diagnostic page for failed navigations
//! - `POST /control`: PING, STATUS_REQUEST, ERROR_REPORT and
//!   FORCE_CACHE_MAINTENANCE messages
//! - `GET /health` and `GET /metrics`
//!
//! # Architecture
//!
//! - `server`: state construction and the serve loop
//! - `config`: CLI/environment configuration and device overrides
//! - `lifecycle`: install (pre-cache) and activate (old generation cleanup)
//! - `http`: router and handlers
//! - `metrics`: Prometheus export
//!
//! # Example
//!
//! ```no_run
//! use slipstream_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let config = ServerConfig::from_args();
//!     config.validate()?;
//!
//!     let server = Server::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod server;

pub use config::ServerConfig;
pub use error::{ConfigError, ServerError};
pub use lifecycle::Activation;
pub use metrics::ServerMetrics;
pub use server::{AppState, Server};
