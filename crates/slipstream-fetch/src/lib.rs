//! Device-aware fetch orchestration
//!
//! This crate sits in front of a content proxy and makes delivery of large,
//! latency-sensitive assets robust on slow devices and poor connections:
//!
//! - [`device`]: classifies the serving device once per process
//! - [`patterns`]: pure URL tables for priority, bypass, cacheability and game content
//! - [`registry`]: tracks in-flight requests and process-wide counters
//! - [`orchestrator`]: cache-first serving, timeouts, device-scaled backoff and stale fallback
//! - [`augment`]: idempotent decoration of game HTML pages
//! - [`control`]: PING / STATUS / ERROR_REPORT / FORCE_CACHE_MAINTENANCE messages
//!
//! # Example
//!
//! ```rust,no_run
//! use slipstream_cache::{CacheStore, MemoryStore};
//! use slipstream_fetch::{
//!     DeviceOverrides, DeviceProfiler, FetchConfig, FetchOrchestrator, HttpProxy, ProxyRequest,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FetchConfig::from_env()?;
//! let cache = CacheStore::new(
//!     config.cache_name.clone(),
//!     Arc::new(MemoryStore::new()),
//!     config.cache_limits(),
//! )?;
//! let orchestrator = FetchOrchestrator::new(
//!     config,
//!     Arc::new(DeviceProfiler::new(DeviceOverrides::default())),
//!     Arc::new(HttpProxy::new()?),
//!     Some(cache),
//! )?;
//!
//! let response = orchestrator
//!     .respond(&ProxyRequest::get("https://cdn.example.com/Build/game.wasm"))
//!     .await?;
//! println!("{} ({} bytes)", response.status, response.body.len());
//! # Ok(())
//! # }
//! ```

pub mod augment;
pub mod config;
pub mod control;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod orchestrator;
pub mod patterns;
pub mod proxy;
pub mod registry;

pub use augment::{AUGMENT_MARKER, augment, augment_html};
pub use config::{FetchConfig, TimeoutMultipliers};
pub use control::{CacheStats, ControlMessage, ControlReply, SlowDeviceOptimizations};
pub use device::{
    ConnectionInfo, DeviceClass, DeviceHints, DeviceOverrides, DeviceProfile, DeviceProfiler,
    DeviceSignals, classify as classify_device,
};
pub use diagnostics::error_page;
pub use error::{AugmentError, FetchError, Result};
pub use orchestrator::FetchOrchestrator;
pub use patterns::{PriorityTables, PriorityTier, UrlPatterns, classify};
pub use proxy::{BaseProxy, FetchOptions, HttpProxy, PriorityHint, ProxyRequest};
pub use registry::{AdmissionTicket, ConnectionEntry, ConnectionRegistry, ConnectionStats};
