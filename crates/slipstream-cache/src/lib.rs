//! Persistent response cache for slow-device content delivery
//!
//! Responses are stored under a request identity (method plus absolute URL)
//! together with the bookkeeping needed to decide what to shed first: when the
//! entry was stored, how often it was served, and whether it belongs to the
//! game asset class. That bookkeeping travels in ordinary response headers, so
//! a cached entry is just `(status, headers, body)`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │            CacheStore               │
//! │   limits + trim() / expire()        │
//! └─────────────────────────────────────┘
//!                  │
//! ┌─────────────────────────────────────┐
//! │      ResponseStore (async trait)    │
//! │  ┌─────────────┐ ┌───────────────┐  │
//! │  │ MemoryStore │ │   DiskStore   │  │
//! │  │  (DashMap)  │ │ (meta + body) │  │
//! │  └─────────────┘ └───────────────┘  │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use slipstream_cache::{CacheLimits, CacheStore, MemoryStore, Response, request_key};
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheStore::new(
//!     "assets-v1",
//!     Arc::new(MemoryStore::new()),
//!     CacheLimits { max_entries: 2000, max_age: Duration::from_secs(7 * 24 * 3600) },
//! )?;
//!
//! let key = request_key("GET", "https://cdn.example.com/game.wasm");
//! cache.put(&key, Response::ok("application/wasm", vec![0u8; 16])).await?;
//! assert!(cache.get(&key).await?.is_some());
//!
//! // Shed overflow and stale entries; a slow device keeps entries longer
//! cache.maintain(true).await;
//! # Ok(())
//! # }
//! ```

pub mod disk_store;
pub mod error;
pub mod memory_store;
pub mod policy;
pub mod response;
pub mod traits;

pub use disk_store::{DiskStore, purge_stale_generations};
pub use error::{CacheError, CacheResult};
pub use memory_store::MemoryStore;
pub use policy::{CacheLimits, CacheStore, CacheSummary};
pub use response::{
    EntryMetadata, HEADER_ACCESS_COUNT, HEADER_GAME_CONTENT, HEADER_STALE, HEADER_TIMESTAMP,
    Headers, Response, now_millis,
};
pub use traits::{ResponseStore, request_key};
