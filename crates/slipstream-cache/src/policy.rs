//! Size and age policies over a [`ResponseStore`]
//!
//! [`CacheStore`] pairs a named store with its limits and implements the two
//! maintenance passes:
//!
//! - `trim`: sheds the least important entries when the entry count exceeds the
//!   configured maximum. Importance ranks non-game content below game content,
//!   then fewer hits below more hits, then older below newer.
//! - `expire`: deletes entries older than their TTL. The TTL stretches on slow
//!   devices, and stretches again for game content on slow devices.
//!
//! Both passes work through single `metadata`/`delete` calls on the store, so
//! bodies are never loaded, and never fail as a whole: per-entry errors are logged and skipped, and a failure to
//! list the keys ends the pass early with nothing removed.

use crate::{
    error::{CacheError, CacheResult},
    response::{EntryMetadata, Response, now_millis},
    traits::ResponseStore,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// TTL multiplier applied on slow-class devices
pub const SLOW_DEVICE_TTL_FACTOR: f64 = 1.5;
/// Additional TTL multiplier for game content on slow-class devices
pub const GAME_CONTENT_TTL_FACTOR: f64 = 2.0;
/// Share of the overflow removed per trim pass on slow-class devices
pub const SLOW_DEVICE_TRIM_SHARE: f64 = 0.5;

/// Limits for one named cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLimits {
    /// Maximum entry count before trimming
    pub max_entries: usize,
    /// Base time-to-live
    pub max_age: Duration,
}

impl CacheLimits {
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_entries == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_entries must be greater than 0".to_string(),
            ));
        }
        if self.max_age.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "max_age must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of entries a trim pass removes for a store holding `count`.
    ///
    /// Slow-class devices remove half the overflow, but always at least one
    /// entry while overflowing so repeated passes converge on the limit.
    pub fn trim_quota(&self, count: usize, slow_device: bool) -> usize {
        let overflow = count.saturating_sub(self.max_entries);
        if overflow == 0 {
            return 0;
        }
        if slow_device {
            let half = (overflow as f64 * SLOW_DEVICE_TRIM_SHARE).floor() as usize;
            half.max(1)
        } else {
            overflow
        }
    }

    /// TTL in milliseconds for an entry.
    pub fn ttl_ms(&self, slow_device: bool, game_content: bool) -> u64 {
        let mut ttl = self.max_age.as_millis() as f64;
        if slow_device {
            ttl *= SLOW_DEVICE_TTL_FACTOR;
            if game_content {
                ttl *= GAME_CONTENT_TTL_FACTOR;
            }
        }
        ttl as u64
    }
}

/// Summary of a cache for status reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    pub name: String,
    pub max_entries: usize,
    pub max_age_ms: u64,
    pub entries: usize,
}

/// Ranking key: lower sorts first and is removed first.
fn importance(meta: &EntryMetadata) -> (bool, u64, u64) {
    (meta.is_game_content, meta.access_count, meta.stored_at_ms)
}

/// A named response cache with size and age limits.
#[derive(Clone)]
pub struct CacheStore {
    name: String,
    store: Arc<dyn ResponseStore>,
    limits: CacheLimits,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ResponseStore>,
        limits: CacheLimits,
    ) -> CacheResult<Self> {
        limits.validate()?;
        Ok(Self {
            name: name.into(),
            store,
            limits,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<Response>> {
        self.store.get(key).await
    }

    pub async fn put(&self, key: &str, response: Response) -> CacheResult<()> {
        self.store.put(key, response).await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.store.delete(key).await
    }

    pub async fn metadata(&self, key: &str) -> CacheResult<Option<EntryMetadata>> {
        self.store.metadata(key).await
    }

    /// Bumps the hit counter of an entry. Returns the new count.
    pub async fn record_access(&self, key: &str) -> CacheResult<Option<u64>> {
        self.store.record_access(key).await
    }

    pub async fn keys(&self) -> CacheResult<Vec<String>> {
        self.store.keys().await
    }

    pub async fn len(&self) -> CacheResult<usize> {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> CacheResult<bool> {
        self.store.is_empty().await
    }

    pub async fn summary(&self) -> CacheSummary {
        let entries = match self.store.len().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to count entries in cache {}: {e}", self.name);
                0
            }
        };
        CacheSummary {
            name: self.name.clone(),
            max_entries: self.limits.max_entries,
            max_age_ms: self.limits.max_age.as_millis() as u64,
            entries,
        }
    }

    /// Removes the least important entries while the store is over its size
    /// limit. Returns the number of entries removed.
    pub async fn trim(&self, slow_device: bool) -> usize {
        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache trim skipped for {}: {e}", self.name);
                return 0;
            }
        };

        let quota = self.limits.trim_quota(keys.len(), slow_device);
        if quota == 0 {
            return 0;
        }

        let mut ranked = Vec::with_capacity(keys.len());
        for key in keys {
            match self.store.metadata(&key).await {
                Ok(Some(meta)) => ranked.push((importance(&meta), key)),
                // Deleted concurrently, nothing to rank
                Ok(None) => {}
                Err(e) => {
                    debug!("Ranking {key} as least important after read error: {e}");
                    ranked.push((importance(&EntryMetadata::default()), key));
                }
            }
        }
        ranked.sort();

        let mut removed = 0;
        for (_, key) in ranked.into_iter().take(quota) {
            match self.store.delete(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to trim cache entry {key}: {e}"),
            }
        }

        info!(
            "Trimmed {removed} entries from cache {} (quota {quota}, slow device: {slow_device})",
            self.name
        );
        removed
    }

    /// Deletes entries older than their TTL. Returns the number removed.
    pub async fn expire(&self, slow_device: bool) -> usize {
        self.expire_at(now_millis(), slow_device).await
    }

    /// [`CacheStore::expire`] evaluated at a fixed clock reading.
    pub async fn expire_at(&self, now_ms: u64, slow_device: bool) -> usize {
        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache expiry skipped for {}: {e}", self.name);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            let meta = match self.store.metadata(&key).await {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping expiry check for {key}: {e}");
                    continue;
                }
            };

            let ttl = self.limits.ttl_ms(slow_device, meta.is_game_content);
            if meta.age_ms(now_ms) <= ttl {
                continue;
            }

            match self.store.delete(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to expire cache entry {key}: {e}"),
            }
        }

        if removed > 0 {
            info!("Expired {removed} entries from cache {}", self.name);
        }
        removed
    }

    /// Runs a trim pass followed by an expiry pass.
    pub async fn maintain(&self, slow_device: bool) -> (usize, usize) {
        let trimmed = self.trim(slow_device).await;
        let expired = self.expire(slow_device).await;
        (trimmed, expired)
    }
}
