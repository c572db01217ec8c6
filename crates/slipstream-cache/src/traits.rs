//! Core storage trait for cached responses
//!
//! Each method is a single atomic step against the backing store. Multi-step
//! maintenance (trim, expire) is built on top of these calls, so a concurrent
//! reader never observes more than one step half-applied.

use crate::{
    error::CacheResult,
    response::{EntryMetadata, Response},
};
use async_trait::async_trait;

/// Keyed storage for responses.
///
/// Keys are request identities (method plus absolute URL).
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Response>>;

    /// Replaces any existing entry.
    async fn put(&self, key: &str, response: Response) -> CacheResult<()>;

    /// Returns true if the key was present and removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Finite snapshot of the keys present at call time.
    async fn keys(&self) -> CacheResult<Vec<String>>;

    /// Cache bookkeeping for an entry without loading its body.
    async fn metadata(&self, key: &str) -> CacheResult<Option<EntryMetadata>> {
        Ok(self.get(key).await?.map(|response| response.metadata()))
    }

    /// Increments the entry's access counter and returns the new value, or
    /// `None` when the key is absent. Only the bookkeeping is rewritten.
    async fn record_access(&self, key: &str) -> CacheResult<Option<u64>> {
        let Some(mut response) = self.get(key).await? else {
            return Ok(None);
        };
        let count = response.metadata().access_count.saturating_add(1);
        response.set_access_count(count);
        self.put(key, response).await?;
        Ok(Some(count))
    }

    /// Entry count, not byte size.
    async fn len(&self) -> CacheResult<usize> {
        Ok(self.keys().await?.len())
    }

    async fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Request identity used as the cache key.
pub fn request_key(method: &str, url: &str) -> String {
    format!("{} {url}", method.to_ascii_uppercase())
}
