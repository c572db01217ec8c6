//! In-memory response store
//!
//! Backed by DashMap for concurrent access with minimal lock contention. Used
//! when no cache directory is configured and throughout the test suites.

use crate::{
    error::CacheResult,
    response::{EntryMetadata, Response},
    traits::ResponseStore,
};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Response>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Response>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, response: Response) -> CacheResult<()> {
        self.entries.insert(key.to_string(), response);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn metadata(&self, key: &str) -> CacheResult<Option<EntryMetadata>> {
        Ok(self.entries.get(key).map(|entry| entry.value().metadata()))
    }

    async fn record_access(&self, key: &str) -> CacheResult<Option<u64>> {
        Ok(self.entries.get_mut(key).map(|mut entry| {
            let count = entry.metadata().access_count.saturating_add(1);
            entry.set_access_count(count);
            count
        }))
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(self.entries.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryStore::new();
        assert!(store.is_empty().await.unwrap());

        let key = "GET https://example.com/app.js";
        store
            .put(key, Response::ok("application/javascript", "let x;"))
            .await
            .unwrap();

        let hit = store.get(key).await.unwrap().unwrap();
        assert_eq!(&hit.body[..], b"let x;");
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.keys().await.unwrap(), vec![key.to_string()]);

        assert!(store.delete(key).await.unwrap());
        assert!(!store.delete(key).await.unwrap());
        assert!(store.get(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_record_access() {
        let store = MemoryStore::new();
        let mut response = Response::ok("text/css", "body{}");
        response.stamp_fresh(10, false);
        store.put("k", response).await.unwrap();

        assert_eq!(store.record_access("k").await.unwrap(), Some(2));
        assert_eq!(store.record_access("k").await.unwrap(), Some(3));
        assert_eq!(store.metadata("k").await.unwrap().unwrap().access_count, 3);
        assert_eq!(store.record_access("missing").await.unwrap(), None);
        assert!(store.metadata("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_put_replaces() {
        let store = MemoryStore::new();
        store.put("k", Response::ok("text/plain", "a")).await.unwrap();
        store.put("k", Response::ok("text/plain", "b")).await.unwrap();
        assert_eq!(&store.get("k").await.unwrap().unwrap().body[..], b"b");
        assert_eq!(store.len().await.unwrap(), 1);
    }
}
