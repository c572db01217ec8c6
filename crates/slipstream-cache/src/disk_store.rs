//! Disk-backed response store for persistent caching across restarts
//!
//! Each entry is two files inside the cache directory, both named by the MD5 of
//! the request key:
//! - `<md5>.meta.json`: the key, status and headers
//! - `<md5>.body`: the raw response body
//!
//! Writes go to a uniquely named temporary file first and are renamed into
//! place, body before metadata, so a crash leaves at worst an orphaned body
//! that the index ignores. Every operation on a key holds that key's lock, so
//! a reader never pairs the metadata of one write with the body of another.
//! Access-count updates rewrite the metadata file only.
//!
//! The in-memory key index is rebuilt from the metadata files on open.
#![allow(clippy::significant_drop_tightening)]

use crate::{
    error::{CacheError, CacheResult},
    response::{EntryMetadata, HEADER_ACCESS_COUNT, Headers, Response},
    traits::ResponseStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    fs,
    sync::{Mutex, Semaphore},
};
use tracing::{debug, warn};

const META_SUFFIX: &str = ".meta.json";
const BODY_SUFFIX: &str = ".body";
const TMP_EXTENSION: &str = "tmp";

/// Metadata file contents
#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    key: String,
    status: u16,
    headers: Headers,
}

/// Persistent response store rooted at one named cache directory.
pub struct DiskStore {
    dir: PathBuf,
    /// request key -> file stem
    index: RwLock<HashMap<String, String>>,
    /// Limits concurrent file operations
    io_semaphore: Arc<Semaphore>,
    /// file stem -> lock serializing every operation on that entry
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Suffix source for temporary file names
    write_seq: AtomicU64,
}

impl DiskStore {
    /// Opens (creating if needed) the store at `root/name` and rebuilds the key
    /// index from the metadata files found there.
    pub async fn open(root: impl AsRef<Path>, name: &str) -> CacheResult<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(CacheError::InvalidConfiguration(format!(
                "invalid cache name: {name:?}"
            )));
        }

        let dir = root.as_ref().join(name);
        fs::create_dir_all(&dir).await?;

        let store = Self {
            dir,
            index: RwLock::new(HashMap::new()),
            io_semaphore: Arc::new(Semaphore::new(16)),
            key_locks: DashMap::new(),
            write_seq: AtomicU64::new(0),
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem_for(key: &str) -> String {
        hex::encode(md5::compute(key.as_bytes()).0)
    }

    fn meta_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{META_SUFFIX}"))
    }

    fn body_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{BODY_SUFFIX}"))
    }

    fn key_lock(&self, stem: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.key_locks.entry(stem.to_string()).or_default().value())
    }

    /// Drops the lock entry for `stem` unless another task is waiting on it.
    /// Call while holding the guard from [`Self::key_lock`].
    fn release_key_lock(&self, stem: &str) {
        // One reference in the map plus the caller's
        self.key_locks
            .remove_if(stem, |_, lock| Arc::strong_count(lock) <= 2);
    }

    async fn read_meta(&self, key: &str, stem: &str) -> CacheResult<Option<StoredMeta>> {
        match self.read(&self.meta_path(stem)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Deleted underneath us
                self.index.write().remove(key);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn rebuild_index(&self) -> CacheResult<()> {
        let mut rebuilt = HashMap::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if Path::new(file_name)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(TMP_EXTENSION))
            {
                // Leftover from an interrupted write
                let _ = fs::remove_file(&path).await;
                continue;
            }

            let Some(stem) = file_name.strip_suffix(META_SUFFIX) else {
                continue;
            };

            match fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<StoredMeta>(&raw) {
                    Ok(meta) => {
                        rebuilt.insert(meta.key, stem.to_string());
                    }
                    Err(e) => warn!("Skipping unreadable cache metadata {}: {e}", path.display()),
                },
                Err(e) => warn!("Failed to read cache metadata {}: {e}", path.display()),
            }
        }

        debug!(
            "Rebuilt cache index for {} with {} entries",
            self.dir.display(),
            rebuilt.len()
        );
        *self.index.write() = rebuilt;
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> CacheResult<()> {
        let _permit = self
            .io_semaphore
            .acquire()
            .await
            .map_err(|_| CacheError::Backend("Failed to acquire I/O semaphore".to_string()))?;

        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(format!(".{}.{seq}.{TMP_EXTENSION}", std::process::id()));
        let temp_path = PathBuf::from(temp_name);

        if let Err(e) = fs::write(&temp_path, data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let _permit = self.io_semaphore.acquire().await.map_err(|_| {
            std::io::Error::other("Failed to acquire I/O semaphore")
        })?;
        fs::read(path).await
    }

    async fn remove_if_exists(path: &Path) -> CacheResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResponseStore for DiskStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Response>> {
        let Some(stem) = self.index.read().get(key).cloned() else {
            return Ok(None);
        };
        let lock = self.key_lock(&stem);
        let _guard = lock.lock().await;

        let Some(meta) = self.read_meta(key, &stem).await? else {
            return Ok(None);
        };

        let body = match self.read(&self.body_path(&stem)).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::Corruption(format!("missing body for {key}")));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(Response {
            status: meta.status,
            headers: meta.headers,
            body: Bytes::from(body),
        }))
    }

    async fn put(&self, key: &str, response: Response) -> CacheResult<()> {
        let stem = Self::stem_for(key);
        let meta = StoredMeta {
            key: key.to_string(),
            status: response.status,
            headers: response.headers,
        };
        let meta_raw =
            serde_json::to_vec(&meta).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let lock = self.key_lock(&stem);
        let _guard = lock.lock().await;

        self.write_atomic(&self.body_path(&stem), &response.body)
            .await?;
        self.write_atomic(&self.meta_path(&stem), &meta_raw).await?;

        self.index.write().insert(key.to_string(), stem);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let stem = Self::stem_for(key);
        let lock = self.key_lock(&stem);
        let _guard = lock.lock().await;

        if self.index.write().remove(key).is_none() {
            self.release_key_lock(&stem);
            return Ok(false);
        }

        // Metadata first so a half-finished delete is invisible after a restart
        Self::remove_if_exists(&self.meta_path(&stem)).await?;
        Self::remove_if_exists(&self.body_path(&stem)).await?;
        self.release_key_lock(&stem);
        Ok(true)
    }

    async fn metadata(&self, key: &str) -> CacheResult<Option<EntryMetadata>> {
        let Some(stem) = self.index.read().get(key).cloned() else {
            return Ok(None);
        };
        let lock = self.key_lock(&stem);
        let _guard = lock.lock().await;

        Ok(self
            .read_meta(key, &stem)
            .await?
            .map(|meta| EntryMetadata::from_headers(&meta.headers)))
    }

    async fn record_access(&self, key: &str) -> CacheResult<Option<u64>> {
        let Some(stem) = self.index.read().get(key).cloned() else {
            return Ok(None);
        };
        let lock = self.key_lock(&stem);
        let _guard = lock.lock().await;

        let Some(mut meta) = self.read_meta(key, &stem).await? else {
            return Ok(None);
        };
        let count = EntryMetadata::from_headers(&meta.headers)
            .access_count
            .saturating_add(1);
        meta.headers.insert(HEADER_ACCESS_COUNT, count.to_string());

        let meta_raw =
            serde_json::to_vec(&meta).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.write_atomic(&self.meta_path(&stem), &meta_raw).await?;
        Ok(Some(count))
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.index.read().keys().cloned().collect())
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(self.index.read().len())
    }
}

/// Removes sibling cache directories under `root` whose name starts with
/// `prefix` but differs from `current`. Returns the names removed.
///
/// Used on activation to drop generations left behind by older releases.
pub async fn purge_stale_generations(
    root: impl AsRef<Path>,
    prefix: &str,
    current: &str,
) -> CacheResult<Vec<String>> {
    let root = root.as_ref();
    let mut removed = Vec::new();

    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name != current && name.starts_with(prefix) {
            fs::remove_dir_all(entry.path()).await?;
            removed.push(name);
        }
    }

    Ok(removed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_disk_store_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path(), "test-cache").await.unwrap();

        let mut response = Response::ok("application/wasm", vec![0u8, 97, 115, 109]);
        response.stamp_fresh(42, true);
        store.put("GET https://a/game.wasm", response.clone()).await.unwrap();

        let loaded = store.get("GET https://a/game.wasm").await.unwrap().unwrap();
        assert_eq!(loaded, response);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disk_store_rejects_bad_name() {
        let temp = TempDir::new().unwrap();
        assert!(DiskStore::open(temp.path(), "../escape").await.is_err());
        assert!(DiskStore::open(temp.path(), "").await.is_err());
    }

    #[tokio::test]
    async fn test_disk_store_delete_removes_files() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path(), "c").await.unwrap();
        store.put("k", Response::ok("text/plain", "v")).await.unwrap();

        assert!(store.delete("k").await.unwrap());
        let leftover = std::fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
