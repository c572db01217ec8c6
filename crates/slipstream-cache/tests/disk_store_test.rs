//! Persistent store behaviour across reopen, trim and generation purge
#![allow(clippy::unwrap_used, clippy::expect_used)]

use pretty_assertions::assert_eq;
use slipstream_cache::{
    CacheLimits, CacheStore, DiskStore, Response, ResponseStore, purge_stale_generations,
    request_key,
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

fn limits(max_entries: usize) -> CacheLimits {
    CacheLimits {
        max_entries,
        max_age: Duration::from_secs(7 * 24 * 3600),
    }
}

#[tokio::test]
async fn entries_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let key = request_key("GET", "https://cdn.example.com/Build/game.data");

    {
        let store = DiskStore::open(temp.path(), "assets-v2").await.unwrap();
        let mut response = Response::ok("application/octet-stream", vec![7u8; 1024]);
        response.stamp_fresh(1_000, true);
        store.put(&key, response).await.unwrap();
    }

    let reopened = DiskStore::open(temp.path(), "assets-v2").await.unwrap();
    assert_eq!(reopened.keys().await.unwrap(), vec![key.clone()]);

    let loaded = reopened.get(&key).await.unwrap().unwrap();
    assert_eq!(loaded.body.len(), 1024);
    let meta = loaded.metadata();
    assert_eq!(meta.stored_at_ms, 1_000);
    assert!(meta.is_game_content);
}

#[tokio::test]
async fn leftover_temp_files_are_ignored_on_open() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("assets-v2");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("deadbeef.meta.tmp"), b"{partial").unwrap();

    let store = DiskStore::open(temp.path(), "assets-v2").await.unwrap();
    assert!(store.is_empty().await.unwrap());
    assert!(!dir.join("deadbeef.meta.tmp").exists());
}

#[tokio::test]
async fn trim_converges_on_disk_store() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(DiskStore::open(temp.path(), "assets-v2").await.unwrap());
    let cache = CacheStore::new("assets-v2", store, limits(10)).unwrap();

    for i in 0..16u64 {
        let mut response = Response::ok("text/javascript", format!("// {i}"));
        response.stamp_fresh(1_000 + i, false);
        cache
            .put(&request_key("GET", &format!("https://a/{i}.js")), response)
            .await
            .unwrap();
    }

    // Slow device sheds half the overflow per pass: 6 -> 3 removed, then 1 more
    // per pass once the overflow is small
    assert_eq!(cache.trim(true).await, 3);
    for _ in 0..10 {
        cache.trim(true).await;
    }
    assert_eq!(cache.len().await.unwrap(), 10);

    // Oldest entries went first
    assert!(cache.get(&request_key("GET", "https://a/0.js")).await.unwrap().is_none());
    assert!(cache.get(&request_key("GET", "https://a/15.js")).await.unwrap().is_some());
}

#[tokio::test]
async fn purge_removes_only_sibling_generations() {
    let temp = TempDir::new().unwrap();
    for name in ["slipstream-cache-v1", "slipstream-cache-v2", "unrelated"] {
        DiskStore::open(temp.path(), name).await.unwrap();
    }

    let mut removed = purge_stale_generations(temp.path(), "slipstream-cache", "slipstream-cache-v2")
        .await
        .unwrap();
    removed.sort();

    assert_eq!(removed, vec!["slipstream-cache-v1".to_string()]);
    assert!(temp.path().join("slipstream-cache-v2").exists());
    assert!(temp.path().join("unrelated").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_to_one_key_stay_consistent() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(DiskStore::open(temp.path(), "assets-v2").await.unwrap());

    for _ in 0..50 {
        let writers: Vec<_> = (0..4u8)
            .map(|writer| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut response = Response::ok("application/octet-stream", vec![writer; 4096]);
                    response.headers.insert("x-writer", writer.to_string());
                    store.put("k", response).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let loaded = store.get("k").await.unwrap().unwrap();
        let writer: u8 = loaded.headers.get("x-writer").unwrap().parse().unwrap();
        assert_eq!(loaded.body.len(), 4096);
        assert!(loaded.body.iter().all(|b| *b == writer));
    }

    // Only the final pair of files remains
    let files = std::fs::read_dir(store.dir()).unwrap().count();
    assert_eq!(files, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn access_counts_update_without_touching_the_body() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(DiskStore::open(temp.path(), "assets-v2").await.unwrap());

    let mut response = Response::ok("application/wasm", vec![1u8; 2048]);
    response.stamp_fresh(5_000, true);
    store.put("game", response).await.unwrap();

    let body_file = std::fs::read_dir(store.dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| path.extension().is_some_and(|ext| ext == "body"))
        .unwrap();
    let body_written = std::fs::metadata(&body_file).unwrap().modified().unwrap();

    let hits: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..10 {
                    store.record_access("game").await.unwrap().unwrap();
                }
            })
        })
        .collect();
    for hit in hits {
        hit.await.unwrap();
    }

    let meta = store.metadata("game").await.unwrap().unwrap();
    assert_eq!(meta.access_count, 41);
    assert_eq!(meta.stored_at_ms, 5_000);
    assert!(meta.is_game_content);
    assert_eq!(
        std::fs::metadata(&body_file).unwrap().modified().unwrap(),
        body_written
    );
    assert_eq!(store.record_access("missing").await.unwrap(), None);
}
