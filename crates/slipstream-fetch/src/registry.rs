//! Bookkeeping of in-flight and recently settled requests
//!
//! The registry never cancels work. It tracks which URLs are in flight, keeps
//! process-wide counters, and bounds its own memory by discarding tracking
//! entries: first those older than the connection timeout, then, when over
//! capacity, the least important settled ones (newest first within the lowest
//! tier). CRITICAL and still-pending entries are never discarded by the
//! capacity pass.
//!
//! The completed set is keyed by admission, so a retention timer always clears
//! its own mark even after the tracking entry was evicted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

use crate::config::FetchConfig;
use crate::device::DeviceClass;
use crate::patterns::{PriorityTier, UrlPatterns};

/// Weight of a new sample in the average load time
const EMA_ALPHA: f64 = 0.1;

/// Process-wide request counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub cached: u64,
    /// Exponential moving average of successful request time
    pub average_time_ms: f64,
    pub device_adjusted_timeouts: u64,
    pub slow_device_optimizations: u64,
}

/// One tracked request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub url: String,
    pub started_at: Instant,
    pub priority: PriorityTier,
    pub pending: bool,
    admission: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<String, ConnectionEntry>,
    /// url -> admission that settled it
    completed: HashMap<String, u64>,
    stats: ConnectionStats,
    next_admission: u64,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    patterns: UrlPatterns,
    device: DeviceClass,
    timeout_multiplier: f64,
    capacity: usize,
    entry_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(device: DeviceClass, config: &FetchConfig) -> Self {
        let entry_timeout = if device.is_slow_class() {
            config.connection_timeout * 2
        } else {
            config.connection_timeout
        };

        Self {
            state: Mutex::new(RegistryState::default()),
            patterns: config.patterns.clone(),
            device,
            timeout_multiplier: device.timeout_multiplier(&config.timeout_multipliers),
            capacity: device.registry_capacity(config.max_concurrent_connections),
            entry_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tracks `operation` for `url` and returns its output unchanged.
    pub async fn admit<F, T, E>(self: &Arc<Self>, url: &str, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let ticket = self.begin(url);
        let result = operation.await;
        ticket.finish(result.is_ok());
        result
    }

    /// Registers a request and returns the ticket that settles it.
    ///
    /// Dropping the ticket without calling [`AdmissionTicket::finish`] records
    /// a failure.
    pub fn begin(self: &Arc<Self>, url: &str) -> AdmissionTicket {
        let now = Instant::now();
        let priority = self.patterns.priority(url);

        let admission = {
            let mut state = self.state.lock();
            state.next_admission += 1;
            let admission = state.next_admission;

            state.stats.total += 1;
            if self.device.is_slow_class() {
                state.stats.slow_device_optimizations += 1;
            }
            if (self.timeout_multiplier - 1.0).abs() > f64::EPSILON {
                state.stats.device_adjusted_timeouts += 1;
            }

            state.completed.remove(url);
            state.active.insert(
                url.to_string(),
                ConnectionEntry {
                    url: url.to_string(),
                    started_at: now,
                    priority,
                    pending: true,
                    admission,
                },
            );

            self.cleanup_locked(&mut state, now);
            admission
        };

        AdmissionTicket {
            registry: Arc::clone(self),
            url: url.to_string(),
            admission,
            started_at: now,
            settled: false,
        }
    }

    fn settle(self: &Arc<Self>, url: &str, admission: u64, elapsed: Duration, success: bool) {
        {
            let mut state = self.state.lock();
            if success {
                state.stats.successful += 1;
                let sample = elapsed.as_secs_f64() * 1000.0;
                state.stats.average_time_ms =
                    state.stats.average_time_ms * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA;
            } else {
                state.stats.failed += 1;
            }

            if let Some(entry) = state.active.get_mut(url)
                && entry.admission == admission
            {
                entry.pending = false;
            }
            // A newer admission for the same URL is still in flight
            let superseded = state
                .active
                .get(url)
                .is_some_and(|entry| entry.admission > admission);
            if !superseded {
                state.completed.insert(url.to_string(), admission);
            }
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry: Weak<Self> = Arc::downgrade(self);
        let retention = self.device.completed_retention();
        let url = url.to_string();
        handle.spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(registry) = registry.upgrade() {
                registry.forget(&url, admission);
            }
        });
    }

    /// Drops whatever `admission` still owns for `url`: its tracking entry, if
    /// not evicted yet, and its completed mark.
    fn forget(&self, url: &str, admission: u64) {
        let mut state = self.state.lock();
        let owned = state
            .active
            .get(url)
            .is_some_and(|entry| entry.admission == admission && !entry.pending);
        if owned {
            state.active.remove(url);
        }
        if state.completed.get(url) == Some(&admission) {
            state.completed.remove(url);
        }
    }

    /// Removes timed-out entries, then evicts down to capacity.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        self.cleanup_locked(&mut state, Instant::now());
    }

    fn cleanup_locked(&self, state: &mut RegistryState, now: Instant) {
        let timeout = self.entry_timeout;
        let before = state.active.len();
        state
            .active
            .retain(|_, entry| now.saturating_duration_since(entry.started_at) <= timeout);
        let timed_out = before - state.active.len();

        if state.active.len() <= self.capacity {
            if timed_out > 0 {
                debug!("Registry dropped {timed_out} timed-out entries");
            }
            return;
        }

        let excess = state.active.len() - self.capacity;
        let mut eligible: Vec<(PriorityTier, Instant, String)> = state
            .active
            .values()
            .filter(|entry| entry.priority != PriorityTier::Critical && !entry.pending)
            .map(|entry| (entry.priority, entry.started_at, entry.url.clone()))
            .collect();
        // Lowest tier first, newest first within a tier
        eligible.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));

        let mut evicted = 0;
        for (_, _, url) in eligible.into_iter().take(excess) {
            state.active.remove(&url);
            evicted += 1;
        }

        debug!(
            "Registry dropped {timed_out} timed-out and evicted {evicted} entries (capacity {})",
            self.capacity
        );
    }

    pub fn record_retry(&self) {
        self.state.lock().stats.retried += 1;
    }

    pub fn record_cache_hit(&self) {
        self.state.lock().stats.cached += 1;
    }

    pub fn stats(&self) -> ConnectionStats {
        self.state.lock().stats.clone()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn entry(&self, url: &str) -> Option<ConnectionEntry> {
        self.state.lock().active.get(url).cloned()
    }

    pub fn is_completed(&self, url: &str) -> bool {
        self.state.lock().completed.contains_key(url)
    }
}

/// Settles one admission exactly once.
#[derive(Debug)]
pub struct AdmissionTicket {
    registry: Arc<ConnectionRegistry>,
    url: String,
    admission: u64,
    started_at: Instant,
    settled: bool,
}

impl AdmissionTicket {
    pub fn finish(mut self, success: bool) {
        self.settle(success);
    }

    fn settle(&mut self, success: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.registry.settle(
            &self.url,
            self.admission,
            self.started_at.elapsed(),
            success,
        );
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.settle(false);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn registry(device: DeviceClass, max_connections: usize) -> Arc<ConnectionRegistry> {
        let config = FetchConfig {
            max_concurrent_connections: max_connections,
            ..FetchConfig::default()
        };
        Arc::new(ConnectionRegistry::new(device, &config))
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_counts_and_averages() {
        let registry = registry(DeviceClass::Medium, 150);

        let ok: Result<u32, &str> = registry
            .admit("https://a/app.js", async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(7)
            })
            .await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, &str> = registry.admit("https://a/b.js", async { Err("boom") }).await;
        assert_eq!(err, Err("boom"));

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.average_time_ms - 10.0).abs() < 1.0);
        assert_eq!(stats.slow_device_optimizations, 0);
        assert_eq!(stats.device_adjusted_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_device_accounting_and_retention() {
        let registry = registry(DeviceClass::Slow, 150);
        let _: Result<(), ()> = registry.admit("https://a/x.css", async { Ok(()) }).await;

        let stats = registry.stats();
        assert_eq!(stats.slow_device_optimizations, 1);
        assert_eq!(stats.device_adjusted_timeouts, 1);
        assert!(registry.is_completed("https://a/x.css"));
        assert!(!registry.entry("https://a/x.css").unwrap().pending);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(registry.entry("https://a/x.css").is_some());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(registry.entry("https://a/x.css").is_none());
        assert!(!registry.is_completed("https://a/x.css"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_spares_critical_and_pending() {
        let registry = registry(DeviceClass::Fast, 3);

        registry.begin("https://a/game.wasm").finish(true);
        tokio::time::advance(Duration::from_millis(1)).await;
        registry.begin("https://a/old.txt").finish(true);
        tokio::time::advance(Duration::from_millis(1)).await;
        registry.begin("https://a/new.txt").finish(true);
        tokio::time::advance(Duration::from_millis(1)).await;
        let pending = registry.begin("https://a/song.mp3");

        // Four entries, capacity three: the newest settled LOW entry goes
        assert_eq!(registry.active_count(), 3);
        assert!(registry.entry("https://a/new.txt").is_none());
        assert!(registry.entry("https://a/old.txt").is_some());
        assert!(registry.entry("https://a/game.wasm").is_some());
        assert!(registry.entry("https://a/song.mp3").unwrap().pending);

        registry.begin("https://a/style.css").finish(true);
        assert!(registry.entry("https://a/old.txt").is_none());
        assert!(registry.entry("https://a/style.css").is_some());
        assert!(registry.entry("https://a/game.wasm").is_some());

        drop(pending);
        assert_eq!(registry.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_marks_expire_after_eviction() {
        let registry = registry(DeviceClass::Fast, 3);

        let urls: Vec<String> = (0..100).map(|i| format!("https://a/file-{i}.txt")).collect();
        for url in &urls {
            registry.begin(url).finish(true);
        }
        assert_eq!(registry.active_count(), 3);
        assert!(registry.is_completed(&urls[0]));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(registry.active_count(), 0);
        assert!(urls.iter().all(|url| !registry.is_completed(url)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmission_keeps_newer_completed_mark() {
        let registry = registry(DeviceClass::Fast, 150);
        let url = "https://a/app.js";

        registry.begin(url).finish(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        registry.begin(url).finish(true);

        // First retention timer fires; the second admission still owns the mark
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(registry.is_completed(url));
        assert!(registry.entry(url).is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!registry.is_completed(url));
        assert!(registry.entry(url).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleanup() {
        let registry = registry(DeviceClass::Medium, 150);
        let _ticket = registry.begin("https://a/hung.js");

        tokio::time::advance(Duration::from_secs(121)).await;
        registry.cleanup();
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let json = serde_json::to_value(ConnectionStats::default()).unwrap();
        assert!(json.get("averageTimeMs").is_some());
        assert!(json.get("slowDeviceOptimizations").is_some());
    }
}
