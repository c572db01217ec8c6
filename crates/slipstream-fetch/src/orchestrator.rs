//! The request state machine
//!
//! ```text
//! BypassCheck ──bypass──▶ BaseProxy
//!      │
//! CacheLookup ──hit──▶ serve (+ detached revalidation on medium/fast devices)
//!      │ miss
//! NetworkFetch ◀──────────────┐
//!      │ ok            │ err  │
//! StoreAndAugment   RetryWait ┘ (retry_count times)
//!                      │ exhausted
//!                StaleFallback ──▶ stale entry or error
//! ```
//!
//! Every network attempt runs under its own timeout, scaled by priority and
//! device class, and is tracked by the [`ConnectionRegistry`]. Background work
//! (revalidation, maintenance) is spawned detached and never awaited by the
//! response path.

use futures::stream::{self, StreamExt};
use rand::{RngExt, rng};
use slipstream_cache::{CacheStore, Response, now_millis};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::augment::augment;
use crate::config::FetchConfig;
use crate::device::{DeviceClass, DeviceProfile, DeviceProfiler};
use crate::diagnostics::error_page;
use crate::error::{FetchError, Result};
use crate::patterns::PriorityTier;
use crate::proxy::{BaseProxy, FetchOptions, PriorityHint, ProxyRequest};
use crate::registry::{ConnectionRegistry, ConnectionStats};

/// Concurrent pre-cache fetches on medium and fast devices.
const PRECACHE_CONCURRENCY: usize = 4;

/// `duration * factor`, saturating instead of panicking on overflow.
fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Shared per-service state and the fetch state machine over it.
///
/// Cloning is cheap; clones share the profile, registry, cache and proxy.
#[derive(Clone)]
pub struct FetchOrchestrator {
    config: Arc<FetchConfig>,
    profiler: Arc<DeviceProfiler>,
    registry: Arc<ConnectionRegistry>,
    cache: Option<CacheStore>,
    proxy: Arc<dyn BaseProxy>,
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("device", &self.profiler.class())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl FetchOrchestrator {
    /// `cache` is ignored when caching is disabled in `config`.
    pub fn new(
        config: FetchConfig,
        profiler: Arc<DeviceProfiler>,
        proxy: Arc<dyn BaseProxy>,
        cache: Option<CacheStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ConnectionRegistry::new(profiler.class(), &config));
        let cache = cache.filter(|_| config.cache_enabled);

        Ok(Self {
            config: Arc::new(config),
            profiler,
            registry,
            cache,
            proxy,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn profile(&self) -> &DeviceProfile {
        self.profiler.profile()
    }

    pub fn device_class(&self) -> DeviceClass {
        self.profiler.class()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> ConnectionStats {
        self.registry.stats()
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    pub fn proxy(&self) -> &Arc<dyn BaseProxy> {
        &self.proxy
    }

    fn is_cacheable(&self, request: &ProxyRequest) -> bool {
        self.cache.is_some()
            && request.method.eq_ignore_ascii_case("GET")
            && self.config.patterns.is_cacheable(&request.url)
    }

    /// Per-attempt timeout for a priority on this device.
    pub fn effective_timeout(&self, priority: PriorityTier) -> Duration {
        let base = if priority == PriorityTier::Critical {
            self.config.fetch_timeout
        } else {
            (self.config.fetch_timeout / 2).min(self.config.non_critical_timeout_cap)
        };
        let multiplier = self
            .device_class()
            .timeout_multiplier(&self.config.timeout_multipliers);
        scale(base, multiplier)
    }

    /// Wait before retry number `retry` (0 for the first retry).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.device_class().backoff_multiplier()
            * self.config.backoff_multiplier.powi(exponent);
        scale(self.config.retry_delay, factor)
    }

    /// Runs a request through the full state machine.
    pub async fn fetch(&self, request: &ProxyRequest) -> Result<Response> {
        if self.config.patterns.is_bypass(&request.url) {
            debug!("Bypassing orchestration for {}", request.url);
            return self.proxy.fetch(request, FetchOptions::default()).await;
        }

        let cacheable = self.is_cacheable(request);
        let key = request.cache_key();

        if cacheable && let Some(hit) = self.serve_cached(request, &key).await {
            return Ok(hit);
        }

        self.fetch_with_retry(request, &key, cacheable).await
    }

    /// Like [`FetchOrchestrator::fetch`], with the last-resort handling for
    /// requests that exhausted every fallback.
    ///
    /// Navigations get a diagnostic page. Sub-resources get one final direct
    /// proxy call whose outcome is returned as is.
    pub async fn respond(&self, request: &ProxyRequest) -> Result<Response> {
        match self.fetch(request).await {
            Ok(response) => Ok(response),
            Err(e) if request.navigate => {
                error!(
                    "Navigation to {} failed on {} device: {e}",
                    request.url,
                    self.device_class()
                );
                Ok(error_page(&e, self.profile(), &self.stats()))
            }
            Err(e) => {
                warn!("Final direct attempt for {} after: {e}", request.url);
                self.proxy.fetch(request, FetchOptions::default()).await
            }
        }
    }

    async fn serve_cached(&self, request: &ProxyRequest, key: &str) -> Option<Response> {
        let cache = self.cache.as_ref()?;
        let mut hit = match cache.get(key).await {
            Ok(hit) => hit?,
            Err(e) => {
                warn!("Cache lookup failed for {key}: {e}");
                return None;
            }
        };

        let count = match cache.record_access(key).await {
            Ok(Some(count)) => count,
            // Removed since the lookup
            Ok(None) => hit.metadata().access_count.saturating_add(1),
            Err(e) => {
                warn!("Failed to update access count for {key}: {e}");
                hit.metadata().access_count.saturating_add(1)
            }
        };
        hit.set_access_count(count);
        self.registry.record_cache_hit();

        if !self.device_class().is_slow_class() {
            self.spawn_revalidation(request.clone());
        }

        debug!("Cache hit for {key} (access count {count})");
        Some(hit)
    }

    fn spawn_revalidation(&self, request: ProxyRequest) {
        let this = self.clone();
        tokio::spawn(async move {
            let priority = this.config.patterns.priority(&request.url);
            let timeout = this.effective_timeout(priority);
            match this.attempt(&request, priority, timeout).await {
                Ok(fresh) if fresh.is_success() => {
                    this.store(&request, &request.cache_key(), fresh).await;
                    debug!("Revalidated {}", request.url);
                }
                Ok(fresh) => debug!("Revalidation of {} returned {}", request.url, fresh.status),
                Err(e) => debug!("Revalidation of {} failed: {e}", request.url),
            }
        });
    }

    /// One network attempt under a cancellation token armed for `timeout`.
    async fn attempt(
        &self,
        request: &ProxyRequest,
        priority: PriorityTier,
        timeout: Duration,
    ) -> Result<Response> {
        let cancel = CancellationToken::new();
        let options = FetchOptions {
            cancel: cancel.clone(),
            priority: if priority == PriorityTier::Critical {
                PriorityHint::High
            } else {
                PriorityHint::Auto
            },
        };

        tokio::select! {
            result = self.proxy.fetch(request, options) => result,
            () = tokio::time::sleep(timeout) => {
                cancel.cancel();
                Err(FetchError::Timeout(timeout))
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        request: &ProxyRequest,
        key: &str,
        cacheable: bool,
    ) -> Result<Response> {
        let device = self.device_class();
        let priority = self.config.patterns.priority(&request.url);
        let timeout = self.effective_timeout(priority);
        let max_attempts = self.config.retry_count.saturating_add(1);

        let mut attempts = 0;
        let last_error = loop {
            if attempts > 0 {
                let delay = self.retry_delay(attempts - 1);
                info!(
                    "Retrying {} ({} attempts left) after {delay:?} on {device} device",
                    request.url,
                    max_attempts - attempts
                );
                self.registry.record_retry();
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            let result = self
                .registry
                .admit(&request.url, self.attempt(request, priority, timeout))
                .await;

            match result {
                Ok(response) => return Ok(self.complete(request, key, cacheable, response).await),
                Err(e) if !e.should_retry() || attempts >= max_attempts => break e,
                Err(e) => warn!("Fetch of {} failed on {device} device: {e}", request.url),
            }
        };

        error!(
            "Giving up on {} after {attempts} attempts on {device} device: {last_error}",
            request.url
        );

        if let Some(stale) = self.stale_fallback(key).await {
            return Ok(stale);
        }

        Err(FetchError::Exhausted {
            attempts,
            last: Box::new(last_error),
        })
    }

    async fn stale_fallback(&self, key: &str) -> Option<Response> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(Some(mut stale)) => {
                info!("Serving stale cached response for {key}");
                stale.mark_stale();
                Some(stale)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Stale fallback lookup failed for {key}: {e}");
                None
            }
        }
    }

    /// Success path: store, maybe maintain, maybe augment.
    async fn complete(
        &self,
        request: &ProxyRequest,
        key: &str,
        cacheable: bool,
        response: Response,
    ) -> Response {
        if cacheable && response.is_success() {
            self.store(request, key, response.clone()).await;

            let probability = if self.device_class().is_slow_class() {
                self.config.slow_maintenance_probability
            } else {
                self.config.maintenance_probability
            };
            if rng().random::<f64>() < probability {
                self.spawn_maintenance();
            }
        }

        if response.is_html() && self.config.patterns.is_game_content(&request.url) {
            match augment(response.clone(), self.profile(), now_millis()) {
                Ok(augmented) => return augmented,
                Err(e) => warn!("Serving {} unmodified, augmentation failed: {e}", request.url),
            }
        }

        response
    }

    async fn store(&self, request: &ProxyRequest, key: &str, mut response: Response) {
        let Some(cache) = &self.cache else {
            return;
        };
        let game_content = self.config.patterns.is_game_content(&request.url);
        response.stamp_fresh(now_millis(), game_content);
        if let Err(e) = cache.put(key, response).await {
            warn!("Failed to cache {key}: {e}");
        }
    }

    /// Runs trim then expire now. Returns `(trimmed, expired)`.
    pub async fn run_maintenance(&self) -> (usize, usize) {
        match &self.cache {
            Some(cache) => cache.maintain(self.device_class().is_slow_class()).await,
            None => (0, 0),
        }
    }

    /// Runs maintenance on a detached task.
    pub fn spawn_maintenance(&self) {
        if self.cache.is_none() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let (trimmed, expired) = this.run_maintenance().await;
            debug!("Background maintenance trimmed {trimmed}, expired {expired}");
        });
    }

    /// Fetches each URL once and caches the successes. Returns how many were
    /// stored.
    pub async fn precache(&self, urls: &[String]) -> usize {
        if self.cache.is_none() {
            return 0;
        }

        // Slow devices pre-cache one resource at a time
        let concurrency = if self.device_class().is_slow_class() {
            1
        } else {
            PRECACHE_CONCURRENCY
        };

        let stored = stream::iter(urls)
            .map(|url| async move {
                let request = ProxyRequest::get(url.clone());
                let priority = self.config.patterns.priority(url);
                match self
                    .attempt(&request, priority, self.effective_timeout(priority))
                    .await
                {
                    Ok(response) if response.is_success() => {
                        self.store(&request, &request.cache_key(), response).await;
                        true
                    }
                    Ok(response) => {
                        warn!("Pre-cache of {url} returned {}", response.status);
                        false
                    }
                    Err(e) => {
                        warn!("Pre-cache of {url} failed: {e}");
                        false
                    }
                }
            })
            .buffer_unordered(concurrency)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        info!("Pre-cached {stored}/{} resources", urls.len());
        stored
    }
}
