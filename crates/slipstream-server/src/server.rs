//! Server state management and orchestration.
//!
//! [`AppState`] owns everything scoped to one running host: the device profile,
//! connection registry and cache, all reachable through the
//! [`FetchOrchestrator`]. It is built once at start and shared by the handlers.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::lifecycle;
use crate::metrics::ServerMetrics;
use slipstream_cache::{CacheStore, DiskStore, MemoryStore, ResponseStore};
use slipstream_fetch::{BaseProxy, DeviceProfiler, FetchConfig, FetchOrchestrator, HttpProxy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Shared application state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    orchestrator: FetchOrchestrator,

    /// Origin that relative URLs resolve against
    upstream: Option<Url>,

    /// Root of persistent cache generations
    cache_dir: Option<PathBuf>,

    metrics: ServerMetrics,

    /// Server start time (for metrics)
    started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("device", &self.orchestrator.device_class())
            .field("upstream", &self.upstream)
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create application state that forwards over HTTP.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the HTTP client, the cache or the orchestrator
    /// cannot be built.
    pub async fn new(config: &ServerConfig, fetch: FetchConfig) -> Result<Self, ServerError> {
        let proxy = Arc::new(HttpProxy::new()?);
        Self::with_proxy(config, fetch, proxy).await
    }

    /// Create application state around an existing proxy.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the cache or the orchestrator cannot be built.
    pub async fn with_proxy(
        config: &ServerConfig,
        fetch: FetchConfig,
        proxy: Arc<dyn BaseProxy>,
    ) -> Result<Self, ServerError> {
        fetch.validate()?;

        let cache = if fetch.cache_enabled {
            let store: Arc<dyn ResponseStore> = match &config.cache_dir {
                Some(dir) => {
                    tracing::info!("Opening cache {} under {}", fetch.cache_name, dir.display());
                    Arc::new(DiskStore::open(dir, &fetch.cache_name).await?)
                }
                None => {
                    tracing::info!("Using in-memory cache {}", fetch.cache_name);
                    Arc::new(MemoryStore::new())
                }
            };
            Some(CacheStore::new(
                fetch.cache_name.clone(),
                store,
                fetch.cache_limits(),
            )?)
        } else {
            tracing::info!("Response cache disabled");
            None
        };

        let profiler = Arc::new(DeviceProfiler::new(config.device_overrides()));
        let orchestrator = FetchOrchestrator::new(fetch, profiler, proxy, cache)?;

        tracing::info!(
            "Serving as {} device (registry capacity {})",
            orchestrator.device_class(),
            orchestrator.registry().capacity()
        );

        Ok(Self {
            orchestrator,
            upstream: config.upstream.clone(),
            cache_dir: config.cache_dir.clone(),
            metrics: ServerMetrics::new()?,
            started_at: Instant::now(),
        })
    }

    /// Get the fetch orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &FetchOrchestrator {
        &self.orchestrator
    }

    /// Get the metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Resolve a proxy target to an absolute http(s) URL.
    ///
    /// Absolute URLs are taken as is. Relative ones resolve against the
    /// upstream origin, if one is configured.
    #[must_use]
    pub fn resolve(&self, target: &str) -> Option<Url> {
        let url = match Url::parse(target) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.upstream.as_ref()?.join(target).ok()?
            }
            Err(_) => return None,
        };
        matches!(url.scheme(), "http" | "https").then_some(url)
    }

    /// Get server uptime in seconds.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Server orchestration.
pub struct Server {
    /// Shared application state
    state: Arc<AppState>,
    /// Server configuration
    config: ServerConfig,
}

impl Server {
    /// Create new server with configuration.
    ///
    /// Orchestration settings are read from the `SLIPSTREAM_*` environment.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the fetch configuration is invalid or the
    /// state cannot be built.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let fetch = FetchConfig::from_env()?;
        let state = AppState::new(&config, fetch).await?;

        Ok(Self {
            state: Arc::new(state),
            config,
        })
    }

    /// Run the install and activate steps, then serve until ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the server stops with an error.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Starting slipstream server");

        let stored = lifecycle::install(&self.state).await;
        let activation = lifecycle::activate(&self.state).await;
        tracing::info!(
            "Lifecycle complete: {stored} pre-cached, {} old generations removed, {} trimmed, {} expired",
            activation.removed_generations.len(),
            activation.trimmed,
            activation.expired
        );

        let bind = self.config.bind;
        crate::http::start_server(bind, self.state, shutdown_signal()).await?;

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Get shared application state.
    #[must_use]
    pub const fn state(&self) -> &Arc<AppState> {
        &self.state
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received, stopping server"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {e}"),
    }
}
