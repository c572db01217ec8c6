//! Prometheus metrics for the HTTP host.
//!
//! Counters and the latency histogram are updated by the handlers. Gauges
//! mirror the connection registry and are refreshed on every scrape.

use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use slipstream_fetch::ConnectionStats;

/// Metrics exported on `GET /metrics`.
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    registry: Registry,

    proxy_requests: IntCounterVec,
    proxy_duration: Histogram,
    control_messages: IntCounterVec,

    active_connections: IntGauge,
    requests_total: IntGauge,
    requests_successful: IntGauge,
    requests_failed: IntGauge,
    requests_retried: IntGauge,
    cache_hits: IntGauge,
    average_time_ms: Gauge,
}

impl ServerMetrics {
    /// Create and register every metric.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let proxy_requests = IntCounterVec::new(
            Opts::new(
                "slipstream_proxy_requests_total",
                "Proxy requests by outcome (ok, stale, error)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(proxy_requests.clone()))?;

        let proxy_duration = Histogram::with_opts(
            HistogramOpts::new(
                "slipstream_proxy_duration_seconds",
                "Time to answer a proxy request",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        )?;
        registry.register(Box::new(proxy_duration.clone()))?;

        let control_messages = IntCounterVec::new(
            Opts::new(
                "slipstream_control_messages_total",
                "Control-plane messages by type",
            ),
            &["type"],
        )?;
        registry.register(Box::new(control_messages.clone()))?;

        let active_connections = IntGauge::new(
            "slipstream_active_connections",
            "Requests currently tracked by the connection registry",
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let requests_total =
            IntGauge::new("slipstream_requests", "Network attempts admitted")?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_successful = IntGauge::new(
            "slipstream_requests_successful",
            "Network attempts that succeeded",
        )?;
        registry.register(Box::new(requests_successful.clone()))?;

        let requests_failed =
            IntGauge::new("slipstream_requests_failed", "Network attempts that failed")?;
        registry.register(Box::new(requests_failed.clone()))?;

        let requests_retried =
            IntGauge::new("slipstream_requests_retried", "Retries scheduled")?;
        registry.register(Box::new(requests_retried.clone()))?;

        let cache_hits = IntGauge::new("slipstream_cache_hits", "Responses served from cache")?;
        registry.register(Box::new(cache_hits.clone()))?;

        let average_time_ms = Gauge::new(
            "slipstream_average_time_ms",
            "Smoothed duration of successful attempts",
        )?;
        registry.register(Box::new(average_time_ms.clone()))?;

        Ok(Self {
            registry,
            proxy_requests,
            proxy_duration,
            control_messages,
            active_connections,
            requests_total,
            requests_successful,
            requests_failed,
            requests_retried,
            cache_hits,
            average_time_ms,
        })
    }

    /// Record one answered proxy request.
    pub fn record_proxy(&self, outcome: &str, seconds: f64) {
        self.proxy_requests.with_label_values(&[outcome]).inc();
        self.proxy_duration.observe(seconds);
    }

    /// Record one received control message.
    pub fn record_control(&self, kind: &str) {
        self.control_messages.with_label_values(&[kind]).inc();
    }

    /// Copy registry counters into the gauges.
    pub fn observe_stats(&self, stats: &ConnectionStats, active: usize) {
        self.active_connections.set(saturating_i64(active as u64));
        self.requests_total.set(saturating_i64(stats.total));
        self.requests_successful.set(saturating_i64(stats.successful));
        self.requests_failed.set(saturating_i64(stats.failed));
        self.requests_retried.set(saturating_i64(stats.retried));
        self.cache_hits.set(saturating_i64(stats.cached));
        self.average_time_ms.set(stats.average_time_ms);
    }

    /// Get Prometheus registry for serving metrics
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
