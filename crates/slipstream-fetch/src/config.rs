//! Configuration for the fetch orchestrator

use serde::{Deserialize, Serialize};
use slipstream_cache::CacheLimits;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FetchError, Result};
use crate::patterns::UrlPatterns;

/// Per-class multipliers applied to fetch timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutMultipliers {
    pub very_slow: f64,
    pub slow: f64,
    pub fast: f64,
}

impl Default for TimeoutMultipliers {
    fn default() -> Self {
        Self {
            very_slow: 4.0,
            slow: 2.5,
            fast: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Timeout for CRITICAL fetches before device scaling
    pub fetch_timeout: Duration,

    /// Upper bound on the base timeout of non-CRITICAL fetches
    pub non_critical_timeout_cap: Duration,

    /// Retries after the first attempt
    pub retry_count: u32,

    /// Delay before the first retry, before device scaling
    pub retry_delay: Duration,

    /// Growth factor between successive retry delays
    pub backoff_multiplier: f64,

    pub cache_enabled: bool,
    pub cache_name: String,

    /// Maximum number of cached entries
    pub max_cache_size: usize,

    /// Base time-to-live of cached entries
    pub max_cache_age: Duration,

    pub timeout_multipliers: TimeoutMultipliers,
    pub patterns: UrlPatterns,

    /// Connection registry capacity on medium and fast devices
    pub max_concurrent_connections: usize,

    /// Age after which registry entries are dropped
    pub connection_timeout: Duration,

    /// Chance that a cached store triggers background maintenance
    pub maintenance_probability: f64,

    /// Same, on slow-class devices
    pub slow_maintenance_probability: f64,

    /// URLs fetched into the cache on install
    pub precache: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(600),
            non_critical_timeout_cap: Duration::from_secs(180),
            retry_count: 12,
            retry_delay: Duration::from_millis(1000),
            backoff_multiplier: 1.5,
            cache_enabled: true,
            cache_name: "slipstream-slow-device-cache-v2".to_string(),
            max_cache_size: 2000,
            max_cache_age: Duration::from_secs(7 * 24 * 3600),
            timeout_multipliers: TimeoutMultipliers::default(),
            patterns: UrlPatterns::default(),
            max_concurrent_connections: 150,
            connection_timeout: Duration::from_secs(120),
            maintenance_probability: 0.01,
            slow_maintenance_probability: 0.005,
            precache: Vec::new(),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl FetchConfig {
    /// Create configuration from `SLIPSTREAM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup` on the defaults.
    ///
    /// Unparseable values fall back to the default for that field.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            fetch_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SLIPSTREAM_FETCH_TIMEOUT",
                defaults.fetch_timeout.as_secs(),
            )),
            non_critical_timeout_cap: Duration::from_secs(parse_or(
                &lookup,
                "SLIPSTREAM_NON_CRITICAL_TIMEOUT_CAP",
                defaults.non_critical_timeout_cap.as_secs(),
            )),
            retry_count: parse_or(&lookup, "SLIPSTREAM_RETRY_COUNT", defaults.retry_count),
            retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "SLIPSTREAM_RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )),
            backoff_multiplier: parse_or(
                &lookup,
                "SLIPSTREAM_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
            cache_enabled: parse_or(&lookup, "SLIPSTREAM_CACHE_ENABLED", defaults.cache_enabled),
            cache_name: lookup("SLIPSTREAM_CACHE_NAME").unwrap_or(defaults.cache_name),
            max_cache_size: parse_or(&lookup, "SLIPSTREAM_MAX_CACHE_SIZE", defaults.max_cache_size),
            max_cache_age: Duration::from_secs(parse_or(
                &lookup,
                "SLIPSTREAM_MAX_CACHE_AGE",
                defaults.max_cache_age.as_secs(),
            )),
            timeout_multipliers: TimeoutMultipliers {
                very_slow: parse_or(
                    &lookup,
                    "SLIPSTREAM_VERY_SLOW_TIMEOUT_MULTIPLIER",
                    defaults.timeout_multipliers.very_slow,
                ),
                slow: parse_or(
                    &lookup,
                    "SLIPSTREAM_SLOW_TIMEOUT_MULTIPLIER",
                    defaults.timeout_multipliers.slow,
                ),
                fast: parse_or(
                    &lookup,
                    "SLIPSTREAM_FAST_TIMEOUT_MULTIPLIER",
                    defaults.timeout_multipliers.fast,
                ),
            },
            patterns: defaults.patterns,
            max_concurrent_connections: parse_or(
                &lookup,
                "SLIPSTREAM_MAX_CONNECTIONS",
                defaults.max_concurrent_connections,
            ),
            connection_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SLIPSTREAM_CONNECTION_TIMEOUT",
                defaults.connection_timeout.as_secs(),
            )),
            maintenance_probability: parse_or(
                &lookup,
                "SLIPSTREAM_MAINTENANCE_PROBABILITY",
                defaults.maintenance_probability,
            ),
            slow_maintenance_probability: parse_or(
                &lookup,
                "SLIPSTREAM_SLOW_MAINTENANCE_PROBABILITY",
                defaults.slow_maintenance_probability,
            ),
            precache: lookup("SLIPSTREAM_PRECACHE")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.precache),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(FetchError::InvalidConfiguration(msg.to_string()));

        if self.fetch_timeout.is_zero() {
            return invalid("fetch_timeout must be greater than 0");
        }
        if self.max_cache_size == 0 {
            return invalid("max_cache_size must be greater than 0");
        }
        if self.max_cache_age.is_zero() {
            return invalid("max_cache_age must be greater than 0");
        }
        if self.cache_name.trim().is_empty() {
            return invalid("cache_name must not be empty");
        }
        if self.max_concurrent_connections == 0 {
            return invalid("max_concurrent_connections must be greater than 0");
        }

        let m = &self.timeout_multipliers;
        for value in [m.very_slow, m.slow, m.fast] {
            if !value.is_finite() || value <= 0.0 {
                return invalid("timeout multipliers must be finite and positive");
            }
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier must be finite and at least 1.0");
        }
        for p in [self.maintenance_probability, self.slow_maintenance_probability] {
            if !(0.0..=1.0).contains(&p) {
                return invalid("maintenance probabilities must be within [0, 1]");
            }
        }

        Ok(())
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.max_cache_size,
            max_age: self.max_cache_age,
        }
    }

    /// Name shared by every cache generation, used to find old generations.
    ///
    /// This is the cache name with a trailing `-v<N>` generation suffix removed.
    pub fn cache_prefix(&self) -> &str {
        match self.cache_name.rsplit_once("-v") {
            Some((prefix, generation))
                if !generation.is_empty() && generation.chars().all(|c| c.is_ascii_digit()) =>
            {
                prefix
            }
            _ => &self.cache_name,
        }
    }
}
