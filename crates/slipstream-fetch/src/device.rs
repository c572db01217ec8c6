//! Device performance profiling
//!
//! A [`DeviceProfile`] is computed once per [`DeviceProfiler`] from hardware
//! signals, connection metadata, user-agent hints and two short benchmarks.
//! Classification itself ([`classify`]) is a pure function of the gathered
//! [`DeviceSignals`], so it can be tested without touching the host.
//!
//! Scoring averages five sub-scores:
//!
//! | Sub-score | Formula | Range |
//! |---|---|---|
//! | hardware | cores/8 + memory/8 | 0-2 |
//! | benchmark | ops per ms / 500 | 0-2 |
//! | connection | 0 very slow, 0.5 slow, else 1 | 0-1 |
//! | device type | 0.2 old, 0.6 mobile, 0.7 chromebook, else 1 | 0.2-1 |
//! | memory pressure | 50 / sort duration ms | 0.1-2 |

use rand::{RngExt, rng};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TimeoutMultipliers;

/// Wall time of the CPU benchmark loop
pub const CPU_BENCHMARK_WINDOW: Duration = Duration::from_millis(10);
/// Element count of the memory benchmark sort
pub const MEMORY_BENCHMARK_ELEMENTS: usize = 10_000;
/// Memory-pressure score used when the allocation benchmark cannot run
pub const MEMORY_BENCHMARK_FALLBACK: f64 = 0.5;

/// Used when the host does not report memory
const DEFAULT_MEMORY_GB: f64 = 2.0;

const MOBILE_PATTERN: &str = r"Android|webOS|iPhone|iPad|iPod|BlackBerry|IEMobile|Opera Mini";
const OLD_DEVICE_PATTERN: &str =
    r"Windows NT [45]\.|OS X 10\.[0-9]\.|iPhone OS [0-9]_|Android [0-4]\.";

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Invalid device pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Benchmark failed: {0}")]
    Benchmark(String),
}

/// Performance class of the serving device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    VerySlow,
    Slow,
    Medium,
    Fast,
}

impl DeviceClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VerySlow => "very-slow",
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
        }
    }

    /// Slow or very slow
    pub const fn is_slow_class(self) -> bool {
        matches!(self, Self::VerySlow | Self::Slow)
    }

    pub fn timeout_multiplier(self, multipliers: &TimeoutMultipliers) -> f64 {
        match self {
            Self::VerySlow => multipliers.very_slow,
            Self::Slow => multipliers.slow,
            Self::Fast => multipliers.fast,
            Self::Medium => 1.0,
        }
    }

    /// Scale applied to retry delays
    pub const fn backoff_multiplier(self) -> f64 {
        match self {
            Self::VerySlow => 2.0,
            Self::Slow => 1.5,
            Self::Medium | Self::Fast => 1.0,
        }
    }

    /// Connection registry capacity, given the configured default.
    pub const fn registry_capacity(self, default: usize) -> usize {
        match self {
            Self::VerySlow => 50,
            Self::Slow => 100,
            Self::Medium | Self::Fast => default,
        }
    }

    /// How long a settled request stays in the registry
    pub const fn completed_retention(self) -> Duration {
        if self.is_slow_class() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(15)
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network connection metadata as reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// `slow-2g`, `2g`, `3g` or `4g`
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<f64>,
}

impl ConnectionInfo {
    pub fn is_slow(&self) -> bool {
        matches!(self.effective_type.as_deref(), Some("slow-2g" | "2g"))
            || self.downlink_mbps.is_some_and(|d| d < 1.5)
            || self.rtt_ms.is_some_and(|r| r > 300.0)
    }

    pub fn is_very_slow(&self) -> bool {
        self.effective_type.as_deref() == Some("slow-2g")
            || self.downlink_mbps.is_some_and(|d| d < 0.5)
            || self.rtt_ms.is_some_and(|r| r > 800.0)
    }
}

/// Device-type hints parsed from a user agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHints {
    pub is_mobile: bool,
    pub is_chromebook: bool,
    pub is_old_device: bool,
}

impl DeviceHints {
    pub fn from_user_agent(user_agent: &str) -> Result<Self, DetectionError> {
        let mobile = RegexBuilder::new(MOBILE_PATTERN)
            .case_insensitive(true)
            .build()?;
        let old = RegexBuilder::new(OLD_DEVICE_PATTERN)
            .case_insensitive(true)
            .build()?;

        let is_chromebook = user_agent.contains("CrOS")
            || (user_agent.contains("Chrome")
                && user_agent.contains("Linux")
                && !user_agent.contains("Android"));

        Ok(Self {
            is_mobile: mobile.is_match(user_agent),
            is_chromebook,
            is_old_device: old.is_match(user_agent),
        })
    }

    fn score(self) -> f64 {
        if self.is_old_device {
            0.2
        } else if self.is_mobile {
            0.6
        } else if self.is_chromebook {
            0.7
        } else {
            1.0
        }
    }
}

/// Everything classification depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSignals {
    pub cores: usize,
    pub memory_gb: f64,
    pub connection: Option<ConnectionInfo>,
    pub hints: DeviceHints,
    /// CPU benchmark result in operations per millisecond
    pub benchmark: f64,
    /// Memory-pressure score, 1.0 when not measured
    pub memory_pressure: f64,
}

impl DeviceSignals {
    pub fn new(cores: usize, memory_gb: f64, benchmark: f64) -> Self {
        Self {
            cores,
            memory_gb,
            connection: None,
            hints: DeviceHints::default(),
            benchmark,
            memory_pressure: 1.0,
        }
    }

    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = Some(connection);
        self
    }

    #[must_use]
    pub fn with_hints(mut self, hints: DeviceHints) -> Self {
        self.hints = hints;
        self
    }

    #[must_use]
    pub fn with_memory_pressure(mut self, memory_pressure: f64) -> Self {
        self.memory_pressure = memory_pressure;
        self
    }

    fn slow_connection(&self) -> bool {
        self.connection.as_ref().is_some_and(ConnectionInfo::is_slow)
    }

    fn very_slow_connection(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(ConnectionInfo::is_very_slow)
    }

    /// Average of the five sub-scores.
    pub fn overall_score(&self) -> f64 {
        let hardware = (self.cores as f64 / 8.0 + self.memory_gb / 8.0).clamp(0.0, 2.0);
        let benchmark = (self.benchmark / 500.0).clamp(0.0, 2.0);
        let connection = if self.very_slow_connection() {
            0.0
        } else if self.slow_connection() {
            0.5
        } else {
            1.0
        };
        let device_type = self.hints.score();
        let memory = self.memory_pressure.clamp(0.1, 2.0);

        (hardware + benchmark + connection + device_type + memory) / 5.0
    }
}

/// Pure classification of gathered signals.
pub fn classify(signals: &DeviceSignals) -> DeviceClass {
    let overall = signals.overall_score();
    let hints = signals.hints;

    let very_slow = overall < 0.4
        || (signals.cores < 2 && signals.memory_gb < 2.0)
        || signals.very_slow_connection()
        || (hints.is_old_device && (hints.is_mobile || hints.is_chromebook));
    if very_slow {
        return DeviceClass::VerySlow;
    }

    let slow = overall < 0.7
        || signals.cores < 3
        || signals.memory_gb < 3.0
        || signals.slow_connection()
        || (hints.is_mobile && signals.benchmark < 100.0)
        || (hints.is_chromebook && signals.benchmark < 150.0);
    if slow {
        return DeviceClass::Slow;
    }

    if overall > 1.3 {
        DeviceClass::Fast
    } else {
        DeviceClass::Medium
    }
}

/// Memoized result of device detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub cores: usize,
    #[serde(rename = "memoryGB")]
    pub memory_gb: f64,
    pub connection_info: Option<ConnectionInfo>,
    pub benchmark_score: f64,
    pub overall_score: f64,
    pub classification: DeviceClass,
    pub computed: bool,
}

impl DeviceProfile {
    pub fn from_signals(signals: &DeviceSignals) -> Self {
        Self {
            cores: signals.cores,
            memory_gb: signals.memory_gb,
            connection_info: signals.connection.clone(),
            benchmark_score: signals.benchmark,
            overall_score: signals.overall_score(),
            classification: classify(signals),
            computed: true,
        }
    }

    /// Profile used when detection fails.
    pub fn conservative() -> Self {
        Self {
            cores: 2,
            memory_gb: DEFAULT_MEMORY_GB,
            connection_info: None,
            benchmark_score: 0.0,
            overall_score: 0.0,
            classification: DeviceClass::Slow,
            computed: true,
        }
    }

    pub fn is_slow_class(&self) -> bool {
        self.classification.is_slow_class()
    }
}

/// Signals supplied by the host configuration instead of measured locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceOverrides {
    pub user_agent: Option<String>,
    pub cores: Option<usize>,
    pub memory_gb: Option<f64>,
    pub connection: Option<ConnectionInfo>,
}

/// Computes the device profile once and hands out the memoized result.
#[derive(Debug, Default)]
pub struct DeviceProfiler {
    overrides: DeviceOverrides,
    profile: OnceLock<DeviceProfile>,
}

impl DeviceProfiler {
    pub fn new(overrides: DeviceOverrides) -> Self {
        Self {
            overrides,
            profile: OnceLock::new(),
        }
    }

    /// Profiler that always reports `profile` without detecting anything.
    pub fn fixed(profile: DeviceProfile) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(profile);
        Self {
            overrides: DeviceOverrides::default(),
            profile: cell,
        }
    }

    /// Profiler fixed to a class, with otherwise neutral numbers.
    pub fn with_class(classification: DeviceClass) -> Self {
        Self::fixed(DeviceProfile {
            classification,
            ..DeviceProfile::conservative()
        })
    }

    /// Returns the profile, detecting it on first use.
    pub fn profile(&self) -> &DeviceProfile {
        self.profile.get_or_init(|| self.detect())
    }

    pub fn class(&self) -> DeviceClass {
        self.profile().classification
    }

    fn detect(&self) -> DeviceProfile {
        match self.gather() {
            Ok(signals) => {
                let profile = DeviceProfile::from_signals(&signals);
                info!(
                    "Device profile: {} (cores: {}, memory: {:.1} GB, benchmark: {:.0} ops/ms, score: {:.2})",
                    profile.classification,
                    profile.cores,
                    profile.memory_gb,
                    profile.benchmark_score,
                    profile.overall_score
                );
                profile
            }
            Err(e) => {
                warn!("Device detection failed, assuming slow device: {e}");
                DeviceProfile::conservative()
            }
        }
    }

    fn gather(&self) -> Result<DeviceSignals, DetectionError> {
        let hints = match &self.overrides.user_agent {
            Some(ua) => DeviceHints::from_user_agent(ua)?,
            None => DeviceHints::default(),
        };

        let cores = self.overrides.cores.unwrap_or_else(num_cpus::get);
        let memory_gb = self
            .overrides
            .memory_gb
            .or_else(host_memory_gb)
            .unwrap_or(DEFAULT_MEMORY_GB);

        let benchmark = cpu_benchmark(CPU_BENCHMARK_WINDOW)?;
        let memory_pressure = match memory_benchmark(MEMORY_BENCHMARK_ELEMENTS) {
            Ok(score) => score,
            Err(e) => {
                warn!("Memory benchmark failed: {e}");
                MEMORY_BENCHMARK_FALLBACK
            }
        };

        let mut signals = DeviceSignals::new(cores, memory_gb, benchmark)
            .with_hints(hints)
            .with_memory_pressure(memory_pressure);
        signals.connection.clone_from(&self.overrides.connection);
        Ok(signals)
    }
}

/// Total memory from `/proc/meminfo`, in GB.
fn host_memory_gb() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / (1024.0 * 1024.0))
}

/// Fixed-wall-time arithmetic loop, in operations per millisecond.
pub fn cpu_benchmark(window: Duration) -> Result<f64, DetectionError> {
    let window_ms = window.as_secs_f64() * 1000.0;
    if window_ms <= 0.0 {
        return Err(DetectionError::Benchmark("empty benchmark window".into()));
    }

    let mut rng = rng();
    let start = Instant::now();
    let mut iterations: u64 = 0;
    let mut sink = 0.0f64;

    while start.elapsed() < window {
        let _: f64 = rng.random();
        sink += (rng.random::<f64>() * 1000.0).sqrt();
        iterations += 1;
    }
    std::hint::black_box(sink);

    Ok(iterations as f64 / window_ms)
}

/// Allocate-and-sort timing mapped to a 0.1-2 score.
pub fn memory_benchmark(elements: usize) -> Result<f64, DetectionError> {
    let mut values: Vec<f64> = Vec::new();
    values
        .try_reserve_exact(elements)
        .map_err(|e| DetectionError::Benchmark(e.to_string()))?;

    let mut rng = rng();
    values.extend((0..elements).map(|_| rng.random::<f64>()));

    let start = Instant::now();
    values.sort_by(f64::total_cmp);
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    std::hint::black_box(&values);

    if duration_ms <= 0.0 {
        return Ok(2.0);
    }
    Ok((50.0 / duration_ms).clamp(0.1, 2.0))
}
