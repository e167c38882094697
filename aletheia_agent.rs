//! # Aletheia Agent - Sampling & Aggregation Core
//!
//! The in-process half of the Aletheia telemetry agent. It decides whether an
//! observation on the hot path is recorded at all, folds what is recorded into
//! bounded windowed statistics under heavy concurrency, keeps per-thread CPU,
//! per-lock and per-method diagnostics, steers the sampling rate from process
//! load, and raises alerts when fresh aggregates drift from learned baselines.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          ALETHEIA AGENT CORE                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  PROBES → SAMPLING GATE → AGGREGATOR / SAMPLERS → SCHEDULER → ALERTS     │
//! │                                   ↑                  │                   │
//! │                       RATE CONTROLLER ←── LOAD       └──→ EXPORTER       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Cheap gate**: one thread-local random draw against an atomic rate
//! - **Exactly-once windows**: buffers are swapped, drained, then reduced
//! - **Adaptive intensity**: three sampling tiers with a hysteresis band
//! - **Diagnostics**: thread CPU, lock contention, method hotspots
//! - **Alerting**: EWMA baselines, GC pause, lock, deadlock and heap growth
//!
//! ## Author
//!
//! Aletheia Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::runtime::{Handle as RuntimeHandle, RuntimeFlavor};
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::queue::SegQueue;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender, TrySendError};
use once_cell::sync::OnceCell;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Randomness
// ----------------------------------------------------------------------------
use rand::{thread_rng, Rng};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self as subscriber_fmt, writer::BoxMakeWriter},
    layer::SubscriberExt,
    EnvFilter, Layer, Registry,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use quanta::Instant as QuantaInstant;

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::{Pid, System as SysInfoSystem};

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and limits for sampling, windows, diagnostics and alerting.
// ============================================================================

/// Agent version - follows semantic versioning
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "aletheia-agent";
pub const AGENT_FULL_NAME: &str = "Aletheia Telemetry Agent";

// ----------------------------------------------------------------------------
// Sampling
// ----------------------------------------------------------------------------

/// Sampling rate used when load is neither high nor low
pub const DEFAULT_SAMPLE_RATE: f64 = 0.01;

/// Sampling rate ceiling, used when the process is idle
pub const MAX_SAMPLE_RATE: f64 = 0.1;

/// Sampling rate floor, used when the process is busy
pub const MIN_SAMPLE_RATE: f64 = 0.001;

/// Default rate for the method hotspot sampler's own gate
pub const METHOD_SAMPLE_RATE: f64 = 0.01;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Aggregation window length (milliseconds)
pub const DEFAULT_WINDOW_SIZE_MS: u64 = 1000;

/// Collect-and-export period (milliseconds)
pub const DEFAULT_PUSH_INTERVAL_MS: u64 = 1000;

/// Thread CPU sampling period (milliseconds)
pub const CPU_SAMPLE_INTERVAL_MS: u64 = 100;

/// Lock contention scan period (milliseconds)
pub const LOCK_SCAN_INTERVAL_MS: u64 = 1000;

/// Hot method snapshot period (milliseconds)
pub const METHOD_SNAPSHOT_INTERVAL_MS: u64 = 1000;

/// Rate controller period (milliseconds)
pub const RATE_ADJUST_INTERVAL_MS: u64 = 5000;

/// Grace period for draining scheduler tasks on stop (milliseconds)
pub const SHUTDOWN_GRACE_PERIOD_MS: u64 = 5000;

/// Smallest period accepted for any periodic task (milliseconds)
pub const MIN_INTERVAL_MS: u64 = 10;

// ----------------------------------------------------------------------------
// Load Tiers
// ----------------------------------------------------------------------------

/// Above this process CPU load the rate drops to MIN_SAMPLE_RATE
pub const CPU_HIGH_THRESHOLD: f64 = 0.8;

/// Below this process CPU load the rate rises to MAX_SAMPLE_RATE
pub const CPU_LOW_THRESHOLD: f64 = 0.5;

/// Width of the band a tier must be left by before switching back
pub const DEFAULT_HYSTERESIS_BAND: f64 = 0.05;

/// Load assumed when the process load cannot be read
pub const FALLBACK_CPU_LOAD: f64 = 0.5;

// ----------------------------------------------------------------------------
// Alerting
// ----------------------------------------------------------------------------

/// p99 above baseline times this multiplier is an RT anomaly
pub const RT_ALERT_THRESHOLD_MULTIPLIER: f64 = 3.0;

/// Weight of the newest p99 in the baseline EWMA
pub const BASELINE_EWMA_ALPHA: f64 = 0.1;

/// GC pauses longer than this raise a stop-the-world alert (milliseconds)
pub const GC_STW_ALERT_THRESHOLD_MS: u64 = 1000;

/// More blocked threads than this on one lock raise a contention alert
pub const LOCK_CONTENTION_ALERT_THRESHOLD: u32 = 10;

/// Relative heap growth between snapshots that counts as a leak signal
pub const MEMORY_LEAK_GROWTH_THRESHOLD: f64 = 0.2;

// ----------------------------------------------------------------------------
// Capacities
// ----------------------------------------------------------------------------

/// Maximum values retained per method for percentile queries
pub const METHOD_RESERVOIR_CAPACITY: usize = 10_000;

/// Default size of top-N lists carried in a batch
pub const DEFAULT_TOP_N: usize = 10;

/// Default capacity of the channel exporter
pub const EXPORT_CHANNEL_CAPACITY: usize = 1024;

/// Probe frames kept inline before the per-thread stack spills to the heap
pub const PROBE_STACK_INLINE: usize = 16;

/// Per-thread probe stack depth; a start beyond it evicts the outermost frame
pub const MAX_PROBE_DEPTH: usize = 256;

/// Class name prefixes that are never instrumented
pub const DEFAULT_EXCLUDE_PREFIXES: &[&str] = &[
    "java/",
    "javax/",
    "sun/",
    "com/sun/",
    "jdk/internal/",
    "com/alibaba/aletheia/",
    "org/slf4j/",
    "ch/qos/logback/",
    "org/objectweb/asm/",
];

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Timestamps, atomic floats and the feature vocabulary shared by every
// component of the agent.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is later
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

/// Atomic timestamp for lock-free "last seen" bookkeeping
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    #[inline]
    pub const fn new(ts: Timestamp) -> Self {
        Self(AtomicI64::new(ts.0))
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Timestamp {
        Timestamp(self.0.load(ordering))
    }

    #[inline]
    pub fn store(&self, ts: Timestamp, ordering: AtomicOrdering) {
        self.0.store(ts.0, ordering);
    }

    /// Move forward to `new`; never moves backwards
    #[inline]
    pub fn update_if_newer(&self, new: Timestamp) {
        self.0.fetch_max(new.0, AtomicOrdering::AcqRel);
    }
}

impl Default for AtomicTimestamp {
    fn default() -> Self {
        Self::new(Timestamp::EPOCH)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Atomic Float - Lock-free f64 Operations
// ----------------------------------------------------------------------------

/// An atomic f64 value using bit casting to AtomicU64.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub const fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, val: f64, ordering: AtomicOrdering) {
        self.bits.store(val.to_bits(), ordering);
    }

    #[inline]
    pub fn swap(&self, val: f64, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.swap(val.to_bits(), ordering))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: f64,
        new: f64,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<f64, f64> {
        self.bits
            .compare_exchange(current.to_bits(), new.to_bits(), success, failure)
            .map(f64::from_bits)
            .map_err(f64::from_bits)
    }

    /// Add a value atomically (using CAS loop).
    #[inline]
    pub fn fetch_add(&self, val: f64, ordering: AtomicOrdering) -> f64 {
        let mut current = self.load(AtomicOrdering::Relaxed);
        loop {
            match self.compare_exchange(current, current + val, ordering, AtomicOrdering::Relaxed) {
                Ok(v) => return v,
                Err(v) => current = v,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Features - Named Collectors
// ----------------------------------------------------------------------------

/// A collector that can be switched on and off at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// Method response time windows
    Rt,
    /// Garbage-collection pause intake
    Gc,
    /// Memory pool snapshots
    Memory,
    /// Thread state snapshots and deadlock detection
    Thread,
    /// Lock acquire/release/wait tracking and contention scans
    Lock,
    /// Per-thread CPU usage
    Cpu,
    /// Method hotspot statistics
    Method,
}

/// Number of [`Feature`] variants
pub const FEATURE_COUNT: usize = 7;

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::Rt,
        Feature::Gc,
        Feature::Memory,
        Feature::Thread,
        Feature::Lock,
        Feature::Cpu,
        Feature::Method,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Feature::Rt => "rt",
            Feature::Gc => "gc",
            Feature::Memory => "memory",
            Feature::Thread => "thread",
            Feature::Lock => "lock",
            Feature::Cpu => "cpu",
            Feature::Method => "method",
        }
    }
}

impl Display for Feature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| ConfigError::UnknownFeature { name: s.to_string() })
    }
}

/// Number of available CPUs, used to normalize process load
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the agent. Hot-path entry points never
// return these; they are produced by configuration, collectors, runtime
// introspection and export, and counted by ErrorStats when swallowed.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Agent Errors
// ----------------------------------------------------------------------------

/// The main error type for the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Introspection error: {0}")]
    Introspection(#[from] IntrospectionError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl AgentError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AgentError::Config(_) => false,
            AgentError::Collector(e) => e.is_recoverable(),
            AgentError::Introspection(e) => e.is_recoverable(),
            AgentError::Aggregation(_) => true,
            AgentError::Export(e) => e.is_recoverable(),
            AgentError::Io(_) => true,
            AgentError::Internal(_) => false,
            AgentError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Collector(_) => "collector",
            AgentError::Introspection(_) => "introspection",
            AgentError::Aggregation(_) => "aggregation",
            AgentError::Export(_) => "export",
            AgentError::Io(_) => "io",
            AgentError::Internal(_) => "internal",
            AgentError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading, validation and runtime control
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown feature '{name}'")]
    UnknownFeature { name: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Collector Errors
// ----------------------------------------------------------------------------

/// Errors from periodic collectors and samplers
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Collector '{name}' failed to start: {message}")]
    StartFailed { name: String, message: String },

    #[error("Collector '{name}' is not registered")]
    NotRegistered { name: String },

    #[error("Sampling failed for '{name}': {message}")]
    SampleFailed { name: String, message: String },
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CollectorError::StartFailed { .. } | CollectorError::NotRegistered { .. })
    }

    pub fn sample_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::SampleFailed {
            name: name.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Introspection Errors
// ----------------------------------------------------------------------------

/// Errors from the runtime introspection collaborator
#[derive(Error, Debug)]
pub enum IntrospectionError {
    #[error("Capability '{capability}' is not supported by this runtime")]
    Unsupported { capability: &'static str },

    #[error("Failed to read '{path}': {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },
}

impl IntrospectionError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, IntrospectionError::Unsupported { .. })
    }

    pub fn read_failed(path: impl Into<String>, err: impl Display) -> Self {
        IntrospectionError::ReadFailed {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Aggregation Errors
// ----------------------------------------------------------------------------

/// Errors raised while reducing one subject's window
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("No observations for subject '{subject}'")]
    EmptyWindow { subject: String },

    #[error("Non-finite observation for subject '{subject}'")]
    NonFinite { subject: String },
}

// ----------------------------------------------------------------------------
// 4.6 Export Errors
// ----------------------------------------------------------------------------

/// Errors from handing a batch to the export collaborator
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export channel full (capacity {capacity}), batch dropped")]
    ChannelFull { capacity: usize },

    #[error("Export channel disconnected")]
    Disconnected,

    #[error("Batch serialization failed: {0}")]
    Serialization(String),
}

impl ExportError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ExportError::Disconnected)
    }
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Result type for collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Result type for introspection calls
pub type IntrospectionResult<T> = Result<T, IntrospectionError>;

// ----------------------------------------------------------------------------
// 4.8 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks errors the agent swallowed instead of propagating
#[derive(Debug, Default)]
pub struct ErrorStats {
    pub by_category: DashMap<&'static str, AtomicU64>,
    pub recoverable_count: AtomicU64,
    pub non_recoverable_count: AtomicU64,
    pub last_error_time: AtomicTimestamp,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &AgentError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }

        self.last_error_time.update_if_newer(Timestamp::now());
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML configuration with environment overrides (ALETHEIA_SECTION__KEY),
// validation and generated defaults. Intervals are integer milliseconds.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: GeneralConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub features: FeaturesConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::from(Serialized::defaults(AgentConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ALETHEIA_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sampling;
        check_unit_interval("sampling.min_rate", s.min_rate)?;
        check_unit_interval("sampling.max_rate", s.max_rate)?;
        check_unit_interval("sampling.initial_rate", s.initial_rate)?;
        if s.min_rate > s.max_rate {
            return Err(ConfigError::invalid_value(
                "sampling.min_rate",
                format!("min_rate {} exceeds max_rate {}", s.min_rate, s.max_rate),
            ));
        }
        if s.initial_rate < s.min_rate || s.initial_rate > s.max_rate {
            return Err(ConfigError::invalid_value(
                "sampling.initial_rate",
                format!("must lie within [{}, {}]", s.min_rate, s.max_rate),
            ));
        }

        let d = &self.diagnostics;
        check_unit_interval("diagnostics.method_sample_rate", d.method_sample_rate)?;
        if d.reservoir_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "diagnostics.reservoir_capacity",
                "reservoir must hold at least one value",
            ));
        }

        for (field, value) in [
            ("agent.push_interval_ms", self.agent.push_interval_ms),
            ("sampling.window_size_ms", s.window_size_ms),
            ("diagnostics.cpu_interval_ms", d.cpu_interval_ms),
            ("diagnostics.lock_scan_interval_ms", d.lock_scan_interval_ms),
            ("diagnostics.method_snapshot_interval_ms", d.method_snapshot_interval_ms),
            ("controller.interval_ms", self.controller.interval_ms),
        ] {
            if value < MIN_INTERVAL_MS {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("interval must be at least {}ms", MIN_INTERVAL_MS),
                ));
            }
        }

        let c = &self.controller;
        check_unit_interval("controller.low_threshold", c.low_threshold)?;
        check_unit_interval("controller.high_threshold", c.high_threshold)?;
        check_unit_interval("controller.fallback_load", c.fallback_load)?;
        if c.low_threshold >= c.high_threshold {
            return Err(ConfigError::invalid_value(
                "controller.low_threshold",
                "low threshold must be below high threshold",
            ));
        }
        if c.hysteresis_band < 0.0 || c.hysteresis_band * 2.0 > c.high_threshold - c.low_threshold {
            return Err(ConfigError::invalid_value(
                "controller.hysteresis_band",
                "band must be non-negative and fit twice between the thresholds",
            ));
        }

        let a = &self.alerts;
        if !(a.rt_multiplier.is_finite() && a.rt_multiplier > 1.0) {
            return Err(ConfigError::invalid_value("alerts.rt_multiplier", "must be greater than 1.0"));
        }
        if !(a.ewma_alpha > 0.0 && a.ewma_alpha <= 1.0) {
            return Err(ConfigError::invalid_value("alerts.ewma_alpha", "must lie within (0, 1]"));
        }
        if !(a.memory_growth_threshold.is_finite() && a.memory_growth_threshold > 0.0) {
            return Err(ConfigError::invalid_value("alerts.memory_growth_threshold", "must be positive"));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}', expected pretty, compact or json", other),
            )),
        }
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("{} is outside [0.0, 1.0]", value)))
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Agent Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instance name stamped on every batch
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Collect-and-export period
    #[serde(default = "default_push_interval")]
    pub push_interval_ms: u64,

    /// How long stop waits for in-flight tasks before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            push_interval_ms: default_push_interval(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

fn default_instance_name() -> String {
    AGENT_NAME.into()
}

fn default_push_interval() -> u64 {
    DEFAULT_PUSH_INTERVAL_MS
}

fn default_shutdown_grace() -> u64 {
    SHUTDOWN_GRACE_PERIOD_MS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Sampling Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_sample_rate")]
    pub initial_rate: f64,

    #[serde(default = "default_min_rate")]
    pub min_rate: f64,

    #[serde(default = "default_max_rate")]
    pub max_rate: f64,

    #[serde(default = "default_window_size")]
    pub window_size_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            initial_rate: default_sample_rate(),
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
            window_size_ms: default_window_size(),
        }
    }
}

fn default_sample_rate() -> f64 {
    DEFAULT_SAMPLE_RATE
}

fn default_min_rate() -> f64 {
    MIN_SAMPLE_RATE
}

fn default_max_rate() -> f64 {
    MAX_SAMPLE_RATE
}

fn default_window_size() -> u64 {
    DEFAULT_WINDOW_SIZE_MS
}

// ----------------------------------------------------------------------------
// 5.4 Diagnostics Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_cpu_interval")]
    pub cpu_interval_ms: u64,

    #[serde(default = "default_lock_scan_interval")]
    pub lock_scan_interval_ms: u64,

    #[serde(default = "default_method_snapshot_interval")]
    pub method_snapshot_interval_ms: u64,

    #[serde(default = "default_method_sample_rate")]
    pub method_sample_rate: f64,

    #[serde(default = "default_reservoir_capacity")]
    pub reservoir_capacity: usize,

    /// Length of the top-N lists carried in each batch
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            cpu_interval_ms: default_cpu_interval(),
            lock_scan_interval_ms: default_lock_scan_interval(),
            method_snapshot_interval_ms: default_method_snapshot_interval(),
            method_sample_rate: default_method_sample_rate(),
            reservoir_capacity: default_reservoir_capacity(),
            top_n: default_top_n(),
        }
    }
}

fn default_cpu_interval() -> u64 {
    CPU_SAMPLE_INTERVAL_MS
}

fn default_lock_scan_interval() -> u64 {
    LOCK_SCAN_INTERVAL_MS
}

fn default_method_snapshot_interval() -> u64 {
    METHOD_SNAPSHOT_INTERVAL_MS
}

fn default_method_sample_rate() -> f64 {
    METHOD_SAMPLE_RATE
}

fn default_reservoir_capacity() -> usize {
    METHOD_RESERVOIR_CAPACITY
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

// ----------------------------------------------------------------------------
// 5.5 Rate Controller Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_controller_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,

    #[serde(default = "default_hysteresis_band")]
    pub hysteresis_band: f64,

    #[serde(default = "default_fallback_load")]
    pub fallback_load: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_controller_interval(),
            high_threshold: default_high_threshold(),
            low_threshold: default_low_threshold(),
            hysteresis_band: default_hysteresis_band(),
            fallback_load: default_fallback_load(),
        }
    }
}

fn default_controller_interval() -> u64 {
    RATE_ADJUST_INTERVAL_MS
}

fn default_high_threshold() -> f64 {
    CPU_HIGH_THRESHOLD
}

fn default_low_threshold() -> f64 {
    CPU_LOW_THRESHOLD
}

fn default_hysteresis_band() -> f64 {
    DEFAULT_HYSTERESIS_BAND
}

fn default_fallback_load() -> f64 {
    FALLBACK_CPU_LOAD
}

// ----------------------------------------------------------------------------
// 5.6 Alert Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_rt_multiplier")]
    pub rt_multiplier: f64,

    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    #[serde(default = "default_gc_threshold")]
    pub gc_pause_threshold_ms: u64,

    #[serde(default = "default_lock_threshold")]
    pub lock_blocked_threshold: u32,

    #[serde(default = "default_memory_growth")]
    pub memory_growth_threshold: f64,

    /// Register the logging listener at startup
    #[serde(default = "default_true")]
    pub log_alerts: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            rt_multiplier: default_rt_multiplier(),
            ewma_alpha: default_ewma_alpha(),
            gc_pause_threshold_ms: default_gc_threshold(),
            lock_blocked_threshold: default_lock_threshold(),
            memory_growth_threshold: default_memory_growth(),
            log_alerts: true,
        }
    }
}

fn default_rt_multiplier() -> f64 {
    RT_ALERT_THRESHOLD_MULTIPLIER
}

fn default_ewma_alpha() -> f64 {
    BASELINE_EWMA_ALPHA
}

fn default_gc_threshold() -> u64 {
    GC_STW_ALERT_THRESHOLD_MS
}

fn default_lock_threshold() -> u32 {
    LOCK_CONTENTION_ALERT_THRESHOLD
}

fn default_memory_growth() -> f64 {
    MEMORY_LEAK_GROWTH_THRESHOLD
}

// ----------------------------------------------------------------------------
// 5.7 Feature & Filter Configuration
// ----------------------------------------------------------------------------

/// Initial on/off state of each feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_true")]
    pub rt: bool,
    #[serde(default = "default_true")]
    pub gc: bool,
    #[serde(default = "default_true")]
    pub memory: bool,
    #[serde(default = "default_true")]
    pub thread: bool,
    #[serde(default = "default_true")]
    pub lock: bool,
    #[serde(default = "default_true")]
    pub cpu: bool,
    #[serde(default = "default_true")]
    pub method: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            rt: true,
            gc: true,
            memory: true,
            thread: true,
            lock: true,
            cpu: true,
            method: true,
        }
    }
}

impl FeaturesConfig {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::Rt => self.rt,
            Feature::Gc => self.gc,
            Feature::Memory => self.memory,
            Feature::Thread => self.thread,
            Feature::Lock => self.lock,
            Feature::Cpu => self.cpu,
            Feature::Method => self.method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: default_exclude(),
        }
    }
}

fn default_exclude() -> Vec<String> {
    DEFAULT_EXCLUDE_PREFIXES.iter().map(|p| p.to_string()).collect()
}

// ----------------------------------------------------------------------------
// 5.8 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level directive; RUST_LOG overrides it
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for daily rolling log files instead of stdout
    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            file_prefix: default_log_prefix(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_log_prefix() -> String {
    "aletheia-agent.log".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through tracing. Inside a host process the agent should
// log to a rolling file so it never interleaves with the host's stdout.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration.
///
/// Returns the appender guard when logging to a file; dropping it flushes and
/// stops the background writer, so the caller keeps it alive.
pub fn init_logging(config: &LoggingConfig) -> AgentResult<Option<WorkerGuard>> {
    let level_filter = config.level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let (writer, guard) = match &config.file {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(io::stdout), None),
    };
    let ansi = config.colors && config.file.is_none();

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format.as_str() {
        "json" => subscriber_fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed(),
        "compact" => subscriber_fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .boxed(),
        _ => subscriber_fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(fmt_layer).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AgentError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "aletheia::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// 6.2 Logging Macros
// ----------------------------------------------------------------------------

/// Log an alert at the level its severity maps to
#[macro_export]
macro_rules! log_alert {
    ($alert:expr) => {{
        let alert = &$alert;
        match alert.severity {
            $crate::AlertSeverity::Critical => tracing::error!(
                target: "aletheia::alerts",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                subject = %alert.subject,
                "{}", alert.message
            ),
            $crate::AlertSeverity::Warning => tracing::warn!(
                target: "aletheia::alerts",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                subject = %alert.subject,
                "{}", alert.message
            ),
            $crate::AlertSeverity::Info => tracing::info!(
                target: "aletheia::alerts",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                subject = %alert.subject,
                "{}", alert.message
            ),
        }
    }};
}

// ============================================================================
// SECTION 7: SAMPLING GATE & RUNTIME CONTROLS
// ============================================================================
// The per-call sampling decision, the shared rate it reads, per-feature
// toggles and the class filter consulted by the instrumentation side.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Sampling Policy - Single Writer, Many Readers
// ----------------------------------------------------------------------------

/// Process-wide sampling rate bounded to `[min_rate, max_rate]`.
///
/// Readers see a plain atomic load. Every accepted write bumps `version`, so a
/// reader can tell whether the rate moved since it last looked.
#[derive(Debug)]
pub struct SamplingPolicy {
    rate: AtomicF64,
    version: AtomicU64,
    min_rate: f64,
    max_rate: f64,
    default_rate: f64,
}

impl SamplingPolicy {
    /// Policy with the built-in bounds, starting at `initial`
    pub fn new(initial: f64) -> Result<Self, ConfigError> {
        Self::with_bounds(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE, initial)
    }

    pub fn with_bounds(min_rate: f64, max_rate: f64, initial: f64) -> Result<Self, ConfigError> {
        check_unit_interval("sampling.min_rate", min_rate)?;
        check_unit_interval("sampling.max_rate", max_rate)?;
        check_unit_interval("sampling.initial_rate", initial)?;
        if min_rate > max_rate {
            return Err(ConfigError::invalid_value(
                "sampling.min_rate",
                format!("min_rate {} exceeds max_rate {}", min_rate, max_rate),
            ));
        }
        let start = initial.clamp(min_rate, max_rate);
        Ok(Self {
            rate: AtomicF64::new(start),
            version: AtomicU64::new(0),
            min_rate,
            max_rate,
            default_rate: start,
        })
    }

    pub fn from_config(config: &SamplingConfig) -> Result<Self, ConfigError> {
        Self::with_bounds(config.min_rate, config.max_rate, config.initial_rate)
    }

    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate.load(AtomicOrdering::Acquire)
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(AtomicOrdering::Acquire)
    }

    pub fn min_rate(&self) -> f64 {
        self.min_rate
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }

    pub fn default_rate(&self) -> f64 {
        self.default_rate
    }

    /// Set the rate. Values outside `[0, 1]` are rejected and the current rate
    /// is kept; accepted values are clamped into the policy bounds. Returns the
    /// effective rate.
    pub fn set_rate(&self, rate: f64) -> Result<f64, ConfigError> {
        check_unit_interval("sampling.rate", rate)?;
        let effective = rate.clamp(self.min_rate, self.max_rate);
        let previous = self.rate.swap(effective, AtomicOrdering::AcqRel);
        if previous.to_bits() != effective.to_bits() {
            self.version.fetch_add(1, AtomicOrdering::AcqRel);
        }
        Ok(effective)
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            rate: AtomicF64::new(DEFAULT_SAMPLE_RATE),
            version: AtomicU64::new(0),
            min_rate: MIN_SAMPLE_RATE,
            max_rate: MAX_SAMPLE_RATE,
            default_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 Sampling Gate
// ----------------------------------------------------------------------------

/// One uniform draw from the calling thread's generator against `rate`.
#[inline]
pub fn sample_with_rate(rate: f64) -> bool {
    rate > 0.0 && thread_rng().gen::<f64>() < rate
}

/// Hot-path sampling decision against a shared [`SamplingPolicy`].
#[derive(Debug)]
pub struct SamplingGate {
    policy: Arc<SamplingPolicy>,
    sampled: CachePadded<AtomicU64>,
}

impl SamplingGate {
    pub fn new(policy: Arc<SamplingPolicy>) -> Self {
        Self {
            policy,
            sampled: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Lock-free and allocation-free; a rate change applies on the next call.
    #[inline]
    pub fn should_sample(&self) -> bool {
        let hit = sample_with_rate(self.policy.rate());
        if hit {
            self.sampled.fetch_add(1, AtomicOrdering::Relaxed);
        }
        hit
    }

    pub fn policy(&self) -> &Arc<SamplingPolicy> {
        &self.policy
    }

    /// Number of calls that were let through
    pub fn total_sampled(&self) -> u64 {
        self.sampled.load(AtomicOrdering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// 7.3 Feature Toggles
// ----------------------------------------------------------------------------

/// Live on/off state and sampling rate of every [`Feature`].
///
/// Indexed by feature so the probe path reads a single atomic.
#[derive(Debug)]
pub struct FeatureToggles {
    enabled: [AtomicBool; FEATURE_COUNT],
    rates: [AtomicF64; FEATURE_COUNT],
}

impl FeatureToggles {
    pub fn from_config(config: &AgentConfig) -> Self {
        let enabled = Feature::ALL.map(|f| AtomicBool::new(config.features.is_enabled(f)));
        let rates = Feature::ALL.map(|f| {
            AtomicF64::new(match f {
                Feature::Rt => config.sampling.initial_rate,
                Feature::Method => config.diagnostics.method_sample_rate,
                _ => 1.0,
            })
        });
        Self { enabled, rates }
    }

    #[inline]
    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled[feature.index()].load(AtomicOrdering::Relaxed)
    }

    /// Returns the previous state
    pub fn set_enabled(&self, feature: Feature, enabled: bool) -> bool {
        self.enabled[feature.index()].swap(enabled, AtomicOrdering::AcqRel)
    }

    pub fn rate(&self, feature: Feature) -> f64 {
        self.rates[feature.index()].load(AtomicOrdering::Acquire)
    }

    /// Rejects rates outside `[0, 1]`, keeping the previous value
    pub fn set_rate(&self, feature: Feature, rate: f64) -> Result<(), ConfigError> {
        check_unit_interval(&format!("features.{}.rate", feature), rate)?;
        self.rates[feature.index()].store(rate, AtomicOrdering::Release);
        Ok(())
    }

    pub fn enabled_features(&self) -> Vec<Feature> {
        Feature::ALL.iter().copied().filter(|f| self.is_enabled(*f)).collect()
    }
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

// ----------------------------------------------------------------------------
// 7.4 Subject Filter
// ----------------------------------------------------------------------------

/// Include/exclude prefix patterns over internal class names (`com/example/Foo`).
///
/// Exclusion always wins. With a non-empty include list a name must match one
/// of its prefixes; with an empty include list everything not excluded passes.
#[derive(Debug, Default)]
pub struct SubjectFilter {
    include: RwLock<Vec<CompactString>>,
    exclude: RwLock<Vec<CompactString>>,
}

impl SubjectFilter {
    pub fn from_config(config: &FilterConfig) -> Self {
        let filter = Self::default();
        for pattern in &config.include {
            filter.add_include_pattern(pattern);
        }
        for pattern in &config.exclude {
            filter.add_exclude_pattern(pattern);
        }
        filter
    }

    pub fn should_instrument(&self, class_name: &str) -> bool {
        if class_name.is_empty() || is_generated_class(class_name) {
            return false;
        }
        if self.exclude.read().iter().any(|p| class_name.starts_with(p.as_str())) {
            return false;
        }
        let include = self.include.read();
        include.is_empty() || include.iter().any(|p| class_name.starts_with(p.as_str()))
    }

    pub fn add_include_pattern(&self, pattern: &str) -> bool {
        let added = add_pattern(&self.include, pattern);
        if added {
            info!(target: "aletheia::filter", pattern, "Include pattern added");
        }
        added
    }

    pub fn remove_include_pattern(&self, pattern: &str) -> bool {
        let removed = remove_pattern(&self.include, pattern);
        if removed {
            info!(target: "aletheia::filter", pattern, "Include pattern removed");
        }
        removed
    }

    pub fn add_exclude_pattern(&self, pattern: &str) -> bool {
        let added = add_pattern(&self.exclude, pattern);
        if added {
            info!(target: "aletheia::filter", pattern, "Exclude pattern added");
        }
        added
    }

    pub fn remove_exclude_pattern(&self, pattern: &str) -> bool {
        let removed = remove_pattern(&self.exclude, pattern);
        if removed {
            info!(target: "aletheia::filter", pattern, "Exclude pattern removed");
        }
        removed
    }

    pub fn include_patterns(&self) -> Vec<CompactString> {
        self.include.read().clone()
    }

    pub fn exclude_patterns(&self) -> Vec<CompactString> {
        self.exclude.read().clone()
    }
}

fn is_generated_class(class_name: &str) -> bool {
    class_name.contains("$$Lambda") || class_name.contains("$Proxy") || class_name.contains("CGLIB$$")
}

fn add_pattern(patterns: &RwLock<Vec<CompactString>>, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    let mut guard = patterns.write();
    if guard.iter().any(|p| p.as_str() == pattern) {
        return false;
    }
    guard.push(CompactString::new(pattern));
    true
}

fn remove_pattern(patterns: &RwLock<Vec<CompactString>>, pattern: &str) -> bool {
    let pattern = pattern.trim();
    let mut guard = patterns.write();
    let before = guard.len();
    guard.retain(|p| p.as_str() != pattern);
    guard.len() != before
}

// ============================================================================
// SECTION 8: WINDOWED AGGREGATION
// ============================================================================
// Per-subject latency accumulation into fixed time windows, reduced into
// min/max/avg and interpolated percentiles.
//
// Writers append into the current WindowBuffer. Sealing swaps a fresh buffer
// in, waits until no writer still holds the old one, and only then reduces it,
// so every observation lands in exactly one window. Reduction (sorting) runs
// on the collector side, never on the recording thread.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Percentiles
// ----------------------------------------------------------------------------

/// Percentile of an ascending slice with linear interpolation between the two
/// bracketing order statistics: `rank = p / 100 * (n - 1)`.
pub fn interpolated_percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] * (1.0 - weight) + sorted[upper] * weight
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Windowed Aggregate
// ----------------------------------------------------------------------------

/// Summary of one subject over one window. Latencies are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedAggregate {
    pub subject: CompactString,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub sample_count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p99: f64,
    pub p999: f64,
}

impl WindowedAggregate {
    /// Reduce raw observations (sorted in place)
    pub fn from_samples(
        subject: &str,
        window_start: Timestamp,
        window_end: Timestamp,
        values: &mut [f64],
    ) -> Result<Self, AggregationError> {
        if values.is_empty() {
            return Err(AggregationError::EmptyWindow {
                subject: subject.to_string(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AggregationError::NonFinite {
                subject: subject.to_string(),
            });
        }

        values.sort_unstable_by_key(|v| OrderedFloat(*v));
        let sum: f64 = values.iter().sum();
        let n = values.len();

        Ok(Self {
            subject: CompactString::new(subject),
            window_start,
            window_end,
            sample_count: n as u64,
            min: values[0],
            max: values[n - 1],
            avg: sum / n as f64,
            p50: interpolated_percentile(values, 50.0),
            p99: interpolated_percentile(values, 99.0),
            p999: interpolated_percentile(values, 99.9),
        })
    }
}

// ----------------------------------------------------------------------------
// 8.3 Window Buffer
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct WindowBuffer {
    start: Timestamp,
    samples: DashMap<CompactString, Vec<f64>>,
}

impl WindowBuffer {
    fn new(start: Timestamp) -> Self {
        Self {
            start,
            samples: DashMap::new(),
        }
    }

    #[inline]
    fn push(&self, subject: &str, value: f64) {
        if let Some(mut values) = self.samples.get_mut(subject) {
            values.push(value);
            return;
        }
        self.samples
            .entry(CompactString::new(subject))
            .or_default()
            .push(value);
    }
}

/// Buffer taken out of rotation, waiting to be reduced
#[derive(Debug)]
struct SealedWindow {
    buffer: Arc<WindowBuffer>,
    end: Timestamp,
}

// ----------------------------------------------------------------------------
// 8.4 Windowed Aggregator
// ----------------------------------------------------------------------------

/// Concurrent per-subject latency windows.
#[derive(Debug)]
pub struct WindowedAggregator {
    current: ArcSwap<WindowBuffer>,
    sealed: SegQueue<SealedWindow>,
    ready: Mutex<Vec<WindowedAggregate>>,
    window_size: Duration,
    recorded: CachePadded<AtomicU64>,
    rejected: AtomicU64,
    reduce_failures: AtomicU64,
}

impl WindowedAggregator {
    pub fn new(window_size: Duration) -> Self {
        Self {
            current: ArcSwap::from_pointee(WindowBuffer::new(Timestamp::now())),
            sealed: SegQueue::new(),
            ready: Mutex::new(Vec::new()),
            window_size,
            recorded: CachePadded::new(AtomicU64::new(0)),
            rejected: AtomicU64::new(0),
            reduce_failures: AtomicU64::new(0),
        }
    }

    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Record one latency observation in milliseconds.
    ///
    /// Never fails: empty subjects and negative or non-finite values are
    /// counted and dropped.
    #[inline]
    pub fn record_rt(&self, subject: &str, latency_ms: f64) {
        self.record_rt_at(subject, latency_ms, Timestamp::now());
    }

    pub fn record_rt_at(&self, subject: &str, latency_ms: f64, now: Timestamp) {
        if subject.is_empty() || !latency_ms.is_finite() || latency_ms < 0.0 {
            self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            trace!(target: "aletheia::aggregator", subject, latency_ms, "Rejected observation");
            return;
        }

        self.roll_if_expired(now);
        let buffer = self.current.load_full();
        buffer.push(subject, latency_ms);
        self.recorded.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Seal the current window if it is older than the window size. Exactly
    /// one of the racing writers wins the swap and queues the old buffer.
    fn roll_if_expired(&self, now: Timestamp) {
        let current = self.current.load();
        if now.duration_since(current.start) <= self.window_size {
            return;
        }
        let fresh = Arc::new(WindowBuffer::new(now));
        let previous = self.current.compare_and_swap(&*current, fresh);
        if Arc::ptr_eq(&*previous, &*current) {
            self.sealed.push(SealedWindow {
                buffer: arc_swap::Guard::into_inner(current),
                end: now,
            });
        }
    }

    /// Seal the current window and reduce every sealed window into the ready
    /// list.
    pub fn flush_window(&self) {
        let now = Timestamp::now();
        let previous = self.current.swap(Arc::new(WindowBuffer::new(now)));
        self.sealed.push(SealedWindow {
            buffer: previous,
            end: now,
        });

        while let Some(sealed) = self.sealed.pop() {
            let aggregates = self.reduce(sealed);
            if !aggregates.is_empty() {
                self.ready.lock().extend(aggregates);
            }
        }
    }

    /// Flush, then hand over every aggregate produced since the last call.
    pub fn get_and_clear_aggregates(&self) -> Vec<WindowedAggregate> {
        self.flush_window();
        std::mem::take(&mut *self.ready.lock())
    }

    fn reduce(&self, sealed: SealedWindow) -> Vec<WindowedAggregate> {
        let SealedWindow { buffer, end } = sealed;
        wait_for_exclusive(&buffer);
        let start = buffer.start;

        let entries: Vec<(CompactString, Vec<f64>)> = match Arc::try_unwrap(buffer) {
            Ok(owned) => owned.samples.into_iter().collect(),
            Err(shared) => {
                warn!(target: "aletheia::aggregator", "Window buffer still shared at reduction, copying");
                shared
                    .samples
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            }
        };

        let mut aggregates = Vec::with_capacity(entries.len());
        for (subject, mut values) in entries {
            if values.is_empty() {
                continue;
            }
            match WindowedAggregate::from_samples(&subject, start, end, &mut values) {
                Ok(aggregate) => aggregates.push(aggregate),
                Err(e) => {
                    self.reduce_failures.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(target: "aletheia::aggregator", subject = %subject, error = %e, "Skipping subject");
                }
            }
        }
        aggregates
    }

    pub fn total_recorded(&self) -> u64 {
        self.recorded.load(AtomicOrdering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.load(AtomicOrdering::Relaxed)
    }

    /// Subjects with observations in the open window
    pub fn pending_subjects(&self) -> usize {
        self.current.load().samples.len()
    }
}

impl Default for WindowedAggregator {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_WINDOW_SIZE_MS))
    }
}

/// Spin until `buffer` is referenced only by the caller. Writers hold their
/// clone for the length of one push.
fn wait_for_exclusive<T>(buffer: &Arc<T>) {
    let backoff = Backoff::new();
    while Arc::strong_count(buffer) > 1 {
        if backoff.is_completed() {
            std::thread::yield_now();
        } else {
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod sampling_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_policy_clamps_into_bounds() {
        let policy = SamplingPolicy::new(DEFAULT_SAMPLE_RATE).unwrap();
        assert_eq!(policy.set_rate(0.5).unwrap(), MAX_SAMPLE_RATE);
        assert_eq!(policy.set_rate(0.0).unwrap(), MIN_SAMPLE_RATE);
        assert_eq!(policy.rate(), MIN_SAMPLE_RATE);
    }

    #[test]
    fn test_policy_rejects_out_of_range_and_keeps_rate() {
        let policy = SamplingPolicy::new(0.05).unwrap();
        let version = policy.version();

        assert!(policy.set_rate(1.5).is_err());
        assert!(policy.set_rate(-0.1).is_err());
        assert!(policy.set_rate(f64::NAN).is_err());

        assert_eq!(policy.rate(), 0.05);
        assert_eq!(policy.version(), version);
    }

    #[test]
    fn test_policy_version_moves_only_on_change() {
        let policy = SamplingPolicy::new(0.05).unwrap();
        policy.set_rate(0.05).unwrap();
        assert_eq!(policy.version(), 0);
        policy.set_rate(0.02).unwrap();
        assert_eq!(policy.version(), 1);
    }

    #[test]
    fn test_gate_extremes() {
        let never = SamplingGate::new(Arc::new(SamplingPolicy::with_bounds(0.0, 1.0, 0.0).unwrap()));
        let always = SamplingGate::new(Arc::new(SamplingPolicy::with_bounds(0.0, 1.0, 1.0).unwrap()));
        for _ in 0..1000 {
            assert!(!never.should_sample());
            assert!(always.should_sample());
        }
        assert_eq!(always.total_sampled(), 1000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_gate_fraction_converges(rate in 0.05f64..0.95) {
            let gate = SamplingGate::new(Arc::new(SamplingPolicy::with_bounds(0.0, 1.0, rate).unwrap()));
            let trials = 20_000;
            let hits = (0..trials).filter(|_| gate.should_sample()).count();
            let observed = hits as f64 / trials as f64;
            // ~6 standard deviations at the worst case rate of 0.5
            prop_assert!((observed - rate).abs() < 0.025, "rate {} observed {}", rate, observed);
        }
    }

    #[test]
    fn test_feature_rate_rejected_keeps_previous() {
        let toggles = FeatureToggles::default();
        toggles.set_rate(Feature::Cpu, 0.25).unwrap();
        assert!(toggles.set_rate(Feature::Cpu, 1.01).is_err());
        assert_eq!(toggles.rate(Feature::Cpu), 0.25);
    }

    #[test]
    fn test_feature_toggle_returns_previous() {
        let toggles = FeatureToggles::default();
        assert!(toggles.set_enabled(Feature::Lock, false));
        assert!(!toggles.is_enabled(Feature::Lock));
        assert!(!toggles.set_enabled(Feature::Lock, false));
        assert!(!toggles.enabled_features().contains(&Feature::Lock));
    }

    #[test]
    fn test_feature_parse() {
        assert_eq!("CPU".parse::<Feature>().unwrap(), Feature::Cpu);
        assert!(matches!(
            "heap".parse::<Feature>(),
            Err(ConfigError::UnknownFeature { .. })
        ));
    }

    #[test]
    fn test_filter_exclude_wins_over_include() {
        let filter = SubjectFilter::default();
        filter.add_include_pattern("com/acme/");
        filter.add_exclude_pattern("com/acme/internal/");

        assert!(filter.should_instrument("com/acme/OrderService"));
        assert!(!filter.should_instrument("com/acme/internal/Cache"));
        assert!(!filter.should_instrument("org/other/Thing"));
    }

    #[test]
    fn test_filter_defaults() {
        let filter = SubjectFilter::from_config(&FilterConfig::default());
        assert!(!filter.should_instrument("java/lang/String"));
        assert!(!filter.should_instrument("com/acme/Foo$$Lambda$12"));
        assert!(filter.should_instrument("com/acme/Foo"));
        assert!(!filter.should_instrument(""));
    }

    #[test]
    fn test_filter_pattern_management() {
        let filter = SubjectFilter::default();
        assert!(filter.add_exclude_pattern("org/a/"));
        assert!(!filter.add_exclude_pattern("org/a/"));
        assert!(!filter.should_instrument("org/a/B"));
        assert!(filter.remove_exclude_pattern("org/a/"));
        assert!(filter.should_instrument("org/a/B"));
        assert!(!filter.remove_include_pattern("never/added/"));

        assert!(filter.add_include_pattern(" com/shop/ "));
        assert!(!filter.add_include_pattern("com/shop/"));
        assert!(filter.remove_include_pattern("com/shop/  "));
    }
}

#[cfg(test)]
mod aggregation_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn aggregator() -> WindowedAggregator {
        WindowedAggregator::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_three_values() {
        let agg = aggregator();
        for v in [10.0, 20.0, 30.0] {
            agg.record_rt("svc.handle", v);
        }

        let out = agg.get_and_clear_aggregates();
        assert_eq!(out.len(), 1);
        let a = &out[0];
        assert_eq!(a.subject.as_str(), "svc.handle");
        assert_eq!(a.sample_count, 3);
        assert_eq!(a.min, 10.0);
        assert_eq!(a.max, 30.0);
        assert_eq!(a.avg, 20.0);
        assert_eq!(a.p50, 20.0);
    }

    #[test]
    fn test_one_to_hundred_percentiles() {
        let agg = aggregator();
        for v in 1..=100 {
            agg.record_rt("m", v as f64);
        }
        let a = agg.get_and_clear_aggregates().remove(0);
        assert_eq!(a.min, 1.0);
        assert_eq!(a.max, 100.0);
        assert!((a.p50 - 50.0).abs() <= 1.0, "p50 = {}", a.p50);
        assert!((a.p99 - 99.0).abs() <= 1.0, "p99 = {}", a.p99);
        assert!((a.p99 - 99.01).abs() < 1e-9);
    }

    #[test]
    fn test_second_drain_is_empty() {
        let agg = aggregator();
        agg.record_rt("m", 5.0);
        assert_eq!(agg.get_and_clear_aggregates().len(), 1);
        assert!(agg.get_and_clear_aggregates().is_empty());
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        assert!(aggregator().get_and_clear_aggregates().is_empty());
    }

    #[test]
    fn test_single_observation() {
        let agg = aggregator();
        agg.record_rt("only", 7.5);
        let a = agg.get_and_clear_aggregates().remove(0);
        for stat in [a.min, a.max, a.avg, a.p50, a.p99, a.p999] {
            assert_eq!(stat, 7.5);
        }
    }

    #[test]
    fn test_one_aggregate_per_subject() {
        let agg = aggregator();
        agg.record_rt("a", 1.0);
        agg.record_rt("b", 2.0);
        agg.record_rt("a", 3.0);
        let mut out = agg.get_and_clear_aggregates();
        out.sort_by(|x, y| x.subject.cmp(&y.subject));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sample_count, 2);
        assert_eq!(out[1].sample_count, 1);
    }

    #[test]
    fn test_invalid_observations_rejected() {
        let agg = aggregator();
        agg.record_rt("m", f64::NAN);
        agg.record_rt("m", f64::INFINITY);
        agg.record_rt("m", -1.0);
        assert_eq!(agg.total_rejected(), 3);
        assert!(agg.get_and_clear_aggregates().is_empty());
    }

    #[test]
    fn test_empty_subject_skipped() {
        let agg = aggregator();
        agg.record_rt("", 5.0);
        agg.record_rt("m", 5.0);
        agg.flush_window();
        assert_eq!(agg.total_rejected(), 1);

        let subjects: Vec<String> = agg
            .get_and_clear_aggregates()
            .into_iter()
            .map(|a| a.subject.to_string())
            .collect();
        assert_eq!(subjects, vec!["m".to_string()]);
    }

    #[test]
    fn test_expired_window_rolls_on_record() {
        let agg = WindowedAggregator::new(Duration::from_millis(1000));
        let t0 = Timestamp::now();
        agg.record_rt_at("m", 1.0, t0);
        agg.record_rt_at("m", 2.0, t0.add_duration(Duration::from_millis(1500)));
        agg.record_rt_at("m", 3.0, t0.add_duration(Duration::from_millis(1600)));

        let out = agg.get_and_clear_aggregates();
        let counts: Vec<u64> = out.iter().map(|a| a.sample_count).collect();
        assert_eq!(out.len(), 2, "{:?}", counts);
        assert_eq!(counts.iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let agg = Arc::new(WindowedAggregator::new(Duration::from_millis(1)));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for i in 0..5_000 {
                        agg.record_rt(if t % 2 == 0 { "even" } else { "odd" }, i as f64);
                    }
                })
            })
            .collect();

        let mut total = 0u64;
        while writers.iter().any(|w| !w.is_finished()) {
            total += agg.get_and_clear_aggregates().iter().map(|a| a.sample_count).sum::<u64>();
        }
        for w in writers {
            w.join().unwrap();
        }
        total += agg.get_and_clear_aggregates().iter().map(|a| a.sample_count).sum::<u64>();

        assert_eq!(total, 20_000);
    }

    #[test]
    fn test_percentile_interpolation() {
        let sorted = [10.0, 20.0];
        assert_eq!(interpolated_percentile(&sorted, 50.0), 15.0);
        assert_eq!(interpolated_percentile(&sorted, 0.0), 10.0);
        assert_eq!(interpolated_percentile(&sorted, 100.0), 20.0);
        assert_eq!(interpolated_percentile(&[], 50.0), 0.0);
    }

    proptest! {
        #[test]
        fn prop_stats_are_ordered(values in prop::collection::vec(0.0f64..1e6, 1..200)) {
            let mut values = values;
            let a = WindowedAggregate::from_samples("s", Timestamp::EPOCH, Timestamp::EPOCH, &mut values).unwrap();
            let eps = 1e-6;
            prop_assert!(a.min <= a.p50 + eps && a.p50 <= a.p99 + eps);
            prop_assert!(a.p99 <= a.p999 + eps && a.p999 <= a.max + eps);
            prop_assert!(a.min <= a.avg + eps && a.avg <= a.max + eps);
        }
    }
}

// ============================================================================
// SECTION 9: RUNTIME INTROSPECTION
// ============================================================================
// What the agent needs from the host runtime: per-thread CPU time, a thread
// dump with lock ownership, deadlock detection, memory pools and process load.
// The managed runtime supplies these through the RuntimeIntrospector trait;
// ProcfsIntrospector is the Linux fallback used by the standalone binary.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Shared Event Shapes
// ----------------------------------------------------------------------------

/// Thread state as reported by a thread dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

/// One entry of a thread dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: u64,
    pub name: CompactString,
    pub state: ThreadState,
    /// Lock the thread is blocked on or waiting for
    pub lock_name: Option<CompactString>,
    pub lock_owner_id: Option<u64>,
}

impl ThreadInfo {
    pub fn new(thread_id: u64, name: &str, state: ThreadState) -> Self {
        Self {
            thread_id,
            name: CompactString::new(name),
            state,
            lock_name: None,
            lock_owner_id: None,
        }
    }

    pub fn blocked_on(mut self, lock_name: &str, owner: Option<u64>) -> Self {
        self.lock_name = Some(CompactString::new(lock_name));
        self.lock_owner_id = owner;
        self
    }
}

/// Cumulative CPU time consumed by one live thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCpuTime {
    pub thread_id: u64,
    pub cpu_time_ns: u64,
}

/// Usage of one memory pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPoolUsage {
    pub name: CompactString,
    pub used_bytes: u64,
    pub committed_bytes: u64,
    pub max_bytes: Option<u64>,
    /// Part of the heap (as opposed to metaspace, code cache, stacks)
    pub heap: bool,
}

// ----------------------------------------------------------------------------
// 9.2 Introspector Trait
// ----------------------------------------------------------------------------

/// Read-only view of the host runtime. Implementations must be cheap enough to
/// call from a periodic task and must never block on the observed threads.
pub trait RuntimeIntrospector: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn supports_thread_cpu_time(&self) -> bool {
        true
    }

    fn thread_cpu_times(&self) -> IntrospectionResult<Vec<ThreadCpuTime>>;

    fn thread_dump(&self) -> IntrospectionResult<Vec<ThreadInfo>>;

    /// Ids of threads in a lock cycle, as detected by the runtime
    fn deadlocked_threads(&self) -> IntrospectionResult<Vec<u64>>;

    fn memory_pools(&self) -> IntrospectionResult<Vec<MemoryPoolUsage>>;

    /// Process CPU load normalized to `[0, 1]`, `None` when unavailable
    fn process_cpu_load(&self) -> Option<f64>;
}

// ----------------------------------------------------------------------------
// 9.3 Procfs Introspector (Linux)
// ----------------------------------------------------------------------------

/// Host-level introspection from `/proc/self` and sysinfo.
///
/// Threads are OS tasks; there is no lock-owner graph, so dumps carry no lock
/// names and deadlock detection always reports none.
pub struct ProcfsIntrospector {
    proc_root: PathBuf,
    clock_ticks_per_sec: u64,
    pid: Option<Pid>,
    system: Mutex<SysInfoSystem>,
    cpus: usize,
}

impl ProcfsIntrospector {
    pub fn new() -> Self {
        Self::with_root("/proc/self")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        // SAFETY: sysconf has no preconditions and only reads a constant.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!(target: "aletheia::introspection", "Current pid unavailable, process load disabled");
        }
        Self {
            proc_root: root.into(),
            clock_ticks_per_sec: if ticks > 0 { ticks as u64 } else { 100 },
            pid,
            system: Mutex::new(SysInfoSystem::new()),
            cpus: num_cpus(),
        }
    }

    fn task_dirs(&self) -> IntrospectionResult<Vec<(u64, PathBuf)>> {
        let task_root = self.proc_root.join("task");
        let entries = fs::read_dir(&task_root)
            .map_err(|e| IntrospectionError::read_failed(task_root.display().to_string(), e))?;

        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                tasks.push((tid, entry.path()));
            }
        }
        Ok(tasks)
    }

    fn ticks_to_nanos(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(1_000_000_000) / self.clock_ticks_per_sec
    }
}

impl Default for ProcfsIntrospector {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ProcfsIntrospector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcfsIntrospector")
            .field("proc_root", &self.proc_root)
            .field("clock_ticks_per_sec", &self.clock_ticks_per_sec)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Parsed fields of `/proc/<pid>/task/<tid>/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStat {
    pub state: char,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
}

/// Parse a task stat line. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_task_stat(content: &str) -> Option<TaskStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: SmallVec<[&str; 16]> = rest.split_whitespace().take(13).collect();
    // fields[0] is field 3 (state); utime and stime are fields 14 and 15
    Some(TaskStat {
        state: fields.first()?.chars().next()?,
        utime_ticks: fields.get(11)?.parse().ok()?,
        stime_ticks: fields.get(12)?.parse().ok()?,
    })
}

/// Value in bytes of a `Key:   1234 kB` line of `/proc/<pid>/status`
pub fn parse_status_kb(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let kb: u64 = v.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

fn thread_state_from_proc(state: char) -> ThreadState {
    match state {
        'R' => ThreadState::Runnable,
        'D' => ThreadState::Blocked,
        'S' | 'I' => ThreadState::Waiting,
        'T' | 't' => ThreadState::TimedWaiting,
        'Z' | 'X' | 'x' => ThreadState::Terminated,
        _ => ThreadState::Runnable,
    }
}

impl RuntimeIntrospector for ProcfsIntrospector {
    fn name(&self) -> &str {
        "procfs"
    }

    fn thread_cpu_times(&self) -> IntrospectionResult<Vec<ThreadCpuTime>> {
        let mut times = Vec::new();
        for (tid, dir) in self.task_dirs()? {
            // Threads exit between listing and reading; skip them.
            let Ok(content) = fs::read_to_string(dir.join("stat")) else {
                continue;
            };
            match parse_task_stat(&content) {
                Some(stat) => times.push(ThreadCpuTime {
                    thread_id: tid,
                    cpu_time_ns: self.ticks_to_nanos(stat.utime_ticks + stat.stime_ticks),
                }),
                None => debug!(target: "aletheia::introspection", tid, "Unparseable task stat"),
            }
        }
        Ok(times)
    }

    fn thread_dump(&self) -> IntrospectionResult<Vec<ThreadInfo>> {
        let mut dump = Vec::new();
        for (tid, dir) in self.task_dirs()? {
            let Ok(content) = fs::read_to_string(dir.join("stat")) else {
                continue;
            };
            let Some(stat) = parse_task_stat(&content) else {
                continue;
            };
            let name = fs::read_to_string(dir.join("comm")).unwrap_or_default();
            dump.push(ThreadInfo::new(tid, name.trim(), thread_state_from_proc(stat.state)));
        }
        Ok(dump)
    }

    fn deadlocked_threads(&self) -> IntrospectionResult<Vec<u64>> {
        Ok(Vec::new())
    }

    fn memory_pools(&self) -> IntrospectionResult<Vec<MemoryPoolUsage>> {
        let path = self.proc_root.join("status");
        let status = fs::read_to_string(&path)
            .map_err(|e| IntrospectionError::read_failed(path.display().to_string(), e))?;

        let field = |key: &'static str| {
            parse_status_kb(&status, key).ok_or(IntrospectionError::Parse {
                what: "proc status",
                message: format!("missing {}", key),
            })
        };

        Ok(vec![
            MemoryPoolUsage {
                name: CompactString::new("resident"),
                used_bytes: field("VmRSS")?,
                committed_bytes: field("VmRSS")?,
                max_bytes: parse_status_kb(&status, "VmHWM"),
                heap: true,
            },
            MemoryPoolUsage {
                name: CompactString::new("virtual"),
                used_bytes: field("VmSize")?,
                committed_bytes: field("VmSize")?,
                max_bytes: parse_status_kb(&status, "VmPeak"),
                heap: false,
            },
        ])
    }

    fn process_cpu_load(&self) -> Option<f64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        let usage = system.process(pid)?.cpu_usage() as f64;
        Some((usage / 100.0 / self.cpus.max(1) as f64).clamp(0.0, 1.0))
    }
}

// ============================================================================
// SECTION 10: DIAGNOSTIC SAMPLERS
// ============================================================================
// Periodic samplers with their own concurrent subject -> record maps:
// - CpuSampler: per-thread CPU usage between ticks
// - LockSampler: acquire/release/wait accounting and contention scans
// - MethodSampler: per-method time totals and a reservoir for percentiles
// CPU and lock records are immutable snapshots replaced whole under the
// per-key lock, so readers never see a half-updated record.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Sampler Trait
// ----------------------------------------------------------------------------

/// A sampler driven by the scheduler at a fixed period.
pub trait DiagnosticSampler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Feature that switches this sampler on and off
    fn feature(&self) -> Feature;

    fn period(&self) -> Duration;

    /// Checked once before the sampler is scheduled
    fn check_ready(&self) -> CollectorResult<()> {
        Ok(())
    }

    /// One tick. Errors are logged by the caller and the tick is skipped.
    fn sample(&self) -> CollectorResult<()>;

    fn clear(&self);
}

/// Sort descending by `key` and keep at most `n`
fn top_by<T, K: Ord>(mut items: Vec<T>, n: usize, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_unstable_by(|a, b| key(b).cmp(&key(a)));
    items.truncate(n);
    items
}

// ----------------------------------------------------------------------------
// 10.2 CPU Sampler
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadCpuSample {
    pub thread_id: u64,
    pub cumulative_cpu_ns: u64,
    pub last_sample_wall: Timestamp,
    /// Share of one core used since the previous tick, in `[0, 1]`
    pub usage_ratio: f64,
}

pub struct CpuSampler {
    introspector: Arc<dyn RuntimeIntrospector>,
    samples: DashMap<u64, Arc<ThreadCpuSample>>,
    period: Duration,
    ticks: AtomicU64,
}

impl CpuSampler {
    pub fn new(introspector: Arc<dyn RuntimeIntrospector>, period: Duration) -> Self {
        Self {
            introspector,
            samples: DashMap::new(),
            period,
            ticks: AtomicU64::new(0),
        }
    }

    pub fn sample_at(&self, now: Timestamp) -> CollectorResult<()> {
        let times = self
            .introspector
            .thread_cpu_times()
            .map_err(|e| CollectorError::sample_failed(self.name(), e.to_string()))?;

        let mut live = AHashSet::with_capacity(times.len());
        for t in &times {
            live.insert(t.thread_id);
            match self.samples.entry(t.thread_id) {
                DashEntry::Occupied(mut entry) => {
                    let previous = entry.get();
                    let wall_ms = now.duration_since(previous.last_sample_wall).as_nanos() as f64 / 1e6;
                    let cpu_ms = t.cpu_time_ns.saturating_sub(previous.cumulative_cpu_ns) as f64 / 1e6;
                    let usage_ratio = if wall_ms > 0.0 {
                        (cpu_ms / wall_ms).clamp(0.0, 1.0)
                    } else {
                        previous.usage_ratio
                    };
                    entry.insert(Arc::new(ThreadCpuSample {
                        thread_id: t.thread_id,
                        cumulative_cpu_ns: t.cpu_time_ns,
                        last_sample_wall: now,
                        usage_ratio,
                    }));
                }
                DashEntry::Vacant(entry) => {
                    entry.insert(Arc::new(ThreadCpuSample {
                        thread_id: t.thread_id,
                        cumulative_cpu_ns: t.cpu_time_ns,
                        last_sample_wall: now,
                        usage_ratio: 0.0,
                    }));
                }
            }
        }

        self.samples.retain(|id, _| live.contains(id));
        self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "aletheia::sampler::cpu", threads = live.len(), "CPU tick");
        Ok(())
    }

    pub fn get(&self, thread_id: u64) -> Option<Arc<ThreadCpuSample>> {
        self.samples.get(&thread_id).map(|s| Arc::clone(s.value()))
    }

    /// Busiest threads first
    pub fn top_n(&self, n: usize) -> Vec<Arc<ThreadCpuSample>> {
        let all: Vec<_> = self.samples.iter().map(|s| Arc::clone(s.value())).collect();
        top_by(all, n, |s| OrderedFloat(s.usage_ratio))
    }

    pub fn thread_count(&self) -> usize {
        self.samples.len()
    }
}

impl DiagnosticSampler for CpuSampler {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn feature(&self) -> Feature {
        Feature::Cpu
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn check_ready(&self) -> CollectorResult<()> {
        if self.introspector.supports_thread_cpu_time() {
            Ok(())
        } else {
            Err(CollectorError::StartFailed {
                name: self.name().into(),
                message: format!("{} does not expose thread CPU time", self.introspector.name()),
            })
        }
    }

    fn sample(&self) -> CollectorResult<()> {
        self.sample_at(Timestamp::now())
    }

    fn clear(&self) {
        self.samples.clear();
    }
}

// ----------------------------------------------------------------------------
// 10.3 Lock Sampler
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: CompactString,
    pub acquire_count: u64,
    pub wait_count: u64,
    pub total_hold_time_ns: u64,
    pub total_wait_time_ns: u64,
    /// Blocked threads seen on this lock, summed over contention scans
    pub blocked_thread_count: u64,
    pub current_holder: Option<u64>,
    /// Wall time of the holder's acquire, in nanoseconds
    pub acquired_at_ns: i64,
}

impl LockRecord {
    fn new(lock_id: &str) -> Self {
        Self {
            lock_id: CompactString::new(lock_id),
            ..Self::default()
        }
    }

    pub fn avg_hold_time_ns(&self) -> f64 {
        if self.acquire_count == 0 {
            0.0
        } else {
            self.total_hold_time_ns as f64 / self.acquire_count as f64
        }
    }

    pub fn avg_wait_time_ns(&self) -> f64 {
        if self.wait_count == 0 {
            0.0
        } else {
            self.total_wait_time_ns as f64 / self.wait_count as f64
        }
    }
}

/// Global lock contention counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContentionStats {
    pub contention_count: u64,
    pub total_wait_time_ns: u64,
    pub lock_count: usize,
}

pub struct LockSampler {
    introspector: Arc<dyn RuntimeIntrospector>,
    records: DashMap<CompactString, Arc<LockRecord>>,
    held_by_thread: DashMap<u64, CompactString>,
    contention_count: AtomicU64,
    total_wait_time_ns: AtomicU64,
    period: Duration,
}

impl LockSampler {
    pub fn new(introspector: Arc<dyn RuntimeIntrospector>, period: Duration) -> Self {
        Self {
            introspector,
            records: DashMap::new(),
            held_by_thread: DashMap::new(),
            contention_count: AtomicU64::new(0),
            total_wait_time_ns: AtomicU64::new(0),
            period,
        }
    }

    /// Replace the record for `lock_id` with `update` applied to a copy
    fn update(&self, lock_id: &str, update: impl FnOnce(&mut LockRecord)) {
        if let Some(mut slot) = self.records.get_mut(lock_id) {
            let mut next = (**slot).clone();
            update(&mut next);
            *slot = Arc::new(next);
            return;
        }
        let mut slot = self
            .records
            .entry(CompactString::new(lock_id))
            .or_insert_with(|| Arc::new(LockRecord::new(lock_id)));
        let mut next = (**slot).clone();
        update(&mut next);
        *slot = Arc::new(next);
    }

    pub fn record_acquire(&self, lock_id: &str, thread_id: u64) {
        self.record_acquire_at(lock_id, thread_id, Timestamp::now());
    }

    pub fn record_acquire_at(&self, lock_id: &str, thread_id: u64, now: Timestamp) {
        self.update(lock_id, |r| {
            r.acquire_count += 1;
            r.current_holder = Some(thread_id);
            r.acquired_at_ns = now.as_nanos();
        });
        self.held_by_thread.insert(thread_id, CompactString::new(lock_id));
    }

    pub fn record_release(&self, lock_id: &str, thread_id: u64) {
        self.record_release_at(lock_id, thread_id, Timestamp::now());
    }

    /// Hold time is counted only when the releasing thread is the recorded
    /// holder; a release from anyone else leaves the record unchanged.
    pub fn record_release_at(&self, lock_id: &str, thread_id: u64, now: Timestamp) {
        let Some(mut slot) = self.records.get_mut(lock_id) else {
            return;
        };
        if slot.current_holder != Some(thread_id) {
            return;
        }
        let mut next = (**slot).clone();
        let held = now.as_nanos().saturating_sub(next.acquired_at_ns).max(0) as u64;
        next.total_hold_time_ns = next.total_hold_time_ns.saturating_add(held);
        next.current_holder = None;
        *slot = Arc::new(next);
        drop(slot);

        self.held_by_thread
            .remove_if(&thread_id, |_, held_lock| held_lock.as_str() == lock_id);
    }

    pub fn record_wait(&self, lock_id: &str, wait_ns: u64) {
        self.update(lock_id, |r| {
            r.wait_count += 1;
            r.total_wait_time_ns = r.total_wait_time_ns.saturating_add(wait_ns);
        });
        self.contention_count.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_wait_time_ns.fetch_add(wait_ns, AtomicOrdering::Relaxed);
    }

    /// Add one to `blocked_thread_count` for every BLOCKED thread's lock
    /// in a fresh thread dump.
    pub fn sample_contention(&self) -> CollectorResult<()> {
        let dump = self
            .introspector
            .thread_dump()
            .map_err(|e| CollectorError::sample_failed(self.name(), e.to_string()))?;

        let mut blocked: AHashMap<&str, u64> = AHashMap::new();
        for thread in &dump {
            if thread.state != ThreadState::Blocked {
                continue;
            }
            if let Some(lock) = &thread.lock_name {
                *blocked.entry(lock.as_str()).or_insert(0) += 1;
            }
        }
        for (lock, count) in blocked {
            self.update(lock, |r| r.blocked_thread_count += count);
        }
        Ok(())
    }

    pub fn get(&self, lock_id: &str) -> Option<Arc<LockRecord>> {
        self.records.get(lock_id).map(|r| Arc::clone(r.value()))
    }

    /// Lock currently held by `thread_id`, if any
    pub fn held_lock(&self, thread_id: u64) -> Option<CompactString> {
        self.held_by_thread.get(&thread_id).map(|l| l.value().clone())
    }

    /// Most waited-on locks first
    pub fn top_n(&self, n: usize) -> Vec<Arc<LockRecord>> {
        let all: Vec<_> = self.records.iter().map(|r| Arc::clone(r.value())).collect();
        top_by(all, n, |r| r.wait_count)
    }

    pub fn contention_stats(&self) -> LockContentionStats {
        LockContentionStats {
            contention_count: self.contention_count.load(AtomicOrdering::Relaxed),
            total_wait_time_ns: self.total_wait_time_ns.load(AtomicOrdering::Relaxed),
            lock_count: self.records.len(),
        }
    }
}

impl DiagnosticSampler for LockSampler {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn feature(&self) -> Feature {
        Feature::Lock
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn sample(&self) -> CollectorResult<()> {
        self.sample_contention()
    }

    fn clear(&self) {
        self.records.clear();
        self.held_by_thread.clear();
        self.contention_count.store(0, AtomicOrdering::Relaxed);
        self.total_wait_time_ns.store(0, AtomicOrdering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// 10.4 Method Hotspot Sampler
// ----------------------------------------------------------------------------

/// Uniform sample of at most `capacity` values from an unbounded stream
/// (Algorithm R).
#[derive(Debug, Clone)]
pub struct Reservoir {
    values: Vec<u64>,
    seen: u64,
    capacity: usize,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity.min(1024)),
            seen: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn offer<R: Rng>(&mut self, value: u64, rng: &mut R) {
        self.seen += 1;
        if self.values.len() < self.capacity {
            self.values.push(value);
            return;
        }
        let slot = rng.gen_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.values[slot as usize] = value;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Ascending copy of the retained values, as f64
    pub fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.values.iter().map(|v| *v as f64).collect();
        sorted.sort_unstable_by_key(|v| OrderedFloat(*v));
        sorted
    }
}

#[derive(Debug)]
pub struct MethodHotspotRecord {
    pub subject: CompactString,
    invoke_count: AtomicU64,
    total_time_ns: AtomicU64,
    min_time_ns: AtomicU64,
    max_time_ns: AtomicU64,
    reservoir: Mutex<Reservoir>,
}

impl MethodHotspotRecord {
    fn new(subject: &str, capacity: usize) -> Self {
        Self {
            subject: CompactString::new(subject),
            invoke_count: AtomicU64::new(0),
            total_time_ns: AtomicU64::new(0),
            min_time_ns: AtomicU64::new(u64::MAX),
            max_time_ns: AtomicU64::new(0),
            reservoir: Mutex::new(Reservoir::new(capacity)),
        }
    }

    fn record(&self, elapsed_ns: u64) {
        self.invoke_count.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_time_ns.fetch_add(elapsed_ns, AtomicOrdering::Relaxed);
        cas_min(&self.min_time_ns, elapsed_ns);
        cas_max(&self.max_time_ns, elapsed_ns);
        self.reservoir.lock().offer(elapsed_ns, &mut thread_rng());
    }

    pub fn invoke_count(&self) -> u64 {
        self.invoke_count.load(AtomicOrdering::Relaxed)
    }

    pub fn total_time_ns(&self) -> u64 {
        self.total_time_ns.load(AtomicOrdering::Relaxed)
    }

    pub fn summary(&self) -> MethodHotspotSummary {
        let invoke_count = self.invoke_count();
        let total_time_ns = self.total_time_ns();
        let min = self.min_time_ns.load(AtomicOrdering::Relaxed);
        let sorted = self.reservoir.lock().sorted();

        MethodHotspotSummary {
            subject: self.subject.clone(),
            invoke_count,
            total_time_ns,
            min_time_ns: if min == u64::MAX { 0 } else { min },
            max_time_ns: self.max_time_ns.load(AtomicOrdering::Relaxed),
            avg_time_ns: if invoke_count == 0 {
                0.0
            } else {
                total_time_ns as f64 / invoke_count as f64
            },
            p50_ns: interpolated_percentile(&sorted, 50.0),
            p99_ns: interpolated_percentile(&sorted, 99.0),
            reservoir_size: sorted.len(),
        }
    }
}

fn cas_min(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(AtomicOrdering::Relaxed);
    while value < current {
        match cell.compare_exchange_weak(current, value, AtomicOrdering::AcqRel, AtomicOrdering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn cas_max(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(AtomicOrdering::Relaxed);
    while value > current {
        match cell.compare_exchange_weak(current, value, AtomicOrdering::AcqRel, AtomicOrdering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// Point-in-time view of one method's hotspot statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodHotspotSummary {
    pub subject: CompactString,
    pub invoke_count: u64,
    pub total_time_ns: u64,
    pub min_time_ns: u64,
    pub max_time_ns: u64,
    pub avg_time_ns: f64,
    pub p50_ns: f64,
    pub p99_ns: f64,
    pub reservoir_size: usize,
}

pub struct MethodSampler {
    records: DashMap<CompactString, Arc<MethodHotspotRecord>>,
    sample_rate: AtomicF64,
    reservoir_capacity: usize,
    total_samples: CachePadded<AtomicU64>,
    hot: ArcSwap<Vec<MethodHotspotSummary>>,
    publish_count: usize,
    period: Duration,
}

impl MethodSampler {
    pub fn new(sample_rate: f64, reservoir_capacity: usize, top_n: usize, period: Duration) -> Self {
        Self {
            records: DashMap::new(),
            sample_rate: AtomicF64::new(sample_rate.clamp(0.0, 1.0)),
            reservoir_capacity,
            total_samples: CachePadded::new(AtomicU64::new(0)),
            hot: ArcSwap::from_pointee(Vec::new()),
            publish_count: top_n,
            period,
        }
    }

    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self::new(
            config.method_sample_rate,
            config.reservoir_capacity,
            config.top_n,
            Duration::from_millis(config.method_snapshot_interval_ms),
        )
    }

    #[inline]
    pub fn should_sample(&self) -> bool {
        sample_with_rate(self.sample_rate.load(AtomicOrdering::Relaxed))
    }

    /// Gate on the sampler's own rate, then record
    pub fn record_method(&self, subject: &str, elapsed_ns: u64) {
        if self.should_sample() {
            self.record_sample(subject, elapsed_ns);
        }
    }

    /// Record an invocation that already passed a sampling decision
    pub fn record_sample(&self, subject: &str, elapsed_ns: u64) {
        let record = match self.records.get(subject) {
            Some(r) => Arc::clone(r.value()),
            None => Arc::clone(
                self.records
                    .entry(CompactString::new(subject))
                    .or_insert_with(|| Arc::new(MethodHotspotRecord::new(subject, self.reservoir_capacity)))
                    .value(),
            ),
        };
        record.record(elapsed_ns);
        self.total_samples.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.load(AtomicOrdering::Relaxed)
    }

    pub fn set_sample_rate(&self, rate: f64) -> Result<(), ConfigError> {
        check_unit_interval("diagnostics.method_sample_rate", rate)?;
        self.sample_rate.store(rate, AtomicOrdering::Relaxed);
        Ok(())
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples.load(AtomicOrdering::Relaxed)
    }

    pub fn summary(&self, subject: &str) -> Option<MethodHotspotSummary> {
        self.records.get(subject).map(|r| r.summary())
    }

    /// Methods with the most total time first
    pub fn top_n(&self, n: usize) -> Vec<MethodHotspotSummary> {
        let all: Vec<_> = self.records.iter().map(|r| Arc::clone(r.value())).collect();
        top_by(all, n, |r| r.total_time_ns())
            .iter()
            .map(|r| r.summary())
            .collect()
    }

    /// Last published top-N snapshot
    pub fn hot_methods(&self) -> Arc<Vec<MethodHotspotSummary>> {
        self.hot.load_full()
    }
}

impl DiagnosticSampler for MethodSampler {
    fn name(&self) -> &'static str {
        "method"
    }

    fn feature(&self) -> Feature {
        Feature::Method
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn sample(&self) -> CollectorResult<()> {
        self.hot.store(Arc::new(self.top_n(self.publish_count)));
        Ok(())
    }

    fn clear(&self) {
        self.records.clear();
        self.total_samples.store(0, AtomicOrdering::Relaxed);
        self.hot.store(Arc::new(Vec::new()));
    }
}

// ============================================================================
// SECTION 11: THREAD, MEMORY & GC SNAPSHOTS
// ============================================================================
// Shapes carried in a batch and evaluated by the alert engine.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Thread Snapshot
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlockedThread {
    pub thread_id: u64,
    pub name: CompactString,
    pub lock_name: Option<CompactString>,
    pub lock_owner_id: Option<u64>,
}

/// Threads blocked on one lock in a single dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockContentionInfo {
    pub lock_name: CompactString,
    pub owner_thread_id: Option<u64>,
    pub blocked_thread_count: u32,
    pub blocked_threads: Vec<CompactString>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub timestamp: Timestamp,
    pub total: u32,
    pub runnable: u32,
    pub blocked: u32,
    pub waiting: u32,
    pub timed_waiting: u32,
    pub deadlocked: Vec<DeadlockedThread>,
    pub lock_contention: Vec<LockContentionInfo>,
}

impl ThreadSnapshot {
    pub fn from_dump(dump: &[ThreadInfo], deadlocked_ids: &[u64], timestamp: Timestamp) -> Self {
        let mut snapshot = Self {
            timestamp,
            total: dump.len() as u32,
            runnable: 0,
            blocked: 0,
            waiting: 0,
            timed_waiting: 0,
            deadlocked: Vec::new(),
            lock_contention: Vec::new(),
        };

        let deadlocked_ids: AHashSet<u64> = deadlocked_ids.iter().copied().collect();
        let mut by_lock: AHashMap<&str, LockContentionInfo> = AHashMap::new();

        for thread in dump {
            match thread.state {
                ThreadState::Runnable => snapshot.runnable += 1,
                ThreadState::Blocked => snapshot.blocked += 1,
                ThreadState::Waiting => snapshot.waiting += 1,
                ThreadState::TimedWaiting => snapshot.timed_waiting += 1,
                ThreadState::New | ThreadState::Terminated => {}
            }

            if deadlocked_ids.contains(&thread.thread_id) {
                snapshot.deadlocked.push(DeadlockedThread {
                    thread_id: thread.thread_id,
                    name: thread.name.clone(),
                    lock_name: thread.lock_name.clone(),
                    lock_owner_id: thread.lock_owner_id,
                });
            }

            if thread.state == ThreadState::Blocked {
                if let Some(lock) = &thread.lock_name {
                    let info = by_lock.entry(lock.as_str()).or_insert_with(|| LockContentionInfo {
                        lock_name: lock.clone(),
                        owner_thread_id: thread.lock_owner_id,
                        blocked_thread_count: 0,
                        blocked_threads: Vec::new(),
                    });
                    info.blocked_thread_count += 1;
                    info.blocked_threads.push(thread.name.clone());
                }
            }
        }

        snapshot.lock_contention = by_lock.into_iter().map(|(_, info)| info).collect();
        snapshot
            .lock_contention
            .sort_unstable_by(|a, b| b.blocked_thread_count.cmp(&a.blocked_thread_count));
        snapshot
    }

    pub fn state_distribution(&self) -> HashMap<ThreadState, u32> {
        HashMap::from([
            (ThreadState::Runnable, self.runnable),
            (ThreadState::Blocked, self.blocked),
            (ThreadState::Waiting, self.waiting),
            (ThreadState::TimedWaiting, self.timed_waiting),
        ])
    }

    pub fn has_deadlock(&self) -> bool {
        !self.deadlocked.is_empty()
    }

    /// Human-readable description of the deadlock cycle, if any
    pub fn deadlock_report(&self) -> Option<String> {
        if self.deadlocked.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .deadlocked
            .iter()
            .map(|t| {
                format!(
                    "\"{}\" (id={}) waiting on {} held by {}",
                    t.name,
                    t.thread_id,
                    t.lock_name.as_deref().unwrap_or("<unknown>"),
                    t.lock_owner_id.map_or_else(|| "<unknown>".to_string(), |id| id.to_string()),
                )
            })
            .collect();
        Some(format!("{} deadlocked threads:\n{}", self.deadlocked.len(), lines.join("\n")))
    }
}

// ----------------------------------------------------------------------------
// 11.2 Memory Snapshot
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: Timestamp,
    pub heap_used: u64,
    pub heap_committed: u64,
    pub heap_max: Option<u64>,
    pub eden_used: u64,
    pub survivor_used: u64,
    pub old_used: u64,
    pub metaspace_used: u64,
    pub pools: Vec<MemoryPoolUsage>,
}

impl MemorySnapshot {
    pub fn from_pools(pools: Vec<MemoryPoolUsage>, timestamp: Timestamp) -> Self {
        let mut snapshot = Self {
            timestamp,
            heap_used: 0,
            heap_committed: 0,
            heap_max: Some(0),
            eden_used: 0,
            survivor_used: 0,
            old_used: 0,
            metaspace_used: 0,
            pools: Vec::new(),
        };

        for pool in &pools {
            let name = pool.name.to_ascii_lowercase();
            if name.contains("eden") {
                snapshot.eden_used += pool.used_bytes;
            } else if name.contains("survivor") {
                snapshot.survivor_used += pool.used_bytes;
            } else if name.contains("old") || name.contains("tenured") {
                snapshot.old_used += pool.used_bytes;
            } else if name.contains("metaspace") {
                snapshot.metaspace_used += pool.used_bytes;
            }

            if pool.heap {
                snapshot.heap_used += pool.used_bytes;
                snapshot.heap_committed += pool.committed_bytes;
                // One unbounded pool makes the heap unbounded
                snapshot.heap_max = match (snapshot.heap_max, pool.max_bytes) {
                    (Some(total), Some(max)) => Some(total + max),
                    _ => None,
                };
            }
        }

        snapshot.pools = pools;
        snapshot
    }

    pub fn heap_usage_ratio(&self) -> Option<f64> {
        match self.heap_max {
            Some(max) if max > 0 => Some(self.heap_used as f64 / max as f64),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// 11.3 GC Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcType {
    Young,
    Full,
}

/// Raw GC pause notification from the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcPauseEvent {
    /// Collector name, e.g. "G1 Young Generation"
    pub name: CompactString,
    /// Collector action, e.g. "end of minor GC"
    pub action: CompactString,
    pub cause: CompactString,
    pub start_ns: i64,
    pub end_ns: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcEvent {
    pub gc_type: GcType,
    pub name: CompactString,
    pub cause: CompactString,
    pub start_ns: i64,
    pub end_ns: i64,
    pub pause_ms: u64,
    pub timestamp: Timestamp,
}

impl GcEvent {
    pub fn from_pause(pause: GcPauseEvent, timestamp: Timestamp) -> Self {
        let action = pause.action.to_ascii_lowercase();
        let gc_type = if action.contains("major") || action.contains("full") {
            GcType::Full
        } else {
            GcType::Young
        };
        Self {
            gc_type,
            name: pause.name,
            cause: pause.cause,
            start_ns: pause.start_ns,
            end_ns: pause.end_ns,
            pause_ms: pause.duration_ms,
            timestamp,
        }
    }
}

#[cfg(test)]
mod diagnostics_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Introspector with scripted answers
    #[derive(Debug, Default)]
    pub(crate) struct FakeIntrospector {
        pub cpu: Mutex<Vec<ThreadCpuTime>>,
        pub dump: Mutex<Vec<ThreadInfo>>,
        pub deadlocked: Mutex<Vec<u64>>,
        pub pools: Mutex<Vec<MemoryPoolUsage>>,
        pub load: Mutex<Option<f64>>,
        pub no_cpu_time: bool,
    }

    impl RuntimeIntrospector for FakeIntrospector {
        fn name(&self) -> &str {
            "fake"
        }

        fn supports_thread_cpu_time(&self) -> bool {
            !self.no_cpu_time
        }

        fn thread_cpu_times(&self) -> IntrospectionResult<Vec<ThreadCpuTime>> {
            Ok(self.cpu.lock().clone())
        }

        fn thread_dump(&self) -> IntrospectionResult<Vec<ThreadInfo>> {
            Ok(self.dump.lock().clone())
        }

        fn deadlocked_threads(&self) -> IntrospectionResult<Vec<u64>> {
            Ok(self.deadlocked.lock().clone())
        }

        fn memory_pools(&self) -> IntrospectionResult<Vec<MemoryPoolUsage>> {
            Ok(self.pools.lock().clone())
        }

        fn process_cpu_load(&self) -> Option<f64> {
            *self.load.lock()
        }
    }

    fn cpu(thread_id: u64, cpu_time_ns: u64) -> ThreadCpuTime {
        ThreadCpuTime { thread_id, cpu_time_ns }
    }

    #[test]
    fn test_cpu_usage_between_ticks() {
        let fake = Arc::new(FakeIntrospector::default());
        let sampler = CpuSampler::new(fake.clone(), Duration::from_millis(100));
        let t0 = Timestamp::from_millis(1_000);

        *fake.cpu.lock() = vec![cpu(1, 0), cpu(2, 0)];
        sampler.sample_at(t0).unwrap();
        assert_eq!(sampler.get(1).unwrap().usage_ratio, 0.0);

        // 50ms of CPU over 100ms of wall time
        *fake.cpu.lock() = vec![cpu(1, 50_000_000), cpu(2, 10_000_000)];
        sampler.sample_at(Timestamp::from_millis(1_100)).unwrap();

        assert!((sampler.get(1).unwrap().usage_ratio - 0.5).abs() < 1e-9);
        assert!((sampler.get(2).unwrap().usage_ratio - 0.1).abs() < 1e-9);
        let top = sampler.top_n(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].thread_id, 1);
    }

    #[test]
    fn test_cpu_prunes_dead_threads() {
        let fake = Arc::new(FakeIntrospector::default());
        let sampler = CpuSampler::new(fake.clone(), Duration::from_millis(100));

        *fake.cpu.lock() = vec![cpu(1, 0), cpu(2, 0), cpu(3, 0)];
        sampler.sample_at(Timestamp::from_millis(0)).unwrap();
        assert_eq!(sampler.thread_count(), 3);

        *fake.cpu.lock() = vec![cpu(2, 1_000)];
        sampler.sample_at(Timestamp::from_millis(100)).unwrap();
        assert_eq!(sampler.thread_count(), 1);
        assert!(sampler.get(1).is_none());
        assert_eq!(sampler.top_n(10).len(), 1);
    }

    #[test]
    fn test_cpu_not_ready_without_thread_time() {
        let fake = Arc::new(FakeIntrospector {
            no_cpu_time: true,
            ..Default::default()
        });
        let sampler = CpuSampler::new(fake, Duration::from_millis(100));
        assert!(matches!(sampler.check_ready(), Err(CollectorError::StartFailed { .. })));
    }

    #[test]
    fn test_lock_hold_time_only_for_holder() {
        let sampler = LockSampler::new(Arc::new(FakeIntrospector::default()), Duration::from_secs(1));
        let t0 = Timestamp::from_millis(10_000);

        sampler.record_acquire_at("orders", 7, t0);
        assert_eq!(sampler.held_lock(7).as_deref(), Some("orders"));

        // Not the holder: ignored
        sampler.record_release_at("orders", 8, t0.add_duration(Duration::from_millis(5)));
        assert_eq!(sampler.get("orders").unwrap().total_hold_time_ns, 0);

        sampler.record_release_at("orders", 7, t0.add_duration(Duration::from_millis(20)));
        let record = sampler.get("orders").unwrap();
        assert_eq!(record.acquire_count, 1);
        assert_eq!(record.total_hold_time_ns, 20_000_000);
        assert_eq!(record.current_holder, None);
        assert!(sampler.held_lock(7).is_none());
    }

    #[test]
    fn test_lock_snapshots_are_immutable() {
        let sampler = LockSampler::new(Arc::new(FakeIntrospector::default()), Duration::from_secs(1));
        sampler.record_wait("cache", 100);
        let before = sampler.get("cache").unwrap();
        sampler.record_wait("cache", 300);
        let after = sampler.get("cache").unwrap();

        assert_eq!(before.wait_count, 1);
        assert_eq!(after.wait_count, 2);
        assert_eq!(after.total_wait_time_ns, 400);
        assert_eq!(after.avg_wait_time_ns(), 200.0);
    }

    #[test]
    fn test_lock_contention_scan_and_stats() {
        let fake = Arc::new(FakeIntrospector::default());
        let sampler = LockSampler::new(fake.clone(), Duration::from_secs(1));
        *fake.dump.lock() = vec![
            ThreadInfo::new(1, "worker-1", ThreadState::Blocked).blocked_on("db", Some(9)),
            ThreadInfo::new(2, "worker-2", ThreadState::Blocked).blocked_on("db", Some(9)),
            ThreadInfo::new(3, "worker-3", ThreadState::Waiting).blocked_on("queue", None),
            ThreadInfo::new(9, "owner", ThreadState::Runnable),
        ];

        sampler.sample_contention().unwrap();
        sampler.sample_contention().unwrap();
        assert_eq!(sampler.get("db").unwrap().blocked_thread_count, 4);
        assert!(sampler.get("queue").is_none());

        sampler.record_wait("db", 50);
        sampler.record_wait("db", 50);
        sampler.record_wait("cache", 10);
        let top = sampler.top_n(5);
        assert_eq!(top[0].lock_id.as_str(), "db");

        let stats = sampler.contention_stats();
        assert_eq!(stats.contention_count, 3);
        assert_eq!(stats.total_wait_time_ns, 110);
        assert_eq!(stats.lock_count, 2);

        sampler.clear();
        assert_eq!(sampler.contention_stats().lock_count, 0);
    }

    #[test]
    fn test_method_min_max_and_top() {
        let sampler = MethodSampler::new(1.0, 100, 10, Duration::from_secs(1));
        for ns in [300, 100, 200] {
            sampler.record_method("A.fast", ns);
        }
        sampler.record_method("B.slow", 10_000);

        let a = sampler.summary("A.fast").unwrap();
        assert_eq!(a.invoke_count, 3);
        assert_eq!(a.min_time_ns, 100);
        assert_eq!(a.max_time_ns, 300);
        assert_eq!(a.avg_time_ns, 200.0);
        assert_eq!(a.p50_ns, 200.0);

        let top = sampler.top_n(1);
        assert_eq!(top[0].subject.as_str(), "B.slow");
        assert_eq!(sampler.total_samples(), 4);

        sampler.clear();
        assert_eq!(sampler.total_samples(), 0);
        assert!(sampler.summary("A.fast").is_none());
        assert!(sampler.hot_methods().is_empty());
    }

    #[test]
    fn test_method_rate_gate_and_rejection() {
        let sampler = MethodSampler::new(0.0, 100, 10, Duration::from_secs(1));
        sampler.record_method("X.y", 1);
        assert!(sampler.summary("X.y").is_none());

        assert!(sampler.set_sample_rate(2.0).is_err());
        assert_eq!(sampler.sample_rate(), 0.0);
    }

    #[test]
    fn test_method_snapshot_published_on_tick() {
        let sampler = MethodSampler::new(1.0, 100, 2, Duration::from_secs(1));
        sampler.record_sample("a", 1);
        sampler.record_sample("b", 2);
        sampler.record_sample("c", 3);
        assert!(sampler.hot_methods().is_empty());

        sampler.sample().unwrap();
        let hot = sampler.hot_methods();
        assert_eq!(hot.len(), 2);
        assert_eq!(hot[0].subject.as_str(), "c");
    }

    #[test]
    fn test_reservoir_bounded_and_uniform() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reservoir = Reservoir::new(1_000);
        for v in 0..100_000u64 {
            reservoir.offer(v, &mut rng);
        }
        assert_eq!(reservoir.len(), 1_000);
        assert_eq!(reservoir.seen(), 100_000);

        // A uniform sample of 0..100k has a median near 50k; keep-first would give ~500.
        let median = interpolated_percentile(&reservoir.sorted(), 50.0);
        assert!((35_000.0..65_000.0).contains(&median), "median {}", median);
    }

    #[test]
    fn test_thread_snapshot_from_dump() {
        let dump: Vec<ThreadInfo> = (0..11)
            .map(|i| ThreadInfo::new(i, &format!("blocked-{}", i), ThreadState::Blocked).blocked_on("hot", Some(99)))
            .chain([
                ThreadInfo::new(99, "owner", ThreadState::Runnable),
                ThreadInfo::new(100, "sleeper", ThreadState::TimedWaiting),
            ])
            .collect();

        let snapshot = ThreadSnapshot::from_dump(&dump, &[], Timestamp::EPOCH);
        assert_eq!(snapshot.total, 13);
        assert_eq!(snapshot.blocked, 11);
        assert_eq!(snapshot.runnable, 1);
        assert_eq!(snapshot.timed_waiting, 1);
        assert_eq!(snapshot.lock_contention.len(), 1);
        assert_eq!(snapshot.lock_contention[0].blocked_thread_count, 11);
        assert_eq!(snapshot.lock_contention[0].owner_thread_id, Some(99));
        assert_eq!(snapshot.state_distribution()[&ThreadState::Blocked], 11);
        assert!(snapshot.deadlock_report().is_none());
    }

    #[test]
    fn test_deadlock_report() {
        let dump = vec![
            ThreadInfo::new(1, "a", ThreadState::Blocked).blocked_on("L1", Some(2)),
            ThreadInfo::new(2, "b", ThreadState::Blocked).blocked_on("L2", Some(1)),
        ];
        let snapshot = ThreadSnapshot::from_dump(&dump, &[1, 2], Timestamp::EPOCH);
        assert!(snapshot.has_deadlock());
        let report = snapshot.deadlock_report().unwrap();
        assert!(report.contains("\"a\" (id=1) waiting on L1 held by 2"));
    }

    #[test]
    fn test_memory_snapshot_classification() {
        let pool = |name: &str, used: u64, max: Option<u64>, heap: bool| MemoryPoolUsage {
            name: CompactString::new(name),
            used_bytes: used,
            committed_bytes: used,
            max_bytes: max,
            heap,
        };
        let snapshot = MemorySnapshot::from_pools(
            vec![
                pool("G1 Eden Space", 10, Some(100), true),
                pool("G1 Survivor Space", 5, Some(50), true),
                pool("G1 Old Gen", 40, Some(850), true),
                pool("Metaspace", 7, None, false),
            ],
            Timestamp::EPOCH,
        );
        assert_eq!(snapshot.heap_used, 55);
        assert_eq!(snapshot.heap_max, Some(1000));
        assert_eq!(snapshot.eden_used, 10);
        assert_eq!(snapshot.old_used, 40);
        assert_eq!(snapshot.metaspace_used, 7);
        assert_eq!(snapshot.heap_usage_ratio(), Some(0.055));
    }

    #[test]
    fn test_gc_classification() {
        let pause = |action: &str| GcPauseEvent {
            name: "G1".into(),
            action: action.into(),
            cause: "Allocation Failure".into(),
            start_ns: 0,
            end_ns: 0,
            duration_ms: 12,
        };
        assert_eq!(GcEvent::from_pause(pause("end of major GC"), Timestamp::EPOCH).gc_type, GcType::Full);
        assert_eq!(GcEvent::from_pause(pause("end of minor GC"), Timestamp::EPOCH).gc_type, GcType::Young);
    }

    #[test]
    fn test_parse_task_stat_with_spaces_in_comm() {
        let line = "4242 (tokio (worker) 1) S 1 4242 4242 0 -1 4194624 100 0 0 0 37 12 0 0 20 0 8 0 1234";
        let stat = parse_task_stat(line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.utime_ticks, 37);
        assert_eq!(stat.stime_ticks, 12);
        assert!(parse_task_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_status_kb() {
        let status = "Name:\tagent\nVmRSS:\t    2048 kB\nVmSize:\t  10240 kB\n";
        assert_eq!(parse_status_kb(status, "VmRSS"), Some(2048 * 1024));
        assert_eq!(parse_status_kb(status, "VmSwap"), None);
    }

    #[test]
    fn test_procfs_reads_own_process() {
        let procfs = ProcfsIntrospector::new();
        if !Path::new("/proc/self/task").exists() {
            return;
        }
        let times = procfs.thread_cpu_times().unwrap();
        assert!(!times.is_empty());
        let dump = procfs.thread_dump().unwrap();
        assert!(!dump.is_empty());
        let pools = procfs.memory_pools().unwrap();
        assert!(pools.iter().any(|p| p.heap && p.used_bytes > 0));
    }
}

// ============================================================================
// SECTION 12: ADAPTIVE RATE CONTROLLER
// ============================================================================
// Periodically reads process CPU load and moves the shared sampling rate
// between the policy bounds. A hysteresis band keeps the tier from flapping
// when load hovers around a threshold.
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadTier {
    Low,
    Normal,
    High,
}

impl LoadTier {
    /// Tier for `load`, given the tier chosen last time
    pub fn classify(load: f64, previous: LoadTier, low: f64, high: f64, band: f64) -> LoadTier {
        match previous {
            LoadTier::High if load > high - band => return LoadTier::High,
            LoadTier::Low if load < low + band => return LoadTier::Low,
            _ => {}
        }
        if load > high {
            LoadTier::High
        } else if load < low {
            LoadTier::Low
        } else {
            LoadTier::Normal
        }
    }
}

pub struct AdaptiveRateController {
    policy: Arc<SamplingPolicy>,
    introspector: Arc<dyn RuntimeIntrospector>,
    high_threshold: f64,
    low_threshold: f64,
    hysteresis_band: f64,
    fallback_load: f64,
    tier: Mutex<LoadTier>,
    adjustments: AtomicU64,
}

impl AdaptiveRateController {
    pub fn new(
        policy: Arc<SamplingPolicy>,
        introspector: Arc<dyn RuntimeIntrospector>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            policy,
            introspector,
            high_threshold: config.high_threshold,
            low_threshold: config.low_threshold,
            hysteresis_band: config.hysteresis_band,
            fallback_load: config.fallback_load,
            tier: Mutex::new(LoadTier::Normal),
            adjustments: AtomicU64::new(0),
        }
    }

    /// Read load from the introspector and adjust. Returns the new rate.
    pub fn adjust(&self) -> f64 {
        let load = match self.introspector.process_cpu_load() {
            Some(load) if load.is_finite() => load,
            _ => {
                debug!(target: "aletheia::controller", fallback = self.fallback_load, "CPU load unavailable");
                self.fallback_load
            }
        };
        self.adjust_with_load(load)
    }

    pub fn adjust_with_load(&self, load: f64) -> f64 {
        let mut tier = self.tier.lock();
        let next = LoadTier::classify(
            load,
            *tier,
            self.low_threshold,
            self.high_threshold,
            self.hysteresis_band,
        );

        let target = match next {
            LoadTier::High => self.policy.min_rate(),
            LoadTier::Low => self.policy.max_rate(),
            LoadTier::Normal => self.policy.default_rate(),
        };

        let previous_rate = self.policy.rate();
        match self.policy.set_rate(target) {
            Ok(rate) => {
                if next != *tier || rate != previous_rate {
                    info!(
                        target: "aletheia::controller",
                        load,
                        tier = ?next,
                        from = previous_rate,
                        to = rate,
                        "Sampling rate adjusted"
                    );
                }
                *tier = next;
                self.adjustments.fetch_add(1, AtomicOrdering::Relaxed);
                rate
            }
            Err(e) => {
                warn!(target: "aletheia::controller", error = %e, "Rate adjustment rejected");
                previous_rate
            }
        }
    }

    pub fn current_tier(&self) -> LoadTier {
        *self.tier.lock()
    }

    pub fn adjustments(&self) -> u64 {
        self.adjustments.load(AtomicOrdering::Relaxed)
    }
}

// ============================================================================
// SECTION 13: ANOMALY / ALERT ENGINE
// ============================================================================
// Rule checks over aggregates, GC events and snapshots. Each subject has an
// RT baseline that starts empty, is seeded by the first p99 seen and then
// follows an EWMA. Alerts go to every registered listener; a listener that
// panics is counted and skipped.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Alert Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    GcStwAnomaly,
    RtAnomaly,
    Deadlock,
    LockContention,
    MemoryLeak,
}

impl AlertType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AlertType::GcStwAnomaly => "GC_STW_ANOMALY",
            AlertType::RtAnomaly => "RT_ANOMALY",
            AlertType::Deadlock => "DEADLOCK",
            AlertType::LockContention => "LOCK_CONTENTION",
            AlertType::MemoryLeak => "MEMORY_LEAK",
        }
    }
}

impl Display for AlertType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub subject: CompactString,
    pub message: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub payload: JsonValue,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        subject: impl Into<CompactString>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            subject: subject.into(),
            message: message.into(),
            timestamp: Timestamp::now(),
            payload: JsonValue::Null,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }
}

// ----------------------------------------------------------------------------
// 13.2 Listeners
// ----------------------------------------------------------------------------

pub trait AlertListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_alert(&self, alert: &Alert);
}

/// Writes every alert to the `aletheia::alerts` log target
#[derive(Debug, Default)]
pub struct LogAlertListener;

impl AlertListener for LogAlertListener {
    fn name(&self) -> &str {
        "log"
    }

    fn on_alert(&self, alert: &Alert) {
        log_alert!(alert);
    }
}

// ----------------------------------------------------------------------------
// 13.3 Engine
// ----------------------------------------------------------------------------

pub struct AlertEngine {
    rt_multiplier: f64,
    ewma_alpha: f64,
    gc_pause_threshold_ms: u64,
    lock_blocked_threshold: u32,
    memory_growth_threshold: f64,
    baselines: DashMap<CompactString, f64>,
    previous_heap_used: Mutex<Option<u64>>,
    listeners: RwLock<Vec<Arc<dyn AlertListener>>>,
    alerts_raised: AtomicU64,
    listener_failures: AtomicU64,
}

impl AlertEngine {
    pub fn new(config: &AlertsConfig) -> Self {
        Self {
            rt_multiplier: config.rt_multiplier,
            ewma_alpha: config.ewma_alpha,
            gc_pause_threshold_ms: config.gc_pause_threshold_ms,
            lock_blocked_threshold: config.lock_blocked_threshold,
            memory_growth_threshold: config.memory_growth_threshold,
            baselines: DashMap::new(),
            previous_heap_used: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            alerts_raised: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn AlertListener>) {
        debug!(target: "aletheia::alerts", listener = listener.name(), "Alert listener added");
        self.listeners.write().push(listener);
    }

    /// Returns true if a listener with this name was removed
    pub fn remove_listener(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn baseline(&self, subject: &str) -> Option<f64> {
        self.baselines.get(subject).map(|b| *b).filter(|b| *b > 0.0)
    }

    pub fn set_baseline(&self, subject: &str, baseline: f64) {
        self.baselines.insert(CompactString::new(subject), baseline);
    }

    /// Compare an aggregate's p99 against the subject baseline.
    ///
    /// The first aggregate seeds the baseline and never alerts; after that the
    /// baseline follows an EWMA whether or not this aggregate alerted.
    pub fn check_rt(&self, aggregate: &WindowedAggregate) -> Option<Alert> {
        let current = aggregate.p99;
        if !current.is_finite() {
            return None;
        }

        match self.baselines.entry(aggregate.subject.clone()) {
            DashEntry::Vacant(entry) => {
                entry.insert(current);
                None
            }
            DashEntry::Occupied(mut entry) => {
                let baseline = *entry.get();
                if baseline <= 0.0 {
                    entry.insert(current);
                    return None;
                }

                let alert = (current > baseline * self.rt_multiplier).then(|| {
                    Alert::new(
                        AlertType::RtAnomaly,
                        AlertSeverity::Warning,
                        aggregate.subject.clone(),
                        format!(
                            "p99 {:.2}ms exceeds {:.1}x baseline {:.2}ms",
                            current, self.rt_multiplier, baseline
                        ),
                    )
                    .with_payload(json!({
                        "p99_ms": current,
                        "baseline_ms": baseline,
                        "sample_count": aggregate.sample_count,
                    }))
                });

                entry.insert(self.ewma_alpha * current + (1.0 - self.ewma_alpha) * baseline);
                alert
            }
        }
    }

    pub fn check_gc(&self, event: &GcEvent) -> Option<Alert> {
        (event.pause_ms > self.gc_pause_threshold_ms).then(|| {
            Alert::new(
                AlertType::GcStwAnomaly,
                AlertSeverity::Warning,
                event.name.clone(),
                format!(
                    "{:?} GC paused {}ms (threshold {}ms), cause: {}",
                    event.gc_type, event.pause_ms, self.gc_pause_threshold_ms, event.cause
                ),
            )
            .with_payload(json!({
                "pause_ms": event.pause_ms,
                "gc_type": event.gc_type,
                "cause": event.cause,
            }))
        })
    }

    /// One alert per lock whose blocked-thread count in this snapshot is over
    /// the threshold
    pub fn check_locks(&self, snapshot: &ThreadSnapshot) -> Vec<Alert> {
        snapshot
            .lock_contention
            .iter()
            .filter(|info| info.blocked_thread_count > self.lock_blocked_threshold)
            .map(|info| {
                Alert::new(
                    AlertType::LockContention,
                    AlertSeverity::Warning,
                    info.lock_name.clone(),
                    format!(
                        "{} threads blocked on {} (threshold {})",
                        info.blocked_thread_count, info.lock_name, self.lock_blocked_threshold
                    ),
                )
                .with_payload(json!({
                    "blocked_thread_count": info.blocked_thread_count,
                    "owner_thread_id": info.owner_thread_id,
                    "blocked_threads": info.blocked_threads,
                }))
            })
            .collect()
    }

    pub fn check_deadlock(&self, snapshot: &ThreadSnapshot) -> Option<Alert> {
        let report = snapshot.deadlock_report()?;
        let ids: Vec<u64> = snapshot.deadlocked.iter().map(|t| t.thread_id).collect();
        Some(
            Alert::new(AlertType::Deadlock, AlertSeverity::Critical, "threads", report)
                .with_payload(json!({ "thread_ids": ids })),
        )
    }

    /// Heap growth since the previous snapshot above the threshold
    pub fn check_memory(&self, snapshot: &MemorySnapshot) -> Option<Alert> {
        let current = snapshot.heap_used;
        let previous = self.previous_heap_used.lock().replace(current)?;
        if previous == 0 || current <= previous {
            return None;
        }

        let growth = (current - previous) as f64 / previous as f64;
        (growth > self.memory_growth_threshold).then(|| {
            Alert::new(
                AlertType::MemoryLeak,
                AlertSeverity::Warning,
                "heap",
                format!(
                    "heap grew {:.1}% ({} -> {} bytes)",
                    growth * 100.0,
                    previous,
                    current
                ),
            )
            .with_payload(json!({
                "previous_bytes": previous,
                "current_bytes": current,
                "growth": growth,
            }))
        })
    }

    /// Run every check over one collection tick
    pub fn evaluate(
        &self,
        aggregates: &[WindowedAggregate],
        gc_events: &[GcEvent],
        threads: Option<&ThreadSnapshot>,
        memory: Option<&MemorySnapshot>,
    ) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = aggregates.iter().filter_map(|a| self.check_rt(a)).collect();
        alerts.extend(gc_events.iter().filter_map(|e| self.check_gc(e)));
        if let Some(threads) = threads {
            alerts.extend(self.check_deadlock(threads));
            alerts.extend(self.check_locks(threads));
        }
        if let Some(memory) = memory {
            alerts.extend(self.check_memory(memory));
        }
        alerts
    }

    /// Deliver alerts to every listener
    pub fn dispatch(&self, alerts: &[Alert]) {
        if alerts.is_empty() {
            return;
        }
        self.alerts_raised.fetch_add(alerts.len() as u64, AtomicOrdering::Relaxed);

        let listeners = self.listeners.read().clone();
        for alert in alerts {
            for listener in &listeners {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_alert(alert)));
                if delivered.is_err() {
                    self.listener_failures.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(
                        target: "aletheia::alerts",
                        listener = listener.name(),
                        alert_id = %alert.id,
                        "Alert listener panicked"
                    );
                }
            }
        }
    }

    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised.load(AtomicOrdering::Relaxed)
    }

    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(AtomicOrdering::Relaxed)
    }
}

// ============================================================================
// SECTION 14: EXPORT
// ============================================================================
// One batch per push interval. Exporters only hand the batch off; transport
// lives outside the agent.
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBatch {
    pub agent: CompactString,
    pub timestamp: Timestamp,
    pub aggregates: Vec<WindowedAggregate>,
    pub gc_events: Vec<GcEvent>,
    pub thread_snapshot: Option<ThreadSnapshot>,
    pub memory_snapshot: Option<MemorySnapshot>,
    pub top_cpu_threads: Vec<Arc<ThreadCpuSample>>,
    pub top_locks: Vec<Arc<LockRecord>>,
    pub hot_methods: Vec<MethodHotspotSummary>,
    pub alerts: Vec<Alert>,
}

impl AgentBatch {
    pub fn new(agent: &str, timestamp: Timestamp) -> Self {
        Self {
            agent: CompactString::new(agent),
            timestamp,
            aggregates: Vec::new(),
            gc_events: Vec::new(),
            thread_snapshot: None,
            memory_snapshot: None,
            top_cpu_threads: Vec::new(),
            top_locks: Vec::new(),
            hot_methods: Vec::new(),
            alerts: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
            && self.gc_events.is_empty()
            && self.thread_snapshot.is_none()
            && self.memory_snapshot.is_none()
            && self.top_cpu_threads.is_empty()
            && self.top_locks.is_empty()
            && self.hot_methods.is_empty()
            && self.alerts.is_empty()
    }
}

pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    /// Hand the batch off without blocking
    fn export(&self, batch: AgentBatch) -> Result<(), ExportError>;
}

/// Hands batches to a consumer over a bounded channel. A full channel drops
/// the batch and counts it.
#[derive(Debug)]
pub struct ChannelExporter {
    sender: FlumeSender<AgentBatch>,
    capacity: usize,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelExporter {
    pub fn bounded(capacity: usize) -> (Self, FlumeReceiver<AgentBatch>) {
        let (sender, receiver) = flume::bounded(capacity);
        let exporter = Self {
            sender,
            capacity,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (exporter, receiver)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(AtomicOrdering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }
}

impl Exporter for ChannelExporter {
    fn name(&self) -> &str {
        "channel"
    }

    fn export(&self, batch: AgentBatch) -> Result<(), ExportError> {
        match self.sender.try_send(batch) {
            Ok(()) => {
                self.sent.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                Err(ExportError::ChannelFull { capacity: self.capacity })
            }
            Err(TrySendError::Disconnected(_)) => Err(ExportError::Disconnected),
        }
    }
}

/// Writes each batch as a single JSON line on `aletheia::export`
#[derive(Debug, Default)]
pub struct LogExporter;

impl Exporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    fn export(&self, batch: AgentBatch) -> Result<(), ExportError> {
        let line = serde_json::to_string(&batch).map_err(|e| ExportError::Serialization(e.to_string()))?;
        info!(
            target: "aletheia::export",
            aggregates = batch.aggregates.len(),
            alerts = batch.alerts.len(),
            "{}",
            line
        );
        Ok(())
    }
}

// ============================================================================
// SECTION 15: SELF-METRICS
// ============================================================================

/// Prometheus counters describing the agent itself
pub struct AgentMetrics {
    registry: PrometheusRegistry,
    pub rt_observations: IntCounter,
    pub aggregates_emitted: IntCounter,
    pub batches_exported: IntCounter,
    pub batches_dropped: IntCounter,
    pub alerts: IntCounterVec,
    pub collector_errors: IntCounterVec,
    pub sample_rate: Gauge,
}

impl AgentMetrics {
    pub fn new() -> AgentResult<Self> {
        Self::build().map_err(|e| AgentError::Internal(format!("metrics registry: {}", e)))
    }

    fn build() -> prometheus::Result<Self> {
        let registry = PrometheusRegistry::new_custom(Some("aletheia".into()), None)?;

        let rt_observations = IntCounter::new("rt_observations_total", "RT observations aggregated")?;
        let aggregates_emitted = IntCounter::new("aggregates_total", "Windowed aggregates emitted")?;
        let batches_exported = IntCounter::new("batches_exported_total", "Batches handed to the exporter")?;
        let batches_dropped = IntCounter::new("batches_dropped_total", "Batches the exporter refused")?;
        let alerts = IntCounterVec::new(Opts::new("alerts_total", "Alerts raised by type"), &["type"])?;
        let collector_errors = IntCounterVec::new(
            Opts::new("collector_errors_total", "Failed collector ticks"),
            &["collector"],
        )?;
        let sample_rate = Gauge::new("sample_rate", "Current RT sampling rate")?;

        registry.register(Box::new(rt_observations.clone()))?;
        registry.register(Box::new(aggregates_emitted.clone()))?;
        registry.register(Box::new(batches_exported.clone()))?;
        registry.register(Box::new(batches_dropped.clone()))?;
        registry.register(Box::new(alerts.clone()))?;
        registry.register(Box::new(collector_errors.clone()))?;
        registry.register(Box::new(sample_rate.clone()))?;

        Ok(Self {
            registry,
            rt_observations,
            aggregates_emitted,
            batches_exported,
            batches_dropped,
            alerts,
            collector_errors,
            sample_rate,
        })
    }

    pub fn record_alerts(&self, alerts: &[Alert]) {
        for alert in alerts {
            self.alerts.with_label_values(&[alert.alert_type.as_str()]).inc();
        }
    }

    pub fn record_collector_error(&self, collector: &str) {
        self.collector_errors.with_label_values(&[collector]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> AgentResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| AgentError::Internal(format!("metrics encode: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| AgentError::Internal(format!("metrics encode: {}", e)))
    }
}

impl Debug for AgentMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentMetrics")
            .field("rt_observations", &self.rt_observations.get())
            .field("batches_exported", &self.batches_exported.get())
            .finish()
    }
}

#[cfg(test)]
mod controller_tests {
    use super::*;
    use crate::diagnostics_tests::FakeIntrospector;
    use rstest::rstest;

    fn controller_with(load: Option<f64>) -> (AdaptiveRateController, Arc<SamplingPolicy>) {
        let policy = Arc::new(SamplingPolicy::default());
        let fake = Arc::new(FakeIntrospector::default());
        *fake.load.lock() = load;
        let controller = AdaptiveRateController::new(policy.clone(), fake, &ControllerConfig::default());
        (controller, policy)
    }

    #[rstest]
    #[case(0.9, MIN_SAMPLE_RATE)]
    #[case(0.3, MAX_SAMPLE_RATE)]
    #[case(0.65, DEFAULT_SAMPLE_RATE)]
    fn test_load_tiers(#[case] load: f64, #[case] expected: f64) {
        let (controller, policy) = controller_with(Some(load));
        assert_eq!(controller.adjust(), expected);
        assert_eq!(policy.rate(), expected);
    }

    #[test]
    fn test_fallback_load_when_unavailable() {
        let (controller, policy) = controller_with(None);
        controller.adjust();
        assert_eq!(controller.current_tier(), LoadTier::Normal);
        assert_eq!(policy.rate(), DEFAULT_SAMPLE_RATE);

        let (controller, policy) = controller_with(Some(f64::NAN));
        controller.adjust();
        assert_eq!(controller.current_tier(), LoadTier::Normal);
        assert_eq!(policy.rate(), DEFAULT_SAMPLE_RATE);
    }

    #[rstest]
    #[case(LoadTier::High, 0.78, LoadTier::High)]
    #[case(LoadTier::High, 0.74, LoadTier::Normal)]
    #[case(LoadTier::Low, 0.53, LoadTier::Low)]
    #[case(LoadTier::Low, 0.56, LoadTier::Normal)]
    #[case(LoadTier::Normal, 0.78, LoadTier::Normal)]
    #[case(LoadTier::Normal, 0.81, LoadTier::High)]
    fn test_hysteresis(#[case] previous: LoadTier, #[case] load: f64, #[case] expected: LoadTier) {
        assert_eq!(LoadTier::classify(load, previous, 0.5, 0.8, 0.05), expected);
    }

    #[test]
    fn test_high_load_holds_inside_band() {
        let (controller, policy) = controller_with(None);
        controller.adjust_with_load(0.95);
        controller.adjust_with_load(0.79);
        assert_eq!(policy.rate(), MIN_SAMPLE_RATE);
        controller.adjust_with_load(0.6);
        assert_eq!(policy.rate(), DEFAULT_SAMPLE_RATE);
        assert_eq!(controller.adjustments(), 3);
    }
}

#[cfg(test)]
mod alert_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<Alert>>,
    }

    impl AlertListener for RecordingListener {
        fn name(&self) -> &str {
            "recording"
        }

        fn on_alert(&self, alert: &Alert) {
            self.seen.lock().push(alert.clone());
        }
    }

    struct PanickingListener;

    impl AlertListener for PanickingListener {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_alert(&self, _alert: &Alert) {
            panic!("listener failure");
        }
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(&AlertsConfig::default())
    }

    fn aggregate(subject: &str, p99: f64) -> WindowedAggregate {
        WindowedAggregate::from_samples(subject, Timestamp::EPOCH, Timestamp::from_millis(1_000), &mut [p99]).unwrap()
    }

    fn gc(pause_ms: u64) -> GcEvent {
        GcEvent::from_pause(
            GcPauseEvent {
                name: "G1 Old Generation".into(),
                action: "end of major GC".into(),
                cause: "System.gc()".into(),
                start_ns: 0,
                end_ns: pause_ms as i64 * 1_000_000,
                duration_ms: pause_ms,
            },
            Timestamp::EPOCH,
        )
    }

    #[test]
    fn test_first_aggregate_seeds_baseline() {
        let engine = engine();
        assert!(engine.check_rt(&aggregate("svc", 500.0)).is_none());
        assert_eq!(engine.baseline("svc"), Some(500.0));
    }

    #[rstest]
    #[case(200.0, true)]
    #[case(50.0, false)]
    #[case(150.0, false)]
    fn test_rt_against_baseline(#[case] p99: f64, #[case] alerts: bool) {
        let engine = engine();
        engine.set_baseline("svc", 50.0);
        let alert = engine.check_rt(&aggregate("svc", p99));
        assert_eq!(alert.is_some(), alerts);
        if let Some(alert) = alert {
            assert_eq!(alert.alert_type, AlertType::RtAnomaly);
            assert_eq!(alert.subject.as_str(), "svc");
        }
    }

    #[test]
    fn test_baseline_ewma_updates_after_alert() {
        let engine = engine();
        engine.set_baseline("svc", 50.0);
        assert!(engine.check_rt(&aggregate("svc", 200.0)).is_some());
        // 0.1 * 200 + 0.9 * 50
        assert!((engine.baseline("svc").unwrap() - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_positive_baseline_is_reseeded() {
        let engine = engine();
        engine.set_baseline("svc", 0.0);
        assert_eq!(engine.baseline("svc"), None);
        assert!(engine.check_rt(&aggregate("svc", 1_000.0)).is_none());
        assert_eq!(engine.baseline("svc"), Some(1_000.0));
    }

    #[rstest]
    #[case(50, false)]
    #[case(1_000, false)]
    #[case(2_000, true)]
    fn test_gc_pause_threshold(#[case] pause_ms: u64, #[case] alerts: bool) {
        let alert = engine().check_gc(&gc(pause_ms));
        assert_eq!(alert.is_some(), alerts);
        if let Some(alert) = alert {
            assert_eq!(alert.alert_type, AlertType::GcStwAnomaly);
        }
    }

    #[test]
    fn test_lock_contention_one_alert_per_tick() {
        let mut dump: Vec<ThreadInfo> = (0..11)
            .map(|i| ThreadInfo::new(i, "worker", ThreadState::Blocked).blocked_on("hot-lock", Some(100)))
            .collect();
        dump.extend((20..25).map(|i| ThreadInfo::new(i, "other", ThreadState::Blocked).blocked_on("cool-lock", None)));
        let snapshot = ThreadSnapshot::from_dump(&dump, &[], Timestamp::EPOCH);

        let engine = engine();
        let alerts = engine.check_locks(&snapshot);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject.as_str(), "hot-lock");
        assert_eq!(alerts[0].payload["blocked_thread_count"], 11);

        // Next tick, same dump: again exactly one
        assert_eq!(engine.check_locks(&snapshot).len(), 1);
    }

    #[test]
    fn test_deadlock_is_critical() {
        let dump = vec![
            ThreadInfo::new(1, "a", ThreadState::Blocked).blocked_on("L1", Some(2)),
            ThreadInfo::new(2, "b", ThreadState::Blocked).blocked_on("L2", Some(1)),
        ];
        let engine = engine();
        let clean = ThreadSnapshot::from_dump(&dump, &[], Timestamp::EPOCH);
        assert!(engine.check_deadlock(&clean).is_none());

        let stuck = ThreadSnapshot::from_dump(&dump, &[1, 2], Timestamp::EPOCH);
        let alert = engine.check_deadlock(&stuck).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.alert_type, AlertType::Deadlock);
    }

    #[test]
    fn test_memory_growth() {
        let snapshot = |used: u64| MemorySnapshot {
            timestamp: Timestamp::EPOCH,
            heap_used: used,
            heap_committed: used,
            heap_max: None,
            eden_used: 0,
            survivor_used: 0,
            old_used: 0,
            metaspace_used: 0,
            pools: Vec::new(),
        };
        let engine = engine();
        assert!(engine.check_memory(&snapshot(1_000)).is_none());
        assert!(engine.check_memory(&snapshot(1_100)).is_none());
        let alert = engine.check_memory(&snapshot(1_500)).unwrap();
        assert_eq!(alert.alert_type, AlertType::MemoryLeak);
        assert!(engine.check_memory(&snapshot(900)).is_none());
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let engine = engine();
        let recorder = Arc::new(RecordingListener::default());
        engine.add_listener(Arc::new(PanickingListener));
        engine.add_listener(recorder.clone());

        let alert = engine.check_gc(&gc(5_000)).unwrap();
        engine.dispatch(&[alert.clone()]);

        assert_eq!(recorder.seen.lock().as_slice(), &[alert]);
        assert_eq!(engine.listener_failures(), 1);
        assert_eq!(engine.alerts_raised(), 1);
    }

    #[test]
    fn test_remove_listener() {
        let engine = engine();
        engine.add_listener(Arc::new(LogAlertListener));
        assert!(engine.remove_listener("log"));
        assert!(!engine.remove_listener("log"));
        assert_eq!(engine.listener_count(), 0);
    }

    #[test]
    fn test_evaluate_combines_checks() {
        let engine = engine();
        engine.set_baseline("svc", 10.0);
        let alerts = engine.evaluate(&[aggregate("svc", 100.0)], &[gc(3_000), gc(10)], None, None);
        let types: Vec<AlertType> = alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(types, vec![AlertType::RtAnomaly, AlertType::GcStwAnomaly]);
    }
}


// ============================================================================
// SECTION 16: COLLECTION SCHEDULER
// ============================================================================
// Periodic tasks on the shared tokio runtime. Every task runs under a child
// of one root cancellation token so a single cancel stops them all; samplers
// get their own child token so they can be stopped one at a time.
// ============================================================================

pub struct CollectionScheduler {
    runtime: RuntimeHandle,
    root: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    collectors: DashMap<Feature, CancellationToken>,
    grace_period: Duration,
    running: AtomicBool,
    error_stats: Arc<ErrorStats>,
    metrics: Arc<AgentMetrics>,
}

impl CollectionScheduler {
    pub fn new(
        runtime: RuntimeHandle,
        grace_period: Duration,
        error_stats: Arc<ErrorStats>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            runtime,
            root: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            collectors: DashMap::new(),
            grace_period,
            running: AtomicBool::new(true),
            error_stats,
            metrics,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    /// Token cancelled when the scheduler stops
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Run `job` every `period` until `token` is cancelled or the job returns
    /// false. The first tick fires one period after spawning. Jobs read
    /// procfs and the host, so each tick runs on the blocking pool.
    pub fn spawn_periodic<F>(&self, name: &'static str, period: Duration, token: CancellationToken, job: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let job = Arc::new(Mutex::new(job));
        let runtime = self.runtime.clone();
        let task = async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let job = Arc::clone(&job);
                        let tick = move || {
                            let mut job = job.lock();
                            (*job)()
                        };
                        match runtime.spawn_blocking(tick).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                warn!(target: "aletheia::scheduler", task = name, error = %e, "Periodic tick panicked");
                            }
                        }
                    }
                }
            }
            debug!(target: "aletheia::scheduler", task = name, "Periodic task stopped");
        };

        let mut tasks = self.tasks.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                debug!(target: "aletheia::scheduler", error = %e, "Reaped failed task");
            }
        }
        tasks.spawn_on(task, &self.runtime);
        debug!(target: "aletheia::scheduler", task = name, period_ms = period.as_millis() as u64, "Periodic task spawned");
    }

    /// Tasks spawned and not yet reaped
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Schedule a sampler. Returns `Ok(false)` if one is already running for
    /// its feature; a failed readiness check leaves nothing scheduled.
    pub fn start_sampler(&self, sampler: Arc<dyn DiagnosticSampler>) -> CollectorResult<bool> {
        if !self.is_running() {
            return Err(CollectorError::StartFailed {
                name: sampler.name().into(),
                message: "scheduler is stopped".into(),
            });
        }

        let feature = sampler.feature();
        let token = match self.collectors.entry(feature) {
            DashEntry::Occupied(_) => {
                info!(target: "aletheia::scheduler", collector = sampler.name(), "Collector already running");
                return Ok(false);
            }
            DashEntry::Vacant(entry) => {
                sampler.check_ready()?;
                entry.insert(self.root.child_token()).value().clone()
            }
        };

        let name = sampler.name();
        let period = sampler.period();
        let error_stats = Arc::clone(&self.error_stats);
        let metrics = Arc::clone(&self.metrics);
        self.spawn_periodic(name, period, token, move || {
            if let Err(e) = sampler.sample() {
                debug!(target: "aletheia::scheduler", collector = name, error = %e, "Sampler tick failed");
                metrics.record_collector_error(name);
                error_stats.record(&AgentError::Collector(e));
            }
            true
        });

        info!(target: "aletheia::scheduler", collector = name, period_ms = period.as_millis() as u64, "Collector started");
        Ok(true)
    }

    /// Start each sampler; failures are logged and skipped. Returns how many
    /// were started.
    pub fn start_all(&self, samplers: &[Arc<dyn DiagnosticSampler>]) -> usize {
        let mut started = 0;
        for sampler in samplers {
            match self.start_sampler(Arc::clone(sampler)) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(target: "aletheia::scheduler", collector = sampler.name(), error = %e, "Collector failed to start");
                    self.metrics.record_collector_error(sampler.name());
                    self.error_stats.record(&AgentError::Collector(e));
                }
            }
        }
        started
    }

    /// Returns false if nothing was running for `feature`
    pub fn stop_collector(&self, feature: Feature) -> bool {
        match self.collectors.remove(&feature) {
            Some((_, token)) => {
                token.cancel();
                info!(target: "aletheia::scheduler", collector = %feature, "Collector stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_collector_running(&self, feature: Feature) -> bool {
        self.collectors.contains_key(&feature)
    }

    pub fn running_collectors(&self) -> Vec<Feature> {
        let mut features: Vec<Feature> = self.collectors.iter().map(|e| *e.key()).collect();
        features.sort_unstable();
        features
    }

    /// Cancel every task, wait up to the grace period for in-flight ticks,
    /// then abort whatever is left.
    pub async fn stop(&self) {
        if !self.running.swap(false, AtomicOrdering::AcqRel) {
            return;
        }
        self.root.cancel();
        self.collectors.clear();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let pending = tasks.len();
        let drained = timeout(self.grace_period, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                target: "aletheia::scheduler",
                grace_ms = self.grace_period.as_millis() as u64,
                remaining = tasks.len(),
                "Grace period elapsed, aborting tasks"
            );
            tasks.shutdown().await;
        }
        info!(target: "aletheia::scheduler", tasks = pending, "Scheduler stopped");
    }
}

// ============================================================================
// SECTION 17: AGENT
// ============================================================================
// The facade wiring everything together. Probe callbacks are the hot path:
// they read a toggle, draw from the gate and touch thread-local state or a
// concurrent map, and never return errors or panic out.
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 Probe Stack
// ----------------------------------------------------------------------------

/// One open call. Unsampled calls push a frame with no start time so that
/// ends pair with their own start under recursion.
#[derive(Debug, Clone, Copy)]
struct ProbeFrame {
    subject_hash: u64,
    started: Option<QuantaInstant>,
    rt: bool,
    method: bool,
}

thread_local! {
    static PROBE_STACK: RefCell<SmallVec<[ProbeFrame; PROBE_STACK_INLINE]>> = RefCell::new(SmallVec::new());
}

// ----------------------------------------------------------------------------
// 17.2 Status
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub instance: CompactString,
    pub version: String,
    pub uptime_ms: u64,
    pub running: bool,
    pub sample_rate: f64,
    pub enabled_features: Vec<Feature>,
    pub running_collectors: Vec<Feature>,
    pub total_sampled: u64,
    pub pending_subjects: usize,
    pub method_samples: u64,
    pub alerts_raised: u64,
    pub batches_exported: u64,
    pub errors: u64,
}

// ----------------------------------------------------------------------------
// 17.3 Agent
// ----------------------------------------------------------------------------

pub struct Agent {
    config: AgentConfig,
    instance: CompactString,
    policy: Arc<SamplingPolicy>,
    gate: SamplingGate,
    toggles: FeatureToggles,
    filter: SubjectFilter,
    aggregator: WindowedAggregator,
    cpu_sampler: Arc<CpuSampler>,
    lock_sampler: Arc<LockSampler>,
    method_sampler: Arc<MethodSampler>,
    controller: AdaptiveRateController,
    alerts: AlertEngine,
    exporter: Arc<dyn Exporter>,
    introspector: Arc<dyn RuntimeIntrospector>,
    scheduler: CollectionScheduler,
    gc_events: SegQueue<GcEvent>,
    metrics: Arc<AgentMetrics>,
    error_stats: Arc<ErrorStats>,
    started_at: Timestamp,
    started: AtomicBool,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        introspector: Arc<dyn RuntimeIntrospector>,
        exporter: Arc<dyn Exporter>,
        runtime: RuntimeHandle,
    ) -> AgentResult<Arc<Self>> {
        config.validate()?;

        let policy = Arc::new(SamplingPolicy::from_config(&config.sampling)?);
        let metrics = Arc::new(AgentMetrics::new()?);
        let error_stats = Arc::new(ErrorStats::new());
        let diagnostics = &config.diagnostics;

        let alerts = AlertEngine::new(&config.alerts);
        if config.alerts.log_alerts {
            alerts.add_listener(Arc::new(LogAlertListener));
        }
        metrics.sample_rate.set(policy.rate());

        let agent = Self {
            instance: CompactString::new(&config.agent.instance_name),
            gate: SamplingGate::new(Arc::clone(&policy)),
            toggles: FeatureToggles::from_config(&config),
            filter: SubjectFilter::from_config(&config.filter),
            aggregator: WindowedAggregator::new(Duration::from_millis(config.sampling.window_size_ms)),
            cpu_sampler: Arc::new(CpuSampler::new(
                Arc::clone(&introspector),
                Duration::from_millis(diagnostics.cpu_interval_ms),
            )),
            lock_sampler: Arc::new(LockSampler::new(
                Arc::clone(&introspector),
                Duration::from_millis(diagnostics.lock_scan_interval_ms),
            )),
            method_sampler: Arc::new(MethodSampler::from_config(diagnostics)),
            controller: AdaptiveRateController::new(Arc::clone(&policy), Arc::clone(&introspector), &config.controller),
            alerts,
            exporter,
            scheduler: CollectionScheduler::new(
                runtime,
                Duration::from_millis(config.agent.shutdown_grace_ms),
                Arc::clone(&error_stats),
                Arc::clone(&metrics),
            ),
            introspector,
            policy,
            gc_events: SegQueue::new(),
            metrics,
            error_stats,
            started_at: Timestamp::now(),
            started: AtomicBool::new(false),
            config,
        };

        info!(
            target: "aletheia::agent",
            instance = %agent.instance,
            introspector = agent.introspector.name(),
            exporter = agent.exporter.name(),
            sample_rate = agent.policy.rate(),
            "Agent created"
        );
        Ok(Arc::new(agent))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn sampler_for(&self, feature: Feature) -> Option<Arc<dyn DiagnosticSampler>> {
        match feature {
            Feature::Cpu => Some(Arc::clone(&self.cpu_sampler) as Arc<dyn DiagnosticSampler>),
            Feature::Lock => Some(Arc::clone(&self.lock_sampler) as Arc<dyn DiagnosticSampler>),
            Feature::Method => Some(Arc::clone(&self.method_sampler) as Arc<dyn DiagnosticSampler>),
            _ => None,
        }
    }

    /// Schedule collection, rate adjustment and the enabled samplers.
    /// Scheduled tasks hold a weak reference, so dropping the last `Arc`
    /// lets them wind down on their own.
    pub fn start(self: &Arc<Self>) -> AgentResult<()> {
        if !self.scheduler.is_running() {
            return Err(AgentError::ShuttingDown);
        }
        if self.started.swap(true, AtomicOrdering::AcqRel) {
            debug!(target: "aletheia::agent", "Agent already started");
            return Ok(());
        }

        let weak: Weak<Agent> = Arc::downgrade(self);
        self.scheduler.spawn_periodic(
            "collect",
            Duration::from_millis(self.config.agent.push_interval_ms),
            self.scheduler.child_token(),
            move || match weak.upgrade() {
                Some(agent) => {
                    agent.collect_once();
                    true
                }
                None => false,
            },
        );

        if self.config.controller.enabled {
            let weak: Weak<Agent> = Arc::downgrade(self);
            self.scheduler.spawn_periodic(
                "rate-controller",
                Duration::from_millis(self.config.controller.interval_ms),
                self.scheduler.child_token(),
                move || match weak.upgrade() {
                    Some(agent) => {
                        agent.adjust_sampling_rate();
                        true
                    }
                    None => false,
                },
            );
        }

        let samplers: Vec<Arc<dyn DiagnosticSampler>> = [Feature::Cpu, Feature::Lock, Feature::Method]
            .into_iter()
            .filter(|f| self.toggles.is_enabled(*f))
            .filter_map(|f| self.sampler_for(f))
            .collect();
        let started = self.scheduler.start_all(&samplers);

        info!(
            target: "aletheia::agent",
            samplers = started,
            features = ?self.toggles.enabled_features(),
            "Agent started"
        );
        Ok(())
    }

    /// Stop every task and flush what was recorded before the stop
    pub async fn stop(&self) {
        self.started.store(false, AtomicOrdering::Release);
        self.scheduler.stop().await;
        let flushed = match RuntimeHandle::try_current().map(|h| h.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| self.collect_once()),
            _ => self.collect_once(),
        };
        info!(target: "aletheia::agent", flushed, "Agent stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(AtomicOrdering::Acquire) && self.scheduler.is_running()
    }

    // ---- 17.3.1 Probe callbacks

    #[inline]
    pub fn on_method_start(&self, subject: &str) {
        let rt_on = self.toggles.is_enabled(Feature::Rt);
        let method_on = self.toggles.is_enabled(Feature::Method);
        if !(rt_on || method_on) {
            return;
        }
        let rt = rt_on && self.gate.should_sample();
        let method = method_on && self.method_sampler.should_sample();

        let frame = ProbeFrame {
            subject_hash: xxh3_64(subject.as_bytes()),
            started: (rt || method).then(QuantaInstant::now),
            rt,
            method,
        };
        let _ = PROBE_STACK.try_with(|stack| {
            if let Ok(mut stack) = stack.try_borrow_mut() {
                if stack.len() >= MAX_PROBE_DEPTH {
                    stack.remove(0);
                }
                stack.push(frame);
            }
        });
    }

    /// Pairs with the innermost open start for the same subject. Frames above
    /// it belong to calls whose end never arrived and are discarded; an end
    /// with no open start is ignored.
    #[inline]
    pub fn on_method_end(&self, subject: &str) {
        let hash = xxh3_64(subject.as_bytes());
        let frame = PROBE_STACK
            .try_with(|stack| {
                let mut stack = stack.try_borrow_mut().ok()?;
                let idx = stack.iter().rposition(|f| f.subject_hash == hash)?;
                let frame = stack[idx];
                stack.truncate(idx);
                Some(frame)
            })
            .ok()
            .flatten();

        let Some((frame, started)) = frame.and_then(|f| f.started.map(|s| (f, s))) else {
            return;
        };
        let elapsed = QuantaInstant::now().duration_since(started);
        if frame.rt && self.toggles.is_enabled(Feature::Rt) {
            self.aggregator.record_rt(subject, elapsed.as_secs_f64() * 1_000.0);
        }
        if frame.method && self.toggles.is_enabled(Feature::Method) {
            self.method_sampler.record_sample(subject, elapsed.as_nanos() as u64);
        }
    }

    /// Record an already-measured latency, subject to the RT gate
    pub fn record_rt(&self, subject: &str, latency_ms: f64) {
        if self.toggles.is_enabled(Feature::Rt) && self.gate.should_sample() {
            self.aggregator.record_rt(subject, latency_ms);
        }
    }

    pub fn on_lock_acquire(&self, lock_id: &str, thread_id: u64) {
        if self.toggles.is_enabled(Feature::Lock) {
            self.lock_sampler.record_acquire(lock_id, thread_id);
        }
    }

    pub fn on_lock_release(&self, lock_id: &str, thread_id: u64) {
        if self.toggles.is_enabled(Feature::Lock) {
            self.lock_sampler.record_release(lock_id, thread_id);
        }
    }

    pub fn on_lock_wait(&self, lock_id: &str, wait_ns: u64) {
        if self.toggles.is_enabled(Feature::Lock) {
            self.lock_sampler.record_wait(lock_id, wait_ns);
        }
    }

    pub fn on_gc_pause(&self, event: GcPauseEvent) {
        if self.toggles.is_enabled(Feature::Gc) {
            self.gc_events.push(GcEvent::from_pause(event, Timestamp::now()));
        }
    }

    // ---- 17.3.2 Collection

    fn snapshot_threads(&self, now: Timestamp) -> Option<ThreadSnapshot> {
        let dump = match self.introspector.thread_dump() {
            Ok(dump) => dump,
            Err(e) => {
                debug!(target: "aletheia::agent", error = %e, "Thread dump failed");
                self.metrics.record_collector_error("thread");
                self.error_stats.record(&AgentError::Introspection(e));
                return None;
            }
        };
        let deadlocked = self.introspector.deadlocked_threads().unwrap_or_else(|e| {
            debug!(target: "aletheia::agent", error = %e, "Deadlock detection failed");
            self.error_stats.record(&AgentError::Introspection(e));
            Vec::new()
        });
        Some(ThreadSnapshot::from_dump(&dump, &deadlocked, now))
    }

    fn snapshot_memory(&self, now: Timestamp) -> Option<MemorySnapshot> {
        match self.introspector.memory_pools() {
            Ok(pools) => Some(MemorySnapshot::from_pools(pools, now)),
            Err(e) => {
                debug!(target: "aletheia::agent", error = %e, "Memory pools unavailable");
                self.metrics.record_collector_error("memory");
                self.error_stats.record(&AgentError::Introspection(e));
                None
            }
        }
    }

    /// One collect-and-export tick. Returns true if a batch was handed to the
    /// exporter.
    pub fn collect_once(&self) -> bool {
        let now = Timestamp::now();
        let mut batch = AgentBatch::new(&self.instance, now);

        batch.aggregates = self.aggregator.get_and_clear_aggregates();
        while let Some(event) = self.gc_events.pop() {
            batch.gc_events.push(event);
        }

        let thread_on = self.toggles.is_enabled(Feature::Thread);
        let lock_on = self.toggles.is_enabled(Feature::Lock);
        let threads = if thread_on || lock_on {
            self.snapshot_threads(now)
        } else {
            None
        };
        let memory = if self.toggles.is_enabled(Feature::Memory) {
            self.snapshot_memory(now)
        } else {
            None
        };

        let top_n = self.config.diagnostics.top_n;
        if self.toggles.is_enabled(Feature::Cpu) {
            batch.top_cpu_threads = self.cpu_sampler.top_n(top_n);
        }
        if lock_on {
            batch.top_locks = self.lock_sampler.top_n(top_n);
        }
        if self.toggles.is_enabled(Feature::Method) {
            batch.hot_methods = (*self.method_sampler.hot_methods()).clone();
        }

        let alerts = self
            .alerts
            .evaluate(&batch.aggregates, &batch.gc_events, threads.as_ref(), memory.as_ref());
        self.alerts.dispatch(&alerts);
        self.metrics.record_alerts(&alerts);
        batch.alerts = alerts;
        batch.thread_snapshot = threads.filter(|_| thread_on);
        batch.memory_snapshot = memory;

        let observations: u64 = batch.aggregates.iter().map(|a| a.sample_count).sum();
        self.metrics.rt_observations.inc_by(observations);
        self.metrics.aggregates_emitted.inc_by(batch.aggregates.len() as u64);
        self.metrics.sample_rate.set(self.policy.rate());

        if batch.is_empty() {
            trace!(target: "aletheia::agent", "Nothing to export");
            return false;
        }

        let aggregates = batch.aggregates.len();
        match self.exporter.export(batch) {
            Ok(()) => {
                self.metrics.batches_exported.inc();
                trace!(target: "aletheia::agent", aggregates, "Batch exported");
                true
            }
            Err(e) => {
                self.metrics.batches_dropped.inc();
                warn!(target: "aletheia::agent", exporter = self.exporter.name(), error = %e, "Batch export failed");
                self.error_stats.record(&AgentError::Export(e));
                false
            }
        }
    }

    /// Run the rate controller once. Returns the new RT rate.
    pub fn adjust_sampling_rate(&self) -> f64 {
        let rate = self.controller.adjust();
        if let Err(e) = self.toggles.set_rate(Feature::Rt, rate) {
            debug!(target: "aletheia::agent", error = %e, "RT toggle rate not updated");
        }
        self.metrics.sample_rate.set(rate);
        rate
    }

    // ---- 17.3.3 Control surface

    /// Switch a feature on and start its sampler. Returns false if it was
    /// already on.
    pub fn enable_collector(&self, feature: Feature) -> AgentResult<bool> {
        let was_enabled = self.toggles.set_enabled(feature, true);
        if self.started.load(AtomicOrdering::Acquire) {
            if let Some(sampler) = self.sampler_for(feature) {
                if let Err(e) = self.scheduler.start_sampler(sampler) {
                    self.toggles.set_enabled(feature, was_enabled);
                    return Err(e.into());
                }
            }
        }
        if !was_enabled {
            info!(target: "aletheia::agent", feature = %feature, "Collector enabled");
        }
        Ok(!was_enabled)
    }

    /// Switch a feature off and stop its sampler. Returns false if it was
    /// already off.
    pub fn disable_collector(&self, feature: Feature) -> bool {
        let was_enabled = self.toggles.set_enabled(feature, false);
        self.scheduler.stop_collector(feature);
        if was_enabled {
            info!(target: "aletheia::agent", feature = %feature, "Collector disabled");
        }
        was_enabled
    }

    pub fn is_collector_enabled(&self, feature: Feature) -> bool {
        self.toggles.is_enabled(feature)
    }

    /// Set a feature's sampling rate. Values outside `[0, 1]` are rejected and
    /// the previous rate is kept. The RT rate is additionally clamped into the
    /// policy bounds; the effective rate is returned.
    pub fn set_sampling_rate(&self, feature: Feature, rate: f64) -> AgentResult<f64> {
        check_unit_interval(&format!("features.{}.rate", feature), rate)?;
        let effective = match feature {
            Feature::Rt => {
                let effective = self.policy.set_rate(rate)?;
                self.metrics.sample_rate.set(effective);
                effective
            }
            Feature::Method => {
                self.method_sampler.set_sample_rate(rate)?;
                rate
            }
            _ => rate,
        };
        self.toggles.set_rate(feature, effective)?;
        Ok(effective)
    }

    pub fn sampling_rate(&self, feature: Feature) -> f64 {
        match feature {
            Feature::Rt => self.policy.rate(),
            Feature::Method => self.method_sampler.sample_rate(),
            _ => self.toggles.rate(feature),
        }
    }

    pub fn should_instrument(&self, class_name: &str) -> bool {
        self.filter.should_instrument(class_name)
    }

    pub fn add_include_pattern(&self, pattern: &str) -> bool {
        self.filter.add_include_pattern(pattern)
    }

    pub fn remove_include_pattern(&self, pattern: &str) -> bool {
        self.filter.remove_include_pattern(pattern)
    }

    pub fn add_exclude_pattern(&self, pattern: &str) -> bool {
        self.filter.add_exclude_pattern(pattern)
    }

    pub fn remove_exclude_pattern(&self, pattern: &str) -> bool {
        self.filter.remove_exclude_pattern(pattern)
    }

    pub fn add_alert_listener(&self, listener: Arc<dyn AlertListener>) {
        self.alerts.add_listener(listener);
    }

    pub fn remove_alert_listener(&self, name: &str) -> bool {
        self.alerts.remove_listener(name)
    }

    // ---- 17.3.4 Queries

    pub fn cpu_sampler(&self) -> &CpuSampler {
        &self.cpu_sampler
    }

    pub fn lock_sampler(&self) -> &LockSampler {
        &self.lock_sampler
    }

    pub fn method_sampler(&self) -> &MethodSampler {
        &self.method_sampler
    }

    pub fn alert_engine(&self) -> &AlertEngine {
        &self.alerts
    }

    pub fn error_stats(&self) -> &ErrorStats {
        &self.error_stats
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            instance: self.instance.clone(),
            version: AGENT_VERSION.to_string(),
            uptime_ms: Timestamp::now().duration_since(self.started_at).as_millis() as u64,
            running: self.is_running(),
            sample_rate: self.policy.rate(),
            enabled_features: self.toggles.enabled_features(),
            running_collectors: self.scheduler.running_collectors(),
            total_sampled: self.gate.total_sampled(),
            pending_subjects: self.aggregator.pending_subjects(),
            method_samples: self.method_sampler.total_samples(),
            alerts_raised: self.alerts.alerts_raised(),
            batches_exported: self.metrics.batches_exported.get(),
            errors: self.error_stats.total_errors(),
        }
    }

    pub fn metrics_text(&self) -> AgentResult<String> {
        self.metrics.render()
    }
}

// ----------------------------------------------------------------------------
// 17.4 Global Probe
// ----------------------------------------------------------------------------

static GLOBAL_AGENT: OnceCell<Arc<Agent>> = OnceCell::new();

/// Install the process-wide agent used by [`probe`]. Fails, handing the agent
/// back, if one is already installed.
pub fn install_global(agent: Arc<Agent>) -> Result<(), Arc<Agent>> {
    GLOBAL_AGENT.set(agent)
}

pub fn global_agent() -> Option<&'static Arc<Agent>> {
    GLOBAL_AGENT.get()
}

/// Free-function entry points for generated probe code. They do nothing
/// until an agent is installed and never unwind into the caller.
pub mod probe {
    use super::{Agent, GcPauseEvent, AssertUnwindSafe, GLOBAL_AGENT};

    #[inline]
    fn with_agent(f: impl FnOnce(&Agent)) {
        if let Some(agent) = GLOBAL_AGENT.get() {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| f(agent)));
        }
    }

    #[inline]
    pub fn on_method_start(subject: &str) {
        with_agent(|agent| agent.on_method_start(subject));
    }

    #[inline]
    pub fn on_method_end(subject: &str) {
        with_agent(|agent| agent.on_method_end(subject));
    }

    pub fn on_lock_acquire(lock_id: &str, thread_id: u64) {
        with_agent(|agent| agent.on_lock_acquire(lock_id, thread_id));
    }

    pub fn on_lock_release(lock_id: &str, thread_id: u64) {
        with_agent(|agent| agent.on_lock_release(lock_id, thread_id));
    }

    pub fn on_lock_wait(lock_id: &str, wait_ns: u64) {
        with_agent(|agent| agent.on_lock_wait(lock_id, wait_ns));
    }

    pub fn on_gc_pause(event: GcPauseEvent) {
        with_agent(|agent| agent.on_gc_pause(event));
    }
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;
    use crate::diagnostics_tests::FakeIntrospector;

    struct CountingSampler {
        ticks: AtomicU64,
        ready: bool,
    }

    impl DiagnosticSampler for CountingSampler {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn feature(&self) -> Feature {
            Feature::Cpu
        }

        fn period(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn check_ready(&self) -> CollectorResult<()> {
            if self.ready {
                Ok(())
            } else {
                Err(CollectorError::StartFailed {
                    name: "counting".into(),
                    message: "not ready".into(),
                })
            }
        }

        fn sample(&self) -> CollectorResult<()> {
            self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(())
        }

        fn clear(&self) {}
    }

    fn scheduler(grace: Duration) -> CollectionScheduler {
        CollectionScheduler::new(
            RuntimeHandle::current(),
            grace,
            Arc::new(ErrorStats::new()),
            Arc::new(AgentMetrics::new().unwrap()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sampler_start_is_idempotent() {
        let scheduler = scheduler(Duration::from_secs(1));
        let sampler = Arc::new(CountingSampler {
            ticks: AtomicU64::new(0),
            ready: true,
        });

        assert!(scheduler.start_sampler(sampler.clone()).unwrap());
        assert!(!scheduler.start_sampler(sampler.clone()).unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sampler.ticks.load(AtomicOrdering::Relaxed) > 0);

        assert!(scheduler.stop_collector(Feature::Cpu));
        assert!(!scheduler.stop_collector(Feature::Cpu));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = sampler.ticks.load(AtomicOrdering::Relaxed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sampler.ticks.load(AtomicOrdering::Relaxed), after_stop);

        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_start_is_skipped() {
        let scheduler = scheduler(Duration::from_secs(1));
        let broken: Arc<dyn DiagnosticSampler> = Arc::new(CountingSampler {
            ticks: AtomicU64::new(0),
            ready: false,
        });
        let fake = Arc::new(FakeIntrospector::default());
        let lock: Arc<dyn DiagnosticSampler> = Arc::new(LockSampler::new(fake, Duration::from_millis(10)));

        assert_eq!(scheduler.start_all(&[broken, lock]), 1);
        assert!(!scheduler.is_collector_running(Feature::Cpu));
        assert!(scheduler.is_collector_running(Feature::Lock));
        assert_eq!(scheduler.error_stats.count_by_category("collector"), 1);
        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_in_flight_then_refuses_new_work() {
        let scheduler = scheduler(Duration::from_millis(500));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        scheduler.spawn_periodic("slow", Duration::from_millis(10), scheduler.child_token(), move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, AtomicOrdering::Release);
            true
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;
        assert!(finished.load(AtomicOrdering::Acquire));
        assert!(!scheduler.is_running());

        let sampler = Arc::new(CountingSampler {
            ticks: AtomicU64::new(0),
            ready: true,
        });
        assert!(scheduler.start_sampler(sampler).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_job_returning_false_ends_task() {
        let scheduler = scheduler(Duration::from_secs(1));
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        scheduler.spawn_periodic("once", Duration::from_millis(10), scheduler.child_token(), move || {
            counter.fetch_add(1, AtomicOrdering::Relaxed);
            false
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);
        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_toggled_collectors_are_reaped() {
        let scheduler = scheduler(Duration::from_secs(1));
        let sampler = Arc::new(CountingSampler {
            ticks: AtomicU64::new(0),
            ready: true,
        });

        for _ in 0..5 {
            assert!(scheduler.start_sampler(sampler.clone()).unwrap());
            assert!(scheduler.stop_collector(Feature::Cpu));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert!(scheduler.start_sampler(sampler.clone()).unwrap());
        assert_eq!(scheduler.task_count(), 1);
        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_tick_does_not_stall_workers() {
        let scheduler = scheduler(Duration::from_secs(1));
        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        scheduler.spawn_periodic("slow-read", Duration::from_millis(10), scheduler.child_token(), move || {
            flag.store(true, AtomicOrdering::Release);
            std::thread::sleep(Duration::from_millis(300));
            false
        });

        while !entered.load(AtomicOrdering::Acquire) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let begin = std::time::Instant::now();
        tokio::spawn(async {}).await.unwrap();
        assert!(begin.elapsed() < Duration::from_millis(150));
        scheduler.stop().await;
    }
}


// ============================================================================
// SECTION 18: CLI & COMMAND LINE INTERFACE
// ============================================================================
// The standalone binary runs the agent against this process's own procfs
// view and logs each batch. Embedding hosts construct an `Agent` directly.
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Aletheia agent CLI
#[derive(Parser, Debug)]
#[command(
    name = "aletheia",
    author = "Aletheia Team",
    version,
    about = "Low-overhead sampling and anomaly alerting agent",
    long_about = "Aletheia samples method response times, aggregates them into \
                  fixed windows, tracks CPU, lock and method hotspots, and raises \
                  alerts on latency, GC, lock, deadlock and heap-growth anomalies."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "aletheia.toml", env = "ALETHEIA_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "ALETHEIA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "ALETHEIA_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent in the foreground until SIGINT/SIGTERM
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show agent version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 18.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> AgentResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match AgentConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\nSummary:");
            println!("  instance:        {}", config.agent.instance_name);
            println!("  push interval:   {}ms", config.agent.push_interval_ms);
            println!("  window size:     {}ms", config.sampling.window_size_ms);
            println!(
                "  sample rate:     {} (bounds {} - {})",
                config.sampling.initial_rate, config.sampling.min_rate, config.sampling.max_rate
            );
            let enabled: Vec<&str> = Feature::ALL
                .iter()
                .filter(|f| config.features.is_enabled(**f))
                .map(|f| f.as_str())
                .collect();
            println!("  features:        {}", enabled.join(", "));
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed");
            println!("Error: {}", e);
            Err(AgentError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> AgentResult<()> {
    let config_str = AgentConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", AGENT_FULL_NAME, AGENT_VERSION);
    println!();
    println!("Build Information:");
    println!("  Target: {}", std::env::consts::ARCH);
    println!("  OS:     {}", std::env::consts::OS);
    println!();
    println!("Features: {}", Feature::ALL.map(|f| f.as_str()).join(", "));
    println!("License: MIT");
}

/// Resolve when SIGINT or SIGTERM arrives
async fn wait_for_shutdown_signal() -> AgentResult<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut sigterm = unix_signal(SignalKind::terminate())?;
        let mut sigint = unix_signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!(target: "aletheia::main", "Received SIGTERM"),
            _ = sigint.recv() => info!(target: "aletheia::main", "Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!(target: "aletheia::main", "Received Ctrl-C");
    }

    Ok(())
}

/// Run the agent on the host introspector until a shutdown signal
async fn run_agent(config: AgentConfig) -> AnyhowResult<()> {
    let introspector: Arc<dyn RuntimeIntrospector> = Arc::new(ProcfsIntrospector::new());
    let exporter: Arc<dyn Exporter> = Arc::new(LogExporter);

    let agent = Agent::new(config, introspector, exporter, RuntimeHandle::current())
        .context("Failed to create agent")?;
    if install_global(Arc::clone(&agent)).is_err() {
        warn!(target: "aletheia::main", "A global agent was already installed");
    }
    agent.start().context("Failed to start agent")?;

    wait_for_shutdown_signal().await.context("Failed to wait for shutdown signal")?;

    agent.stop().await;
    let status = agent.status();
    info!(
        target: "aletheia::main",
        uptime_ms = status.uptime_ms,
        batches = status.batches_exported,
        alerts = status.alerts_raised,
        errors = status.errors,
        "Shutdown complete"
    );
    match agent.metrics_text() {
        Ok(text) => debug!(target: "aletheia::main", "Final metrics:\n{}", text),
        Err(e) => debug!(target: "aletheia::main", error = %e, "Metrics unavailable"),
    }
    Ok(())
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a runtime agent
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        AgentConfig::default()
    } else {
        AgentConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config)?;

    info!(target: "aletheia::main", "{} v{}", AGENT_FULL_NAME, AGENT_VERSION);
    if config_missing {
        warn!(target: "aletheia::main", path = %cli.config.display(), "Config file not found, using defaults");
    }

    run_agent(config).await
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.sampling.initial_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.sampling.window_size_ms, DEFAULT_WINDOW_SIZE_MS);
        assert_eq!(config.agent.push_interval_ms, DEFAULT_PUSH_INTERVAL_MS);
        assert_eq!(config.alerts.gc_pause_threshold_ms, GC_STW_ALERT_THRESHOLD_MS);
        assert_eq!(config.diagnostics.reservoir_capacity, METHOD_RESERVOIR_CAPACITY);
        assert!(Feature::ALL.iter().all(|f| config.features.is_enabled(*f)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = AgentConfig::generate_default_config();
        let parsed = AgentConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed, AgentConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AgentConfig::from_str(
            r#"
            [sampling]
            initial_rate = 0.05

            [features]
            method = false
            "#,
        )
        .unwrap();
        assert_eq!(config.sampling.initial_rate, 0.05);
        assert_eq!(config.sampling.max_rate, MAX_SAMPLE_RATE);
        assert!(!config.features.method);
        assert!(config.features.rt);
    }

    #[rstest]
    #[case("[sampling]\ninitial_rate = 1.5", "sampling.initial_rate")]
    #[case("[sampling]\nmin_rate = 0.5\nmax_rate = 0.1", "sampling.min_rate")]
    #[case("[diagnostics]\nreservoir_capacity = 0", "diagnostics.reservoir_capacity")]
    #[case("[controller]\nlow_threshold = 0.9", "controller.low_threshold")]
    #[case("[logging]\nformat = \"xml\"", "logging.format")]
    fn test_invalid_values_rejected(#[case] toml_str: &str, #[case] field: &str) {
        match AgentConfig::from_str(toml_str) {
            Err(ConfigError::InvalidValue { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected InvalidValue for {}, got {:?}", field, other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[agent]\ninstance_name = \"checkout\"\npush_interval_ms = 2000").unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.agent.instance_name, "checkout");
        assert_eq!(config.agent.push_interval_ms, 2000);
        assert_eq!(config.sampling, SamplingConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(AgentConfig::load(&missing), Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[sampling\ninitial_rate = ").unwrap();
        assert!(matches!(AgentConfig::load(file.path()), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_generate_config_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aletheia.toml");
        handle_generate_config(Some(&path)).unwrap();
        assert!(AgentConfig::load(&path).is_ok());
        assert!(handle_validate(&path, false).is_ok());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["aletheia", "--config", "/tmp/a.toml", "validate", "--verbose"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/a.toml"));
        assert!(matches!(cli.command, Some(Commands::Validate { verbose: true })));

        let cli = Cli::parse_from(["aletheia", "generate-config", "-o", "out.toml"]);
        match cli.command {
            Some(Commands::GenerateConfig { output }) => assert_eq!(output, Some(PathBuf::from("out.toml"))),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
