//! Engine configuration
//!
//! Configuration is plain data: construct it with [`EngineConfig::default`]
//! and the `with_*` builders, deserialize it, or load it from environment
//! variables. [`EngineConfig::validate`] runs inside `Engine::new`.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::reliability::CircuitBreakerConfig;

/// What `Engine::shutdown` does with queued work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Finish in-flight tasks and drain the queue
    #[default]
    Graceful,

    /// Abandon in-flight and queued tasks; each gets a `PoolShutdown` result
    Immediate,
}

impl std::fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::Immediate => write!(f, "immediate"),
        }
    }
}

impl std::str::FromStr for ShutdownMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "graceful" => Ok(Self::Graceful),
            "immediate" => Ok(Self::Immediate),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown shutdown mode: {other}"
            ))),
        }
    }
}

/// Engine configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskgate_engine::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_workers(8)
///     .with_queue_capacity(256)
///     .with_rate_limit(100.0, 20.0)
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(10));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Number of worker tasks (fixed for the engine's lifetime)
    pub workers: usize,

    /// Maximum number of admitted tasks waiting for a worker
    pub queue_capacity: usize,

    /// Sustained admission rate in tasks per second
    pub rate_limit: f64,

    /// Token bucket capacity (largest instantaneous burst)
    pub rate_burst: f64,

    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before allowing a trial task
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Sliding window for failure counting
    #[serde(with = "duration_millis", default = "default_failure_window")]
    pub failure_window: Duration,

    /// Behavior of `Engine::shutdown`
    #[serde(default)]
    pub shutdown_mode: ShutdownMode,
}

fn default_failure_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            rate_limit: 100.0,
            rate_burst: 100.0,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            failure_window: default_failure_window(),
            shutdown_mode: ShutdownMode::Graceful,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables (unset or unparseable values keep the default):
    /// - `TASKGATE_WORKERS`
    /// - `TASKGATE_QUEUE_CAPACITY`
    /// - `TASKGATE_RATE_LIMIT`: tasks per second
    /// - `TASKGATE_RATE_BURST`
    /// - `TASKGATE_FAILURE_THRESHOLD`
    /// - `TASKGATE_RESET_TIMEOUT_MS`
    /// - `TASKGATE_FAILURE_WINDOW_MS`
    /// - `TASKGATE_SHUTDOWN_MODE`: `graceful` or `immediate`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            workers: parse_var(&lookup, "TASKGATE_WORKERS").unwrap_or(defaults.workers),
            queue_capacity: parse_var(&lookup, "TASKGATE_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            rate_limit: parse_var(&lookup, "TASKGATE_RATE_LIMIT").unwrap_or(defaults.rate_limit),
            rate_burst: parse_var(&lookup, "TASKGATE_RATE_BURST").unwrap_or(defaults.rate_burst),
            failure_threshold: parse_var(&lookup, "TASKGATE_FAILURE_THRESHOLD")
                .unwrap_or(defaults.failure_threshold),
            reset_timeout: parse_var(&lookup, "TASKGATE_RESET_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reset_timeout),
            failure_window: parse_var(&lookup, "TASKGATE_FAILURE_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.failure_window),
            shutdown_mode: parse_var(&lookup, "TASKGATE_SHUTDOWN_MODE")
                .unwrap_or(defaults.shutdown_mode),
        }
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the admission rate (tokens per second) and burst size
    pub fn with_rate_limit(mut self, rate: f64, burst: f64) -> Self {
        self.rate_limit = rate;
        self.rate_burst = burst;
        self
    }

    /// Set the failure threshold that opens the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the sliding window for failure counting
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// Set the shutdown mode
    pub fn with_shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.shutdown_mode = mode;
        self
    }

    /// Validate the configuration
    ///
    /// Every count must be positive and every rate positive and finite.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(invalid("workers must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than zero"));
        }
        if !self.rate_limit.is_finite() || self.rate_limit <= 0.0 {
            return Err(invalid("rate_limit must be a positive number"));
        }
        if !self.rate_burst.is_finite() || self.rate_burst < 1.0 {
            return Err(invalid("rate_burst must be at least 1"));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold must be greater than zero"));
        }
        if self.reset_timeout.is_zero() {
            return Err(invalid("reset_timeout must be greater than zero"));
        }
        if self.failure_window.is_zero() {
            return Err(invalid("failure_window must be greater than zero"));
        }
        Ok(())
    }

    /// Circuit breaker settings derived from this configuration
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(self.reset_timeout)
            .with_window_size(self.failure_window)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|value| value.trim().parse().ok())
}

fn invalid(message: &str) -> EngineError {
    EngineError::InvalidConfig(message.to_string())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
