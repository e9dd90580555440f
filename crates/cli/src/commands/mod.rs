// CLI commands

pub mod config;
pub mod run;

use std::time::Duration;

use clap::Args;
use taskgate_engine::{EngineConfig, ShutdownMode};

/// Engine settings; unset flags fall back to TASKGATE_* variables, then defaults
#[derive(Args, Debug, Default, Clone)]
pub struct EngineArgs {
    /// Number of workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Maximum queued tasks
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Admission rate in tasks per second
    #[arg(long)]
    pub rate_limit: Option<f64>,

    /// Token bucket capacity
    #[arg(long)]
    pub rate_burst: Option<f64>,

    /// Failures within the window that open the circuit
    #[arg(long)]
    pub failure_threshold: Option<u32>,

    /// Milliseconds the circuit stays open before a trial call
    #[arg(long)]
    pub reset_timeout_ms: Option<u64>,

    /// Sliding failure window in milliseconds
    #[arg(long)]
    pub failure_window_ms: Option<u64>,

    /// What shutdown does with admitted work (graceful, immediate)
    #[arg(long)]
    pub shutdown_mode: Option<ShutdownMode>,
}

impl EngineArgs {
    /// Layer flags over the environment
    pub fn resolve(&self) -> EngineConfig {
        self.apply(EngineConfig::from_env())
    }

    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(capacity) = self.queue_capacity {
            config = config.with_queue_capacity(capacity);
        }
        if self.rate_limit.is_some() || self.rate_burst.is_some() {
            let rate = self.rate_limit.unwrap_or(config.rate_limit);
            let burst = self.rate_burst.unwrap_or(config.rate_burst);
            config = config.with_rate_limit(rate, burst);
        }
        if let Some(threshold) = self.failure_threshold {
            config = config.with_failure_threshold(threshold);
        }
        if let Some(ms) = self.reset_timeout_ms {
            config = config.with_reset_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.failure_window_ms {
            config = config.with_failure_window(Duration::from_millis(ms));
        }
        if let Some(mode) = self.shutdown_mode {
            config = config.with_shutdown_mode(mode);
        }
        config
    }
}
