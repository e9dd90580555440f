//! Engine statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::reliability::CircuitState;

/// Engine lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Accepting and executing tasks
    Running,
    /// Shutdown began; finishing admitted work, accepting nothing new
    Draining,
    /// All workers exited
    Stopped,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time snapshot for metrics and logging collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub status: EngineStatus,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub circuit_state: CircuitState,
    pub tokens_available: f64,
    pub workers: usize,
    pub workers_busy: usize,

    /// Tasks admitted into the queue
    pub submitted: u64,
    /// Submissions that failed before entering the queue
    pub rejected: u64,
    /// Tasks whose body returned `Ok`
    pub succeeded: u64,
    /// Tasks that produced any `TaskError`
    pub failed: u64,
}

/// Cumulative counters shared by the supervisor and the workers
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
