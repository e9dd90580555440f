//! Engine error types
//!
//! Gating failures ([`EngineError`]) are returned synchronously from
//! `submit`; execution failures ([`TaskError`]) only ever travel through a
//! task's result channel.

use std::time::Duration;

use crate::context::ContextError;
use crate::task::TaskId;

/// Errors returned by engine construction, submission and shutdown
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration failed validation
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Circuit breaker rejected the task (downstream unhealthy)
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// No rate-limit token was available (non-blocking submission only)
    #[error("rate limit exceeded")]
    Throttled,

    /// Queue had no free slot (non-blocking submission only)
    #[error("task queue is full")]
    QueueFull,

    /// Submission attempted after shutdown began
    #[error("engine is shutting down")]
    Shutdown,

    /// The submission context ended while waiting for admission
    #[error("submission aborted: {0}")]
    Context(#[from] ContextError),

    /// Graceful shutdown did not finish before the shutdown context ended
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

impl EngineError {
    /// Whether the task was turned away by an admission gate
    ///
    /// A rejected task never entered the engine and will not produce a result.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen | Self::Throttled | Self::QueueFull | Self::Shutdown
        )
    }

    /// Short machine-readable name, used in events and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::CircuitOpen => "circuit_open",
            Self::Throttled => "throttled",
            Self::QueueFull => "queue_full",
            Self::Shutdown => "shutdown",
            Self::Context(ContextError::Cancelled) => "cancelled",
            Self::Context(ContextError::DeadlineExceeded) => "deadline_exceeded",
            Self::ShutdownTimeout => "shutdown_timeout",
        }
    }
}

/// Failure of an admitted task, delivered through its result channel
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task body returned an error
    #[error("task {task_id} failed after {elapsed:?}: {source}")]
    Failed {
        task_id: TaskId,
        elapsed: Duration,
        #[source]
        source: anyhow::Error,
    },

    /// The task body panicked; the worker recovered
    #[error("task {task_id} panicked after {elapsed:?}: {message}")]
    Panicked {
        task_id: TaskId,
        elapsed: Duration,
        message: String,
    },

    /// The task deadline elapsed before or during execution
    #[error("task {task_id} exceeded its deadline after {elapsed:?}")]
    DeadlineExceeded { task_id: TaskId, elapsed: Duration },

    /// The worker pool shut down before the task could finish
    #[error("task {task_id} abandoned: worker pool shut down")]
    PoolShutdown { task_id: TaskId },
}

impl TaskError {
    /// The id of the task that failed
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Failed { task_id, .. }
            | Self::Panicked { task_id, .. }
            | Self::DeadlineExceeded { task_id, .. }
            | Self::PoolShutdown { task_id } => task_id,
        }
    }

    /// Short machine-readable name, used in events and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "failed",
            Self::Panicked { .. } => "panicked",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::PoolShutdown { .. } => "pool_shutdown",
        }
    }
}
