//! # Taskgate Engine
//!
//! A bounded concurrent task execution engine for protecting a downstream
//! dependency from overload.
//!
//! ## Features
//!
//! - **Rate limiting**: Token bucket smooths bursts to a steady admission rate
//! - **Circuit breaking**: Sheds load while the downstream is failing, probes with a single trial call
//! - **Backpressure**: Bounded queue blocks submitters instead of growing without limit
//! - **Bounded concurrency**: Fixed worker pool caps in-flight task bodies
//! - **Graceful shutdown**: Drain admitted work, or abandon it with a deterministic result
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │  (submit, try_submit, shutdown, stats)                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          TokenBucket  ──▶  CircuitBreaker                    │
//! │  (admission gates: throttle, then shed when unhealthy)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                BoundedQueue  ──▶  WorkerPool                 │
//! │  (backpressure, N workers, panic isolation, deadlines)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use taskgate_engine::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = EngineConfig::default()
//!     .with_workers(8)
//!     .with_queue_capacity(128)
//!     .with_rate_limit(50.0, 10.0);
//! let engine = Engine::new(config)?;
//!
//! let ctx = Context::with_timeout(Duration::from_secs(1));
//! let handle = engine
//!     .submit(&ctx, Task::new(|_ctx| async move { Ok(json!({"ok": true})) }))
//!     .await?;
//!
//! let result = handle.await;
//! assert!(result.is_success());
//!
//! engine.shutdown(&Context::with_timeout(Duration::from_secs(5))).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod reliability;
pub mod stats;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{EngineConfig, ShutdownMode};
    pub use crate::context::{Context, ContextError};
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{EngineError, TaskError};
    pub use crate::events::{EngineEvent, EventSink};
    pub use crate::stats::{EngineStats, EngineStatus};
    pub use crate::task::{Task, TaskHandle, TaskId, TaskResult};
}

// Re-export key types at crate root
pub use config::{EngineConfig, ShutdownMode};
pub use context::{Context, ContextError};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, TaskError};
pub use events::{EngineEvent, EventSink, NoopEventSink};
pub use reliability::{CircuitBreakerConfig, CircuitState};
pub use stats::{EngineStats, EngineStatus};
pub use task::{Task, TaskBody, TaskHandle, TaskId, TaskOutput, TaskResult};
