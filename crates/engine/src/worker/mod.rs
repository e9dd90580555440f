//! Queue and worker pool
//!
//! This module provides:
//! - [`BoundedQueue`] - Fixed-capacity FIFO between submitters and workers
//! - `WorkerPool` - Fixed set of workers that execute queued tasks
//!
//! # Architecture
//!
//! ```text
//!   submit ──push──▶ ┌──────────────────────────┐
//!   submit ──push──▶ │  BoundedQueue (capacity) │
//!   submit ──push──▶ └────────────┬─────────────┘
//!                                 │ pop
//!              ┌──────────────────┼──────────────────┐
//!              ▼                  ▼                  ▼
//!         [worker 0]         [worker 1]   ...   [worker N-1]
//!              │   catch_unwind · deadline · abort   │
//!              └──────────────▶ result channel ◀─────┘
//! ```

mod pool;
mod queue;

pub(crate) use pool::{Job, WorkerPool};
pub use queue::{BoundedQueue, QueueError};
