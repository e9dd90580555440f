//! Engine events
//!
//! The engine does not ship a metrics backend. It reports lifecycle events
//! to an [`EventSink`]; metrics and logging collaborators implement the
//! trait and forward events wherever they need them.

use std::panic::AssertUnwindSafe;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ShutdownMode;
use crate::reliability::CircuitState;
use crate::task::TaskId;

/// Lifecycle event emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Task passed every admission gate and entered the queue
    TaskAdmitted { task_id: TaskId },

    /// Task was turned away before entering the queue
    TaskRejected {
        task_id: TaskId,
        /// Error kind, e.g. `circuit_open` or `shutdown`
        reason: String,
    },

    /// A worker started executing the task body
    TaskStarted { task_id: TaskId, worker: usize },

    /// A result was delivered for the task
    TaskFinished {
        task_id: TaskId,
        /// `succeeded` or a task error kind
        outcome: String,
        elapsed_ms: u64,
    },

    /// The circuit breaker changed state
    CircuitTransition { from: CircuitState, to: CircuitState },

    /// Shutdown began; no further tasks are admitted
    ShutdownStarted { mode: ShutdownMode },

    /// All workers exited
    ShutdownCompleted,
}

/// Receiver of engine events
///
/// Called inline on submitter and worker tasks; implementations must not
/// block. A panic inside `emit` is caught and logged, and the event is lost.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Sink that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &EngineEvent) {}
}

impl<F> EventSink for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn emit(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Deliver one event, containing a panicking sink
pub(crate) fn emit_guarded(sink: &dyn EventSink, event: &EngineEvent) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| sink.emit(event))).is_err() {
        warn!(?event, "Event sink panicked; event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::CircuitTransition {
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "circuit_transition");
        assert_eq!(json["from"], "closed");
        assert_eq!(json["to"], "open");
    }

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |event: &EngineEvent| seen.lock().push(event.clone())
        };

        sink.emit(&EngineEvent::ShutdownCompleted);
        NoopEventSink.emit(&EngineEvent::ShutdownCompleted);

        assert_eq!(seen.lock().as_slice(), &[EngineEvent::ShutdownCompleted]);
    }

    #[test]
    fn test_guarded_emit_contains_panics() {
        let calls = Arc::new(Mutex::new(0));
        let sink = {
            let calls = Arc::clone(&calls);
            move |_: &EngineEvent| {
                *calls.lock() += 1;
                panic!("sink exploded");
            }
        };

        emit_guarded(&sink, &EngineEvent::ShutdownCompleted);
        emit_guarded(&sink, &EngineEvent::ShutdownCompleted);
        assert_eq!(*calls.lock(), 2);
    }
}
