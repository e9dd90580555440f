//! Worker pool for task execution
//!
//! A fixed set of workers drains the shared queue. Each worker runs one task
//! at a time, so at most `workers` task bodies execute concurrently.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::queue::BoundedQueue;
use crate::context::Context;
use crate::error::TaskError;
use crate::events::{emit_guarded, EngineEvent, EventSink};
use crate::reliability::CircuitPermit;
use crate::stats::Counters;
use crate::task::{Responder, Task, TaskOutput, TaskResult};

/// An admitted task waiting for a worker
pub(crate) struct Job {
    task: Task,
    responder: Responder,
    permit: CircuitPermit,
}

impl Job {
    pub(crate) fn new(task: Task, responder: Responder, permit: CircuitPermit) -> Self {
        Self {
            task,
            responder,
            permit,
        }
    }
}

/// Shared state handed to every worker
struct WorkerShared {
    queue: Arc<BoundedQueue<Job>>,
    abort: CancellationToken,
    busy: AtomicUsize,
    sink: Arc<dyn EventSink>,
    counters: Arc<Counters>,
}

/// How a task body run ended
enum Execution {
    Finished(std::thread::Result<TaskOutput>),
    DeadlineExceeded,
    Aborted,
}

/// Fixed-size pool of workers draining a [`BoundedQueue`]
pub(crate) struct WorkerPool {
    workers: usize,
    shared: Arc<WorkerShared>,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Spawn `workers` workers on the current Tokio runtime
    pub(crate) fn start(
        workers: usize,
        queue: Arc<BoundedQueue<Job>>,
        sink: Arc<dyn EventSink>,
        counters: Arc<Counters>,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            queue,
            abort: CancellationToken::new(),
            busy: AtomicUsize::new(0),
            sink,
            counters,
        });

        let tracker = TaskTracker::new();
        for worker in 0..workers {
            tracker.spawn(run_worker(worker, Arc::clone(&shared)));
        }
        // No workers are ever added; close so `wait` resolves once they exit
        tracker.close();

        info!(workers, "Worker pool started");

        Self {
            workers,
            shared,
            tracker,
        }
    }

    /// Number of workers
    pub(crate) fn workers(&self) -> usize {
        self.workers
    }

    /// Workers currently executing a task
    pub(crate) fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Relaxed)
    }

    /// Stop intake; workers finish the queued tasks, then exit
    pub(crate) fn drain(&self) {
        self.shared.queue.close();
    }

    /// Stop intake and abandon all work
    ///
    /// In-flight bodies are dropped at their next await point; they and
    /// every queued task get a `PoolShutdown` result.
    pub(crate) fn abort(&self) {
        self.shared.queue.close();
        self.shared.abort.cancel();

        let abandoned = self.shared.queue.drain();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Abandoning queued tasks");
        }
        for job in abandoned {
            let task_id = job.responder.task_id().clone();
            // The permit is dropped unreported
            finish(&self.shared, job.responder, TaskResult::shutdown(task_id));
        }
    }

    /// Wait until every worker has exited
    pub(crate) async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Whether every worker has exited
    pub(crate) fn is_stopped(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }
}

async fn run_worker(worker: usize, shared: Arc<WorkerShared>) {
    debug!(worker, "Worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = shared.abort.cancelled() => break,
            job = shared.queue.pop() => match job {
                Some(job) => job,
                None => break,
            },
        };

        shared.busy.fetch_add(1, Ordering::Relaxed);
        execute(worker, &shared, job).await;
        shared.busy.fetch_sub(1, Ordering::Relaxed);
    }

    debug!(worker, "Worker exited");
}

async fn execute(worker: usize, shared: &WorkerShared, job: Job) {
    let Job {
        task,
        responder,
        permit,
    } = job;
    let (task_id, body, deadline) = task.into_parts();

    let started_at = Utc::now();
    let start = Instant::now();

    // Expired while queued: never run, and say nothing about downstream health
    if deadline.is_some_and(|deadline| start >= deadline) {
        debug!(%task_id, "Task deadline passed before execution");
        let result = TaskResult {
            outcome: Err(TaskError::DeadlineExceeded {
                task_id: task_id.clone(),
                elapsed: std::time::Duration::ZERO,
            }),
            task_id,
            started_at,
            finished_at: started_at,
            elapsed: std::time::Duration::ZERO,
        };
        drop(permit);
        finish(shared, responder, result);
        return;
    }

    emit_guarded(
        shared.sink.as_ref(),
        &EngineEvent::TaskStarted {
            task_id: task_id.clone(),
            worker,
        },
    );
    debug!(worker, %task_id, "Executing task");

    let base = Context::from_token(shared.abort.child_token());
    let ctx = match deadline {
        Some(deadline) => base.child_with_deadline(deadline),
        None => base,
    };

    let run = AssertUnwindSafe(async move { body(ctx).await }).catch_unwind();
    let expiry = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    let execution = tokio::select! {
        biased;
        output = run => Execution::Finished(output),
        _ = shared.abort.cancelled() => Execution::Aborted,
        _ = expiry => Execution::DeadlineExceeded,
    };

    let elapsed = start.elapsed();
    let outcome = match execution {
        Execution::Finished(Ok(Ok(value))) => {
            permit.success();
            Ok(value)
        }
        Execution::Finished(Ok(Err(source))) => {
            permit.failure();
            Err(TaskError::Failed {
                task_id: task_id.clone(),
                elapsed,
                source,
            })
        }
        Execution::Finished(Err(payload)) => {
            permit.failure();
            let message = panic_message(payload.as_ref());
            warn!(worker, %task_id, %message, "Task panicked; worker recovered");
            Err(TaskError::Panicked {
                task_id: task_id.clone(),
                elapsed,
                message,
            })
        }
        Execution::DeadlineExceeded => {
            permit.failure();
            Err(TaskError::DeadlineExceeded {
                task_id: task_id.clone(),
                elapsed,
            })
        }
        Execution::Aborted => {
            drop(permit);
            Err(TaskError::PoolShutdown {
                task_id: task_id.clone(),
            })
        }
    };

    let result = TaskResult {
        task_id,
        outcome,
        started_at,
        finished_at: Utc::now(),
        elapsed,
    };
    finish(shared, responder, result);
}

/// Count, report and deliver a result
fn finish(shared: &WorkerShared, responder: Responder, result: TaskResult) {
    let outcome = match &result.outcome {
        Ok(_) => {
            Counters::incr(&shared.counters.succeeded);
            "succeeded"
        }
        Err(err) => {
            Counters::incr(&shared.counters.failed);
            debug!(task_id = %result.task_id, error = %err, "Task failed");
            err.kind()
        }
    };

    emit_guarded(
        shared.sink.as_ref(),
        &EngineEvent::TaskFinished {
            task_id: result.task_id.clone(),
            outcome: outcome.to_string(),
            elapsed_ms: result.elapsed.as_millis() as u64,
        },
    );

    responder.send(result);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
