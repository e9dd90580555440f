//! Engine supervisor
//!
//! Ties the admission gates, the queue and the worker pool together. A
//! submission passes three gates in order: the token bucket, the circuit
//! breaker and the bounded queue. Anything that passes all three is owed
//! exactly one [`TaskResult`](crate::TaskResult).

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{EngineConfig, ShutdownMode};
use crate::context::Context;
use crate::error::EngineError;
use crate::events::{emit_guarded, EngineEvent, EventSink, NoopEventSink};
use crate::reliability::{CircuitBreaker, CircuitState, TokenBucket};
use crate::stats::{Counters, EngineStats, EngineStatus};
use crate::task::{result_channel, Task, TaskHandle, TaskId};
use crate::worker::{BoundedQueue, Job, QueueError, WorkerPool};

const DEFAULT_NAME: &str = "taskgate";

struct EngineInner {
    name: String,
    config: EngineConfig,
    bucket: TokenBucket,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<BoundedQueue<Job>>,
    pool: WorkerPool,
    sink: Arc<dyn EventSink>,
    counters: Arc<Counters>,
    status: RwLock<EngineStatus>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Workers finish what is queued, then exit
        self.queue.close();
    }
}

/// Builder for an [`Engine`] with optional collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    name: String,
    sink: Arc<dyn EventSink>,
}

impl EngineBuilder {
    /// Engine name used in logs and as the circuit breaker name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Receive lifecycle events
    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Receive lifecycle events through a shared sink
    pub fn with_shared_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the configuration and start the workers
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn build(self) -> Result<Engine, EngineError> {
        let Self { config, name, sink } = self;
        config.validate()?;

        let bucket = TokenBucket::new(config.rate_limit, config.rate_burst)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        let hook_sink = Arc::clone(&sink);
        let breaker = Arc::new(
            CircuitBreaker::new(name.clone(), config.circuit_breaker()).with_transition_hook(
                move |from, to| {
                    emit_guarded(hook_sink.as_ref(), &EngineEvent::CircuitTransition { from, to })
                },
            ),
        );

        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let counters = Arc::new(Counters::default());
        let pool = WorkerPool::start(
            config.workers,
            Arc::clone(&queue),
            Arc::clone(&sink),
            Arc::clone(&counters),
        );

        info!(
            engine = %name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            rate_limit = config.rate_limit,
            rate_burst = config.rate_burst,
            failure_threshold = config.failure_threshold,
            "Engine started"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                name,
                config,
                bucket,
                breaker,
                queue,
                pool,
                sink,
                counters,
                status: RwLock::new(EngineStatus::Running),
            }),
        })
    }
}

/// Bounded concurrent task execution engine
///
/// Cheap to clone; every clone drives the same workers. Dropping the last
/// clone closes the queue and lets the workers drain.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use taskgate_engine::{Context, Engine, EngineConfig, Task};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = Engine::new(EngineConfig::default().with_workers(2))?;
/// let ctx = Context::background();
///
/// let handle = engine
///     .submit(&ctx, Task::new(|_ctx| async { Ok(json!("pong")) }))
///     .await?;
/// assert_eq!(handle.await.into_result()?, json!("pong"));
///
/// engine.shutdown(&ctx).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start an engine with the given configuration
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder(config).build()
    }

    /// Start building an engine
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            name: DEFAULT_NAME.to_string(),
            sink: Arc::new(NoopEventSink),
        }
    }

    /// Engine name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Effective configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Whether new submissions are accepted
    pub fn is_accepting(&self) -> bool {
        *self.inner.status.read() == EngineStatus::Running
    }

    /// Current circuit breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit(&self) {
        self.inner.breaker.reset();
    }

    /// Submit a task, waiting for a rate-limit token and a queue slot
    ///
    /// `ctx` bounds the time spent waiting for admission only. Once this
    /// returns `Ok`, the task will run (or be answered with a shutdown
    /// result) regardless of `ctx`; drop the handle to discard the result.
    #[instrument(skip(self, ctx, task), fields(engine = %self.inner.name, task_id = %task.id()))]
    pub async fn submit(&self, ctx: &Context, task: Task) -> Result<TaskHandle, EngineError> {
        let task_id = task.id().clone();
        let admitted = self.admit(ctx, task).await;
        self.record_admission(&task_id, admitted)
    }

    /// Submit a task only if every gate admits it right now
    ///
    /// Fails with [`EngineError::Throttled`] or [`EngineError::QueueFull`]
    /// instead of waiting. A token taken before a later gate rejects is not
    /// returned.
    pub fn try_submit(&self, task: Task) -> Result<TaskHandle, EngineError> {
        let task_id = task.id().clone();
        let admitted = self.try_admit(task);
        self.record_admission(&task_id, admitted)
    }

    /// Stop accepting tasks and wait for the workers to exit
    ///
    /// In [`ShutdownMode::Graceful`] every queued and in-flight task runs to
    /// completion. In [`ShutdownMode::Immediate`] they are answered with
    /// `PoolShutdown`. Returns [`EngineError::ShutdownTimeout`] if `ctx`
    /// ends first; workers keep draining and [`shutdown_now`](Self::shutdown_now)
    /// can escalate. Safe to call more than once.
    #[instrument(skip(self, ctx), fields(engine = %self.inner.name))]
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), EngineError> {
        self.begin_shutdown(self.inner.config.shutdown_mode);

        tokio::select! {
            biased;
            _ = self.inner.pool.wait() => {
                self.complete_shutdown();
                Ok(())
            }
            err = ctx.done() => {
                warn!(
                    reason = %err,
                    queued = self.inner.queue.len(),
                    busy = self.inner.pool.busy(),
                    "Shutdown timed out with work remaining"
                );
                Err(EngineError::ShutdownTimeout)
            }
        }
    }

    /// Abandon all work and wait for the workers to exit
    ///
    /// Queued and in-flight tasks are answered with `PoolShutdown`.
    #[instrument(skip(self), fields(engine = %self.inner.name))]
    pub async fn shutdown_now(&self) {
        self.begin_shutdown(ShutdownMode::Immediate);
        self.inner.pool.wait().await;
        self.complete_shutdown();
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let status = match *inner.status.read() {
            EngineStatus::Draining if inner.pool.is_stopped() => EngineStatus::Stopped,
            status => status,
        };

        EngineStats {
            status,
            queue_depth: inner.queue.len(),
            queue_capacity: inner.queue.capacity(),
            circuit_state: inner.breaker.state(),
            tokens_available: inner.bucket.available(),
            workers: inner.pool.workers(),
            workers_busy: inner.pool.busy(),
            submitted: Counters::get(&inner.counters.submitted),
            rejected: Counters::get(&inner.counters.rejected),
            succeeded: Counters::get(&inner.counters.succeeded),
            failed: Counters::get(&inner.counters.failed),
        }
    }

    async fn admit(&self, ctx: &Context, task: Task) -> Result<TaskHandle, EngineError> {
        let inner = &self.inner;
        if !self.is_accepting() {
            return Err(EngineError::Shutdown);
        }

        inner.bucket.wait(ctx).await?;
        let permit = inner
            .breaker
            .acquire()
            .map_err(|_| EngineError::CircuitOpen)?;

        let (responder, handle) = result_channel(task.id().clone());
        inner
            .queue
            .push(ctx, Job::new(task, responder, permit))
            .await
            .map_err(queue_rejection)?;

        Ok(handle)
    }

    fn try_admit(&self, task: Task) -> Result<TaskHandle, EngineError> {
        let inner = &self.inner;
        if !self.is_accepting() {
            return Err(EngineError::Shutdown);
        }

        if !inner.bucket.allow() {
            return Err(EngineError::Throttled);
        }
        let permit = inner
            .breaker
            .acquire()
            .map_err(|_| EngineError::CircuitOpen)?;

        let (responder, handle) = result_channel(task.id().clone());
        inner
            .queue
            .try_push(Job::new(task, responder, permit))
            .map_err(queue_rejection)?;

        Ok(handle)
    }

    fn record_admission(
        &self,
        task_id: &TaskId,
        admitted: Result<TaskHandle, EngineError>,
    ) -> Result<TaskHandle, EngineError> {
        let inner = &self.inner;
        match &admitted {
            Ok(_) => {
                Counters::incr(&inner.counters.submitted);
                emit_guarded(
                    inner.sink.as_ref(),
                    &EngineEvent::TaskAdmitted {
                        task_id: task_id.clone(),
                    },
                );
                debug!(%task_id, "Task admitted");
            }
            Err(err) => {
                Counters::incr(&inner.counters.rejected);
                emit_guarded(
                    inner.sink.as_ref(),
                    &EngineEvent::TaskRejected {
                        task_id: task_id.clone(),
                        reason: err.kind().to_string(),
                    },
                );
                warn!(%task_id, reason = err.kind(), "Task rejected");
            }
        }
        admitted
    }

    fn begin_shutdown(&self, mode: ShutdownMode) {
        let inner = &self.inner;
        let first = {
            let mut status = inner.status.write();
            if *status == EngineStatus::Running {
                *status = EngineStatus::Draining;
                true
            } else {
                false
            }
        };

        if first {
            info!(
                engine = %inner.name,
                %mode,
                queued = inner.queue.len(),
                "Shutdown started"
            );
            emit_guarded(inner.sink.as_ref(), &EngineEvent::ShutdownStarted { mode });
        }

        match mode {
            ShutdownMode::Graceful => inner.pool.drain(),
            ShutdownMode::Immediate => inner.pool.abort(),
        }
    }

    fn complete_shutdown(&self) {
        let inner = &self.inner;
        {
            let mut status = inner.status.write();
            if *status == EngineStatus::Stopped {
                return;
            }
            *status = EngineStatus::Stopped;
        }

        info!(
            engine = %inner.name,
            succeeded = Counters::get(&inner.counters.succeeded),
            failed = Counters::get(&inner.counters.failed),
            "Shutdown completed"
        );
        emit_guarded(inner.sink.as_ref(), &EngineEvent::ShutdownCompleted);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.name)
            .field("status", &*self.inner.status.read())
            .field("queue", &self.inner.queue)
            .field("breaker", &self.inner.breaker)
            .finish_non_exhaustive()
    }
}

fn queue_rejection(err: QueueError<Job>) -> EngineError {
    // The job, its responder and its permit are dropped here
    match err {
        QueueError::Full(_) => EngineError::QueueFull,
        QueueError::Closed(_) => EngineError::Shutdown,
        QueueError::Cancelled(_, err) => EngineError::Context(err),
    }
}
