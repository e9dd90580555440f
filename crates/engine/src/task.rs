//! Tasks, results and result handles
//!
//! A [`Task`] is an opaque one-shot async body plus an id and an optional
//! deadline. Every admitted task owns exactly one result channel: the
//! engine keeps the sending half (a [`Responder`]) next to the queued task
//! and the caller keeps the receiving half (a [`TaskHandle`]).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as PollContext, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::context::{Context, ContextError};
use crate::error::TaskError;

/// Task identifier, caller-assigned or generated
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Output of a task body
pub type TaskOutput = anyhow::Result<serde_json::Value>;

/// Boxed task body; invoked at most once with the execution context
pub type TaskBody = Box<dyn FnOnce(Context) -> BoxFuture<'static, TaskOutput> + Send>;

/// A unit of work submitted to the engine
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use serde_json::json;
/// use taskgate_engine::Task;
///
/// let task = Task::new(|_ctx| async move { Ok(json!({"rows": 42})) })
///     .with_id("import-42")
///     .with_timeout(Duration::from_secs(5));
///
/// assert_eq!(task.id().as_str(), "import-42");
/// assert!(task.deadline().is_some());
/// ```
pub struct Task {
    id: TaskId,
    body: TaskBody,
    submitted_at: DateTime<Utc>,
    deadline: Option<Instant>,
}

impl Task {
    /// Create a task with a generated id and no deadline
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Self {
            id: TaskId::generate(),
            body: Box::new(move |ctx| body(ctx).boxed()),
            submitted_at: Utc::now(),
            deadline: None,
        }
    }

    /// Set a caller-assigned id
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The task id
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// When the task was created
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// The task deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn into_parts(self) -> (TaskId, TaskBody, Option<Instant>) {
        (self.id, self.body, self.deadline)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("submitted_at", &self.submitted_at)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Outcome of one task execution
#[derive(Debug)]
pub struct TaskResult {
    /// Id of the task this result belongs to
    pub task_id: TaskId,

    /// Body output or the reason the task failed
    pub outcome: Result<serde_json::Value, TaskError>,

    /// When execution started (equal to `finished_at` if it never started)
    pub started_at: DateTime<Utc>,

    /// When the result was produced
    pub finished_at: DateTime<Utc>,

    /// Wall time spent executing the body
    pub elapsed: Duration,
}

impl TaskResult {
    /// Whether the task succeeded
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The failure, if any
    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }

    /// Consume the result, yielding the body output or the failure
    pub fn into_result(self) -> Result<serde_json::Value, TaskError> {
        self.outcome
    }

    pub(crate) fn shutdown(task_id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            outcome: Err(TaskError::PoolShutdown {
                task_id: task_id.clone(),
            }),
            task_id,
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
        }
    }
}

/// Sending half of a task's result channel
///
/// Delivers at most one result. Dropping a responder that never sent
/// delivers a `PoolShutdown` result instead, so every admitted task
/// produces exactly one result on every path.
pub(crate) struct Responder {
    task_id: TaskId,
    tx: Option<oneshot::Sender<TaskResult>>,
}

impl Responder {
    pub(crate) fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Deliver the result; a receiver that went away is not an error
    pub(crate) fn send(mut self, result: TaskResult) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TaskResult::shutdown(self.task_id.clone()));
        }
    }
}

/// Create the result channel for a task
pub(crate) fn result_channel(task_id: TaskId) -> (Responder, TaskHandle) {
    let (tx, rx) = oneshot::channel();
    (
        Responder {
            task_id: task_id.clone(),
            tx: Some(tx),
        },
        TaskHandle { task_id, rx },
    )
}

/// Receiving half of a task's result channel
///
/// Await the handle to get the [`TaskResult`]. Dropping it discards the
/// result; the task still runs.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// The id of the task this handle belongs to
    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    /// Wait for the result, giving up when `ctx` is done
    pub async fn wait(self, ctx: &Context) -> Result<TaskResult, ContextError> {
        tokio::select! {
            result = self => Ok(result),
            err = ctx.done() => Err(err),
        }
    }

    /// Take the result if it is ready without waiting
    pub fn try_result(&mut self) -> Option<TaskResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(TaskResult::shutdown(self.task_id.clone()))
            }
        }
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Responder sends on drop, so this only fires if it was leaked
            Poll::Ready(Err(_)) => Poll::Ready(TaskResult::shutdown(this.task_id.clone())),
            Poll::Pending => Poll::Pending,
        }
    }
}
