//! Bounded FIFO queue between submitters and workers
//!
//! Capacity is tracked by a fair semaphore, so blocked submitters are
//! admitted in arrival order. Items live in a mutex-guarded deque that is
//! never held across an await point.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

use crate::context::{Context, ContextError};

/// Queue errors; every variant hands the rejected item back
#[derive(thiserror::Error)]
pub enum QueueError<T> {
    /// No free slot (non-blocking push only)
    #[error("queue is full")]
    Full(T),

    /// The queue was closed
    #[error("queue is closed")]
    Closed(T),

    /// The push context ended before a slot freed up
    #[error("push aborted: {1}")]
    Cancelled(T, ContextError),
}

impl<T> QueueError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) | Self::Cancelled(item, _) => item,
        }
    }
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Cancelled(_, err) => write!(f, "Cancelled(.., {err:?})"),
        }
    }
}

/// Fixed-capacity multi-producer multi-consumer FIFO queue
///
/// # Example
///
/// ```
/// use taskgate_engine::worker::{BoundedQueue, QueueError};
///
/// let queue = BoundedQueue::new(1);
/// queue.try_push("a").unwrap();
/// assert!(matches!(queue.try_push("b"), Err(QueueError::Full("b"))));
/// ```
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    available: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Push an item, waiting for a free slot until `ctx` is done
    ///
    /// A push that fails leaves the queue untouched.
    pub async fn push(&self, ctx: &Context, item: T) -> Result<(), QueueError<T>> {
        if self.is_closed() {
            return Err(QueueError::Closed(item));
        }

        let acquired = tokio::select! {
            biased;
            err = ctx.done() => Err(Some(err)),
            permit = self.slots.acquire() => permit.map_err(|_| None),
        };

        match acquired {
            Ok(permit) => {
                permit.forget();
                self.insert(item)
            }
            Err(Some(err)) => Err(QueueError::Cancelled(item, err)),
            Err(None) => Err(QueueError::Closed(item)),
        }
    }

    /// Push an item only if a slot is free right now
    pub fn try_push(&self, item: T) -> Result<(), QueueError<T>> {
        if self.is_closed() {
            return Err(QueueError::Closed(item));
        }

        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.insert(item)
            }
            Err(TryAcquireError::NoPermits) => Err(QueueError::Full(item)),
            Err(TryAcquireError::Closed) => Err(QueueError::Closed(item)),
        }
    }

    /// Wait for the next item; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a close or push in between is not missed
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Take the next item if one is queued
    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.slots.add_permits(1);
        }
        item
    }

    /// Reject further pushes and wake every waiter
    ///
    /// Items already queued stay poppable.
    pub fn close(&self) {
        {
            let _items = self.items.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.slots.close();
        self.available.notify_waiters();
    }

    /// Remove and return every queued item
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        if !drained.is_empty() {
            self.slots.add_permits(drained.len());
        }
        drained
    }

    fn insert(&self, item: T) -> Result<(), QueueError<T>> {
        {
            let mut items = self.items.lock();
            // Closed between acquiring the slot and inserting
            if self.closed.load(Ordering::Acquire) {
                drop(items);
                self.slots.add_permits(1);
                return Err(QueueError::Closed(item));
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
