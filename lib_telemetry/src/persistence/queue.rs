//! # Operation Queue
//!
//! Bounded FIFO between the producers (handlers running on the processing
//! worker) and the batch worker. The engine lifecycle state, the queued items
//! and every counter live under one mutex, so `stats()` is always a consistent
//! snapshot and an enqueue can never race a state transition.
//!
//! A full queue rejects new work instead of growing or blocking.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::persistence::operation::{Operation, QueuedOperation};

/// Lifecycle of the persistence engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Not accepting work, no worker.
    Stopped,
    /// Accepting work, worker active.
    Running,
    /// Not accepting work, worker draining.
    Stopping,
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The engine is not in the `Running` state.
    NotRunning,
    /// The queue is at capacity.
    Full,
}

/// Persistence counters, taken under the queue lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistenceStats {
    /// Operations accepted into the queue.
    pub operations_queued: u64,
    /// Operations committed as part of a successful batch.
    pub operations_completed: u64,
    /// Successful batch transactions.
    pub batch_inserts: u64,
    /// Failed batch transactions.
    pub errors: u64,
    /// Enqueues rejected because the queue was full.
    pub queue_overflows: u64,
    /// Operations currently queued.
    pub queue_size: usize,
    /// Bound of the queue.
    pub queue_capacity: usize,
    /// Whether the engine is in the `Running` state.
    pub is_running: bool,
}

struct QueueState {
    state: EngineState,
    items: VecDeque<QueuedOperation>,
    in_flight: usize,
    operations_queued: u64,
    operations_completed: u64,
    batch_inserts: u64,
    errors: u64,
    queue_overflows: u64,
}

/// Bounded operation queue plus engine state.
pub struct OperationQueue {
    capacity: usize,
    inner: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
}

impl OperationQueue {
    /// Stopped, empty queue holding at most `capacity` operations.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(QueueState {
                state: EngineState::Stopped,
                items: VecDeque::with_capacity(capacity),
                in_flight: 0,
                operations_queued: 0,
                operations_completed: 0,
                batch_inserts: 0,
                errors: 0,
                queue_overflows: 0,
            }),
            available: Notify::new(),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Moves `from` to `to`. Returns false when the current state is not `from`.
    pub fn transition(&self, from: EngineState, to: EngineState) -> bool {
        let mut inner = self.lock();
        if inner.state != from {
            return false;
        }
        inner.state = to;
        drop(inner);
        // The worker re-checks the state on every wake-up.
        self.available.notify_one();
        true
    }

    /// Appends an operation when running and not full.
    pub fn push(&self, operation: Operation) -> Result<(), Rejection> {
        let mut inner = self.lock();
        if inner.state != EngineState::Running {
            return Err(Rejection::NotRunning);
        }
        if inner.items.len() >= self.capacity {
            inner.queue_overflows += 1;
            return Err(Rejection::Full);
        }
        inner.items.push_back(QueuedOperation::new(operation));
        inner.operations_queued += 1;
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Takes the oldest operation. It counts as in flight until
    /// [`OperationQueue::finish_batch`] settles it.
    pub fn pop(&self) -> Option<QueuedOperation> {
        let mut inner = self.lock();
        let item = inner.items.pop_front()?;
        inner.in_flight += 1;
        Some(item)
    }

    /// Takes everything queued, oldest first.
    pub fn drain_all(&self) -> Vec<QueuedOperation> {
        let mut inner = self.lock();
        let drained: Vec<QueuedOperation> = inner.items.drain(..).collect();
        inner.in_flight += drained.len();
        drained
    }

    /// Waits up to `wait` for an operation. Returns `None` on timeout or when
    /// the engine leaves the `Running` state.
    pub async fn next(&self, wait: Duration) -> Option<QueuedOperation> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.state() != EngineState::Running {
                return None;
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.pop();
            }
        }
    }

    /// Settles `count` in-flight operations as one batch attempt.
    pub fn finish_batch(&self, count: usize, success: bool) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(count);
        if success {
            inner.operations_completed += count as u64;
            inner.batch_inserts += 1;
        } else {
            inner.errors += 1;
        }
        let idle = inner.items.is_empty() && inner.in_flight == 0;
        drop(inner);
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// True when nothing is queued and no batch is pending.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.items.is_empty() && inner.in_flight == 0
    }

    /// Waits until [`OperationQueue::is_idle`] holds, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle();
            }
        }
    }

    /// Consistent snapshot of the counters.
    pub fn stats(&self) -> PersistenceStats {
        let inner = self.lock();
        PersistenceStats {
            operations_queued: inner.operations_queued,
            operations_completed: inner.operations_completed,
            batch_inserts: inner.batch_inserts,
            errors: inner.errors,
            queue_overflows: inner.queue_overflows,
            queue_size: inner.items.len(),
            queue_capacity: self.capacity,
            is_running: inner.state == EngineState::Running,
        }
    }

    /// Bound of the queue.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
