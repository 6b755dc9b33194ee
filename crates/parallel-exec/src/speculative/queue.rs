//! Bounded queue feeding the worker pool.
//!
//! New tasks go through [`RetryQueue::add`], which blocks while the queue is full.
//! Tasks released by the dependency tracker come back through [`RetryQueue::retry`],
//! which never blocks: a retried task already owned a slot when it was first dispatched.
//!
//! Dispatch is limited to a speculation window above the reducer's watermark, so workers
//! can never produce more uncommitted results than the reorder buffer holds.

use crate::speculative::types::{BySequence, Task, TxNum};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BinaryHeap, VecDeque},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// How long a blocked caller sleeps before re-checking cancellation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("cancelled")]
    Cancelled,
    #[error("worker pool exited")]
    WorkersExited,
}

struct QueueState<T> {
    pending: VecDeque<Task<T>>,
    retries: BinaryHeap<BySequence<T>>,
    /// Deferred tasks that will come back through `retry`.
    parked: usize,
    watermark: TxNum,
    closed: bool,
}

impl<T> QueueState<T> {
    fn pop_runnable(&mut self, window: u64) -> Option<Task<T>> {
        let limit = self.watermark.saturating_add(window);
        if self.retries.peek().is_some_and(|next| next.0.tx_num < limit) {
            return self.retries.pop().map(|next| next.0);
        }
        if self.pending.front().is_some_and(|next| next.tx_num < limit) {
            return self.pending.pop_front();
        }
        None
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.retries.is_empty() && self.parked == 0
    }
}

pub struct RetryQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    space: Condvar,
    capacity: usize,
    window: u64,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<T> RetryQueue<T> {
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity.min(1024)),
                retries: BinaryHeap::new(),
                parked: 0,
                watermark: 0,
                closed: false,
            }),
            available: Condvar::new(),
            space: Condvar::new(),
            capacity,
            window: u64::MAX,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel,
        }
    }

    /// Only tasks below `watermark + window` are handed out.
    pub fn with_window(mut self, watermark: TxNum, window: u64) -> Self {
        self.state.get_mut().watermark = watermark;
        self.window = window;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Enqueues a new task, blocking while the queue is at capacity.
    pub fn add(&self, task: Task<T>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        loop {
            if self.cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.pending.len() < self.capacity {
                state.pending.push_back(task);
                drop(state);
                self.available.notify_one();
                return Ok(());
            }
            self.space.wait_for(&mut state, self.poll_interval);
        }
    }

    /// Announces a deferred task. A closed queue keeps serving until it comes back.
    pub fn expect_retry(&self) {
        self.state.lock().parked += 1;
    }

    /// Re-admits a deferred task ahead of new work, without checking capacity.
    /// The task is reset before it is handed out again.
    pub fn retry(&self, mut task: Task<T>) {
        task.prepare_retry();
        let mut state = self.state.lock();
        state.parked = state.parked.saturating_sub(1);
        state.retries.push(BySequence(task));
        drop(state);
        self.available.notify_all();
    }

    /// Blocks until a task can be dispatched. Returns `None` once the queue is closed and
    /// fully drained, or on cancellation.
    pub fn next(&self) -> Option<Task<T>> {
        let mut state = self.state.lock();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(task) = state.pop_runnable(self.window) {
                drop(state);
                self.space.notify_one();
                return Some(task);
            }
            if state.closed && state.is_drained() {
                return None;
            }
            self.available.wait_for(&mut state, self.poll_interval);
        }
    }

    /// Publishes the reducer's watermark, widening the dispatch window.
    pub fn advance_watermark(&self, watermark: TxNum) {
        let mut state = self.state.lock();
        if watermark > state.watermark {
            state.watermark = watermark;
            drop(state);
            self.available.notify_all();
        }
    }

    /// Idempotent. Queued and parked tasks still drain after closing.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
        self.space.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parked(&self) -> usize {
        self.state.lock().parked
    }
}
