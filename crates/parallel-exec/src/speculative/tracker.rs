//! Same-sender dependency tracking for live execution.
//!
//! A transaction usually depends on the nonce and balance left behind by the previous
//! transaction of the same sender. Instead of letting the pair race and detecting the
//! conflict afterwards, the tracker parks the later task as a trigger on the sequence
//! number of the earlier one and hands it back to the [`RetryQueue`] once that sequence
//! number commits.

use crate::speculative::{
    queue::RetryQueue,
    types::{Task, TxNum},
};
use alloy_primitives::Address;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{error, trace};

/// Outcome of [`DependencyTracker::register_sender`].
#[derive(Debug)]
pub enum Registration<T> {
    /// No outstanding task from the same sender: enqueue it normally.
    Runnable(Task<T>),
    /// Parked until its predecessor commits; do not enqueue.
    Deferred,
}

struct TrackerState<T> {
    /// Sender -> latest dispatched, uncommitted sequence number.
    last_issued: HashMap<Address, TxNum>,
    /// Blocking sequence number -> the task waiting on it.
    triggers: HashMap<TxNum, Task<T>>,
}

pub struct DependencyTracker<T> {
    state: Mutex<TrackerState<T>>,
}

impl<T> Default for DependencyTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DependencyTracker<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                last_issued: HashMap::new(),
                triggers: HashMap::new(),
            }),
        }
    }

    /// Registers a task about to be dispatched. Tasks without a sender are always runnable.
    ///
    /// The sender's latest sequence number is updated even when the task is deferred, so a
    /// third task from the same sender waits on the second one rather than the first.
    pub fn register_sender(&self, task: Task<T>, queue: &RetryQueue<T>) -> Registration<T> {
        let Some(sender) = task.sender else {
            return Registration::Runnable(task);
        };

        let mut state = self.state.lock();
        let Some(blocking) = state.last_issued.insert(sender, task.tx_num) else {
            return Registration::Runnable(task);
        };

        trace!(
            target: "parallel_exec",
            tx_num = task.tx_num,
            blocking,
            %sender,
            "Deferring task behind same-sender predecessor"
        );
        queue.expect_retry();
        // At most one task per sender can be outstanding when a new one registers.
        let replaced = state.triggers.insert(blocking, task);
        debug_assert!(replaced.is_none(), "trigger for {blocking} overwritten");
        if let Some(replaced) = replaced {
            error!(
                target: "parallel_exec",
                blocking,
                replaced = replaced.tx_num,
                "Overwrote a pending trigger"
            );
        }
        Registration::Deferred
    }

    /// Called by the reducer after committing `tx_num`. Releases the task waiting on it,
    /// if any, and forgets the sender once it has no outstanding work.
    /// Returns whether a task was released.
    pub fn commit_tx_num(
        &self,
        sender: Option<Address>,
        tx_num: TxNum,
        queue: &RetryQueue<T>,
    ) -> bool {
        let mut state = self.state.lock();
        let released = state.triggers.remove(&tx_num);
        let was_released = released.is_some();
        if let Some(task) = released {
            trace!(target: "parallel_exec", tx_num, released = task.tx_num, "Releasing deferred task");
            queue.retry(task);
        }
        if let Some(sender) = sender {
            if state.last_issued.get(&sender) == Some(&tx_num) {
                state.last_issued.remove(&sender);
            }
        }
        was_released
    }

    pub fn last_issued(&self, sender: &Address) -> Option<TxNum> {
        self.state.lock().last_issued.get(sender).copied()
    }

    /// Number of senders with outstanding work.
    pub fn outstanding_senders(&self) -> usize {
        self.state.lock().last_issued.len()
    }

    pub fn pending_triggers(&self) -> usize {
        self.state.lock().triggers.len()
    }
}
