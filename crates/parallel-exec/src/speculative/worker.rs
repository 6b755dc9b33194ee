//! Worker pool side of the pipeline.
//!
//! A worker pulls a task from the [`RetryQueue`], executes it against a state view and
//! pushes the result into the [`ReorderBuffer`]. Historical workers bind one
//! [`HistoryView`] for their whole life; live workers build a fresh [`LiveView`] per task.
//! Errors and panics raised by the payload executor are captured on the task, never
//! propagated out of the worker thread.

use crate::{
    config::ExecutionMode,
    speculative::{
        queue::RetryQueue,
        results::ReorderBuffer,
        state::{HistoryView, LiveView, StateView, VersionedStateStore},
        types::{Task, TaskError},
    },
};
use alloy_primitives::{Address, Log};
use std::{
    any::Any,
    collections::BTreeSet,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tracing::{debug, warn};

/// Effects of one executed task, besides the state writes staged on the view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    /// The transaction reverted; it is still committed.
    pub failed: bool,
    pub gas_used: u64,
    pub logs: Vec<Log>,
    pub trace_froms: BTreeSet<Address>,
    pub trace_tos: BTreeSet<Address>,
}

/// Executes task payloads. The pipeline treats it as opaque: block sentinels are handed to
/// it too, with no payload, so it can apply block-level effects such as rewards.
pub trait TxExecutor: Send + Sync {
    type Tx: Send + Sync;

    fn execute(
        &self,
        task: &Task<Self::Tx>,
        view: &mut dyn StateView,
    ) -> Result<ExecOutcome, TaskError>;
}

/// Runs `task` on `view`, capturing the outcome, error or panic on the task.
pub(crate) fn execute_task<E: TxExecutor>(
    executor: &E,
    task: &mut Task<E::Tx>,
    view: &mut dyn StateView,
) {
    task.reset();
    let result = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(task, view)));
    match result {
        Ok(Ok(outcome)) => {
            task.failed = outcome.failed;
            task.gas_used = outcome.gas_used;
            task.logs = outcome.logs;
            task.trace_froms = outcome.trace_froms;
            task.trace_tos = outcome.trace_tos;
        }
        Ok(Err(err)) => task.error = Some(err),
        Err(payload) => task.error = Some(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Runs `task` on a fresh view over the latest committed state, keeping its read and
/// write sets on the task.
pub(crate) fn execute_live<E: TxExecutor, S: VersionedStateStore>(
    executor: &E,
    store: &S,
    task: &mut Task<E::Tx>,
) {
    let mut view = LiveView::new(store, task.tx_num);
    execute_task(executor, task, &mut view);
    let (read_set, write_set, balance_increases) = view.into_parts();
    task.read_set = read_set;
    task.write_set = write_set;
    task.balance_increases = balance_increases;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Liveness of the worker pool, shared with the producer.
#[derive(Debug)]
pub struct PoolState {
    live: AtomicUsize,
    exited: AtomicBool,
}

impl PoolState {
    pub fn new(workers: usize) -> Self {
        Self {
            live: AtomicUsize::new(workers),
            exited: AtomicBool::new(workers == 0),
        }
    }

    /// Every worker has exited.
    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// RAII guard held by each worker thread for its whole life.
/// The last worker to drop its guard closes the result buffer.
pub struct WorkerGuard<'a, T> {
    pool: &'a PoolState,
    results: &'a ReorderBuffer<T>,
}

impl<'a, T> WorkerGuard<'a, T> {
    /// The pool counter starts at the full worker count, so a worker that exits before
    /// another has started cannot close the buffer early.
    pub fn new(pool: &'a PoolState, results: &'a ReorderBuffer<T>) -> Self {
        Self { pool, results }
    }
}

impl<T> Drop for WorkerGuard<'_, T> {
    fn drop(&mut self) {
        if self.pool.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.exited.store(true, Ordering::Release);
            self.results.close();
        }
    }
}

pub struct Worker<'a, E: TxExecutor, S> {
    id: usize,
    executor: &'a E,
    store: &'a S,
    queue: &'a RetryQueue<E::Tx>,
    results: &'a ReorderBuffer<E::Tx>,
    history: Option<HistoryView<'a>>,
}

impl<'a, E: TxExecutor, S: VersionedStateStore> Worker<'a, E, S> {
    pub fn new(
        id: usize,
        mode: ExecutionMode,
        executor: &'a E,
        store: &'a S,
        queue: &'a RetryQueue<E::Tx>,
        results: &'a ReorderBuffer<E::Tx>,
    ) -> Self {
        let history = match mode {
            ExecutionMode::Historical => Some(HistoryView::new(store)),
            ExecutionMode::Live => None,
        };
        Self {
            id,
            executor,
            store,
            queue,
            results,
            history,
        }
    }

    /// Serves tasks until the queue is closed and drained, or the run is cancelled.
    pub fn run(mut self) -> usize {
        let mut executed = 0;
        while let Some(mut task) = self.queue.next() {
            debug!(
                target: "parallel_exec",
                worker_id = self.id,
                tx_num = task.tx_num,
                block_num = task.block_num(),
                incarnation = task.incarnation,
                kind = %task.kind,
                "Executing task"
            );

            self.execute(&mut task);
            executed += 1;

            if let Some(err) = &task.error {
                warn!(
                    target: "parallel_exec",
                    worker_id = self.id,
                    tx_num = task.tx_num,
                    block_num = task.block_num(),
                    %err,
                    "Task execution failed"
                );
            }

            if let Err(err) = self.results.push(task) {
                debug!(target: "parallel_exec", worker_id = self.id, %err, "Result buffer refused push");
                break;
            }
        }

        debug!(target: "parallel_exec", worker_id = self.id, executed, "Worker thread exiting");
        executed
    }

    fn execute(&mut self, task: &mut Task<E::Tx>) {
        match self.history.as_mut() {
            Some(view) => {
                view.set_tx_num(task.tx_num);
                execute_task(self.executor, task, view);
            }
            None => execute_live(self.executor, self.store, task),
        }
    }
}
