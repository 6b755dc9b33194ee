//! Single-threaded commit loop.
//!
//! The reducer drains the [`ReorderBuffer`] strictly in sequence order and, for each task:
//!
//! 1. Re-executes it inline if a live read went stale
//! 2. Stops the run if it carries an error
//! 3. Applies its writes and index entries to the store
//! 4. Releases the same-sender task waiting on it
//! 5. Records its receipt, advances the watermark and calls the consumer
//! 6. Seals a checkpoint when the watermark reaches a step boundary, even if the consumer
//!    rejected the task
//!
//! A checkpoint the store fails to compute is kept as unsealed and retried first by the next
//! run that resumes at its boundary.

use crate::{
    config::IndexConfig,
    speculative::{
        pipeline::{PipelineError, RunSummary},
        producer::ProducerProgress,
        queue::RetryQueue,
        results::{Drained, ReorderBuffer},
        state::{StateReader, StoreError, VersionedStateStore},
        tracker::DependencyTracker,
        types::{Account, Domain, IndexTable, Task, TxNum, WriteOp, account_key},
        worker::{TxExecutor, execute_live},
    },
};
use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every committed task exactly once, in commit order.
pub trait Consumer<T> {
    fn reduce(&mut self, task: &Task<T>, state: &dyn StateReader) -> Result<(), ConsumerError>;
}

impl<T, F> Consumer<T> for F
where
    F: FnMut(&Task<T>, &dyn StateReader) -> Result<(), ConsumerError>,
{
    fn reduce(&mut self, task: &Task<T>, state: &dyn StateReader) -> Result<(), ConsumerError> {
        self(task, state)
    }
}

/// Applies a task's staged writes and balance increases to the store.
pub fn apply_state<S, T>(store: &S, task: &Task<T>) -> Result<(), StoreError>
where
    S: VersionedStateStore + ?Sized,
{
    let rules = task.block.rules();
    for (domain, key, op) in task.write_set.iter() {
        match op {
            WriteOp::Put(value) => {
                if domain == Domain::Accounts
                    && rules.empty_account_removal
                    && Account::decode(value)?.is_empty()
                {
                    store.delete(domain, key)?;
                } else {
                    store.put(domain, key, value)?;
                }
            }
            WriteOp::Delete => store.delete(domain, key)?,
            WriteOp::DeletePrefix => store.delete_prefix(domain, key)?,
        }
    }

    for (address, increase) in &task.balance_increases {
        let key = account_key(address);
        let mut account = match store.get_latest(Domain::Accounts, &key)? {
            Some(raw) => Account::decode(&raw)?,
            None => Account::default(),
        };
        account.balance = account.balance.saturating_add(*increase);
        if rules.empty_account_removal && account.is_empty() {
            store.delete(Domain::Accounts, &key)?;
        } else {
            store.put(Domain::Accounts, &key, &account.encode())?;
        }
    }
    Ok(())
}

/// Feeds the trace and log indices from a committed task.
pub fn apply_indices<S, T>(store: &S, task: &Task<T>, indexing: &IndexConfig) -> Result<(), StoreError>
where
    S: VersionedStateStore + ?Sized,
{
    for address in &task.trace_froms {
        store.index_add(IndexTable::TracesFrom, address.as_slice())?;
    }
    for address in &task.trace_tos {
        store.index_add(IndexTable::TracesTo, address.as_slice())?;
    }
    for log in &task.logs {
        if indexing.prune_non_essentials && indexing.deposit_contract != Some(log.address) {
            continue;
        }
        store.index_add(IndexTable::LogAddress, log.address.as_slice())?;
        for topic in log.data.topics() {
            store.index_add(IndexTable::LogTopics, topic.as_slice())?;
        }
    }
    Ok(())
}

pub struct Reducer<'a, E: TxExecutor, S, C> {
    pub(crate) executor: &'a E,
    pub(crate) store: &'a S,
    pub(crate) queue: &'a RetryQueue<E::Tx>,
    pub(crate) results: &'a ReorderBuffer<E::Tx>,
    /// Present in live mode only.
    pub(crate) tracker: Option<&'a DependencyTracker<E::Tx>>,
    pub(crate) consumer: &'a mut C,
    pub(crate) progress: &'a ProducerProgress,
    pub(crate) indexing: &'a IndexConfig,
    pub(crate) step_size: u64,
    pub(crate) poll_interval: Duration,
    pub(crate) cancel: &'a CancellationToken,
    /// Last committed watermark, readable after the run.
    pub(crate) published: &'a AtomicU64,
    /// Step whose boundary is committed but whose checkpoint has not been computed.
    pub(crate) unsealed: &'a Mutex<Option<u64>>,
    pub(crate) watermark: TxNum,
    pub(crate) summary: RunSummary,
}

impl<E, S, C> Reducer<'_, E, S, C>
where
    E: TxExecutor,
    S: VersionedStateStore,
    C: Consumer<E::Tx>,
{
    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Commits results until the producer's range is exhausted, a task fails, or the run is
    /// cancelled.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        self.seal_unsealed()?;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let Drained { tasks, closed } = self.results.drain_non_blocking(self.watermark);
            let progressed = !tasks.is_empty();
            for task in tasks {
                self.commit(task)?;
            }

            if self.progress.is_complete(self.watermark) {
                return Ok(self.summary);
            }
            if closed {
                if self.cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                return Err(PipelineError::Incomplete {
                    watermark: self.watermark,
                    expected: self.progress.end(),
                });
            }
            if !progressed {
                self.results.wait_for_results(self.poll_interval);
            }
        }
    }

    fn commit(&mut self, mut task: Task<E::Tx>) -> Result<(), PipelineError> {
        let tx_num = task.tx_num;
        debug_assert_eq!(tx_num, self.watermark, "commit out of order");

        if self.tracker.is_some() && !self.reads_valid(&task)? {
            warn!(
                target: "parallel_exec",
                tx_num,
                block_num = task.block_num(),
                incarnation = task.incarnation,
                "Stale read detected, re-executing at commit"
            );
            task.prepare_retry();
            execute_live(self.executor, self.store, &mut task);
            self.summary.reexecuted += 1;
        }

        if let Some(source) = task.error.take() {
            return Err(PipelineError::Task {
                tx_num,
                block_num: task.block_num(),
                source,
            });
        }

        self.store.set_tx_num(tx_num);
        if !task.history_execution {
            apply_state(self.store, &task).map_err(|source| PipelineError::Store { tx_num, source })?;
        }
        apply_indices(self.store, &task, self.indexing)
            .map_err(|source| PipelineError::Store { tx_num, source })?;

        if let Some(tracker) = self.tracker {
            tracker.commit_tx_num(task.sender, tx_num, self.queue);
        }

        if let Some(index) = task.tx_index() {
            task.block
                .record_receipt(tx_num, index, !task.failed, task.gas_used, task.logs.clone());
        }
        task.release_sets();

        self.watermark = tx_num + 1;
        self.queue.advance_watermark(self.watermark);
        self.published.store(self.watermark, Ordering::Release);
        self.summary.watermark = self.watermark;
        self.summary.committed += 1;
        if task.is_block_end() {
            self.summary.blocks += 1;
        }

        // A rejected task still seals the boundary it completes before the error surfaces.
        let consumed = self
            .consumer
            .reduce(&task, self.store)
            .map_err(|source| PipelineError::Consumer { tx_num, source });
        if self.watermark % self.step_size == 0 {
            self.checkpoint(tx_num / self.step_size)?;
        }
        consumed?;

        debug!(target: "parallel_exec", tx_num, kind = %task.kind, "Committed task");
        Ok(())
    }

    /// Computes the checkpoint for `step`, which ends at the current watermark. The step stays
    /// in `unsealed` until the store succeeds.
    fn checkpoint(&mut self, step: u64) -> Result<(), PipelineError> {
        *self.unsealed.lock() = Some(step);
        let root = self
            .store
            .compute_checkpoint(step)
            .map_err(|source| PipelineError::Checkpoint { step, source })?;
        *self.unsealed.lock() = None;
        self.summary.checkpoints += 1;
        info!(
            target: "parallel_exec",
            step,
            tx_num = self.watermark - 1,
            %root,
            "Checkpoint computed"
        );
        Ok(())
    }

    /// Retries a checkpoint a previous run committed the boundary of but failed to compute.
    fn seal_unsealed(&mut self) -> Result<(), PipelineError> {
        let Some(step) = *self.unsealed.lock() else {
            return Ok(());
        };
        if (step + 1) * self.step_size != self.watermark {
            warn!(
                target: "parallel_exec",
                step,
                watermark = self.watermark,
                "Dropping unsealed checkpoint, run does not resume at its boundary"
            );
            *self.unsealed.lock() = None;
            return Ok(());
        }
        self.checkpoint(step)
    }

    fn reads_valid(&self, task: &Task<E::Tx>) -> Result<bool, PipelineError> {
        self.store
            .reads_valid(&task.read_set)
            .map_err(|source| PipelineError::Store {
                tx_num: task.tx_num,
                source,
            })
    }
}
