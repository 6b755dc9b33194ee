//! Wires the producer, the worker pool and the reducer into one run.
//!
//! ```text
//! producer -> RetryQueue -> workers -> ReorderBuffer -> reducer -> store / consumer
//!                 ^                                        |
//!                 +------ released same-sender tasks ------+
//! ```
//!
//! The producer and the workers run on scoped threads; the reducer runs on the caller's
//! thread. A fatal error cancels a child of the caller's token so every blocked component
//! unwinds, while the caller's token itself is left untouched.

use crate::{
    config::{ConfigError, EngineConfig, ExecutionMode},
    speculative::{
        producer::{Producer, ProducerProgress},
        queue::RetryQueue,
        reducer::{Consumer, ConsumerError, Reducer},
        results::ReorderBuffer,
        state::{StoreError, VersionedStateStore},
        tracker::DependencyTracker,
        types::{BlockInput, BlockNum, TaskError, TxNum},
        worker::{PoolState, TxExecutor, Worker, WorkerGuard},
    },
};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("task {tx_num} of block {block_num} failed: {source}")]
    Task {
        tx_num: TxNum,
        block_num: BlockNum,
        #[source]
        source: TaskError,
    },
    #[error("consumer failed at task {tx_num}: {source}")]
    Consumer {
        tx_num: TxNum,
        #[source]
        source: ConsumerError,
    },
    #[error("state store failed at task {tx_num}: {source}")]
    Store {
        tx_num: TxNum,
        #[source]
        source: StoreError,
    },
    #[error("checkpoint for step {step} failed: {source}")]
    Checkpoint {
        step: u64,
        #[source]
        source: StoreError,
    },
    #[error("result feed closed at watermark {watermark}, expected {expected}")]
    Incomplete { watermark: TxNum, expected: TxNum },
    #[error("execution cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Statistics of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub first_tx_num: TxNum,
    /// Next sequence number to commit.
    pub watermark: TxNum,
    pub committed: u64,
    pub blocks: u64,
    pub checkpoints: u64,
    /// Tasks re-executed at commit because a live read went stale.
    pub reexecuted: u64,
}

pub struct Pipeline<E, S> {
    config: EngineConfig,
    executor: E,
    store: Arc<S>,
    watermark: AtomicU64,
    /// Checkpoint step left behind by a run whose store failed to compute it.
    unsealed: Mutex<Option<u64>>,
}

impl<E, S> Pipeline<E, S>
where
    E: TxExecutor,
    S: VersionedStateStore,
{
    pub fn new(config: EngineConfig, executor: E, store: Arc<S>) -> Result<Self, ConfigError> {
        config.validate()?;
        if store.step_size() != config.step_size {
            return Err(ConfigError::StepSizeMismatch {
                config: config.step_size,
                store: store.step_size(),
            });
        }
        Ok(Self {
            config,
            executor,
            store,
            watermark: AtomicU64::new(0),
            unsealed: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Next sequence number to commit, as left by the last run. After a failed run this is
    /// the sequence number to resume from. A checkpoint whose boundary was committed but not
    /// computed is computed first when the next run resumes from here.
    pub fn watermark(&self) -> TxNum {
        self.watermark.load(Ordering::Acquire)
    }

    /// Executes `blocks`, numbering tasks from `first_tx_num`, and hands every committed task
    /// to `consumer` in order.
    pub fn run<I, C>(
        &self,
        first_tx_num: TxNum,
        blocks: I,
        consumer: &mut C,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError>
    where
        I: IntoIterator<Item = BlockInput<E::Tx>>,
        I::IntoIter: Send,
        C: Consumer<E::Tx>,
    {
        let config = &self.config;
        let run_cancel = cancel.child_token();
        let poll_interval = config.poll_interval();

        let queue = RetryQueue::new(config.queue_capacity, run_cancel.clone())
            .with_window(first_tx_num, config.speculation_window())
            .with_poll_interval(poll_interval);
        let results = ReorderBuffer::new(
            config.result_channel_capacity,
            config.result_heap_capacity,
            run_cancel.clone(),
        )
        .with_poll_interval(poll_interval);
        let tracker = DependencyTracker::new();
        let progress = ProducerProgress::new(first_tx_num);
        let pool = PoolState::new(config.workers);
        self.watermark.store(first_tx_num, Ordering::Release);

        let parent_span = Span::current();
        let blocks = blocks.into_iter();

        info!(
            target: "parallel_exec",
            first_tx_num,
            workers = config.workers,
            mode = %config.mode,
            "Starting execution pipeline"
        );

        let outcome = thread::scope(|s| {
            // Stops the producer and the workers once the reducer returns, including on a
            // fatal error or a consumer panic.
            let _stop_on_exit = run_cancel.clone().drop_guard();
            let (queue, results, tracker, progress, pool) =
                (&queue, &results, &tracker, &progress, &pool);

            s.spawn(move || {
                let producer = Producer::new(config.mode, queue, tracker, progress, pool);
                match producer.run(blocks) {
                    Ok(produced) => debug!(target: "parallel_exec", produced, "Producer finished"),
                    Err(err) => debug!(target: "parallel_exec", %err, "Producer stopped"),
                }
            });

            for worker_id in 0..config.workers {
                let worker_span = tracing::info_span!(
                    target: "parallel_exec",
                    parent: &parent_span,
                    "parallel_exec_worker",
                    worker_id = worker_id
                );
                s.spawn(move || {
                    let _span = worker_span.entered();
                    let _guard = WorkerGuard::new(pool, results);
                    Worker::new(
                        worker_id,
                        config.mode,
                        &self.executor,
                        self.store.as_ref(),
                        queue,
                        results,
                    )
                    .run();
                });
            }

            let mut reducer = Reducer {
                executor: &self.executor,
                store: self.store.as_ref(),
                queue,
                results,
                tracker: (config.mode == ExecutionMode::Live).then_some(tracker),
                consumer,
                progress,
                indexing: &config.indexing,
                step_size: config.step_size,
                poll_interval,
                cancel: &run_cancel,
                published: &self.watermark,
                unsealed: &self.unsealed,
                watermark: first_tx_num,
                summary: RunSummary {
                    first_tx_num,
                    watermark: first_tx_num,
                    ..RunSummary::default()
                },
            };
            let outcome = reducer.run();
            queue.close();
            results.close();
            outcome
        });

        match &outcome {
            Ok(summary) => info!(
                target: "parallel_exec",
                watermark = summary.watermark,
                committed = summary.committed,
                blocks = summary.blocks,
                checkpoints = summary.checkpoints,
                reexecuted = summary.reexecuted,
                "Execution pipeline finished"
            ),
            Err(err) => info!(
                target: "parallel_exec",
                watermark = self.watermark(),
                %err,
                "Execution pipeline stopped"
            ),
        }
        outcome
    }
}
