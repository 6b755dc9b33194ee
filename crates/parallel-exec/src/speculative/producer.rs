//! Turns a block range into tasks.
//!
//! Each block becomes a start sentinel, one task per transaction and an end sentinel, with
//! consecutive sequence numbers. In live mode every task passes through the
//! [`DependencyTracker`] before it reaches the queue.

use crate::{
    config::ExecutionMode,
    speculative::{
        queue::{QueueError, RetryQueue},
        tracker::{DependencyTracker, Registration},
        types::{BlockContext, BlockInput, Task, TxInput, TxNum},
        worker::PoolState,
    },
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tracing::debug;

/// How far the producer has got, shared with the reducer.
#[derive(Debug)]
pub struct ProducerProgress {
    /// One past the last sequence number handed to the queue.
    end: AtomicU64,
    done: AtomicBool,
}

impl ProducerProgress {
    pub fn new(first_tx_num: TxNum) -> Self {
        Self {
            end: AtomicU64::new(first_tx_num),
            done: AtomicBool::new(false),
        }
    }

    pub fn end(&self) -> TxNum {
        self.end.load(Ordering::Acquire)
    }

    /// The whole range has been produced.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Everything produced has been committed.
    pub fn is_complete(&self, watermark: TxNum) -> bool {
        self.is_done() && self.end() == watermark
    }

    fn advance(&self, end: TxNum) {
        self.end.store(end, Ordering::Release);
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
    }
}

pub struct Producer<'a, T> {
    mode: ExecutionMode,
    queue: &'a RetryQueue<T>,
    tracker: &'a DependencyTracker<T>,
    progress: &'a ProducerProgress,
    pool: &'a PoolState,
}

impl<'a, T> Producer<'a, T> {
    pub fn new(
        mode: ExecutionMode,
        queue: &'a RetryQueue<T>,
        tracker: &'a DependencyTracker<T>,
        progress: &'a ProducerProgress,
        pool: &'a PoolState,
    ) -> Self {
        Self {
            mode,
            queue,
            tracker,
            progress,
            pool,
        }
    }

    /// Enqueues every block, then closes the queue. The queue is closed on failure too.
    /// Returns the number of blocks produced.
    pub fn run<I>(self, blocks: I) -> Result<u64, QueueError>
    where
        I: IntoIterator<Item = BlockInput<T>>,
    {
        let result = self.produce(blocks);
        if result.is_ok() {
            // Mark completion before closing so the reducer never sees a closed feed
            // without knowing the final range.
            self.progress.finish();
        }
        self.queue.close();
        result
    }

    fn produce<I>(&self, blocks: I) -> Result<u64, QueueError>
    where
        I: IntoIterator<Item = BlockInput<T>>,
    {
        let mut tx_num = self.progress.end();
        let mut produced = 0;

        for BlockInput {
            header,
            transactions,
        } in blocks
        {
            let block_num = header.number;
            let tx_count = transactions.len();
            let block = Arc::new(BlockContext::new(header, tx_count));

            self.dispatch(Task::block_start(tx_num, Arc::clone(&block)))?;
            tx_num += 1;
            for (index, TxInput { sender, tx }) in transactions.into_iter().enumerate() {
                self.dispatch(Task::transaction(tx_num, index, sender, tx, Arc::clone(&block)))?;
                tx_num += 1;
            }
            self.dispatch(Task::block_end(tx_num, block))?;
            tx_num += 1;

            produced += 1;
            debug!(target: "parallel_exec", block_num, tx_count, end = tx_num, "Block enqueued");
        }
        Ok(produced)
    }

    fn dispatch(&self, mut task: Task<T>) -> Result<(), QueueError> {
        if self.pool.exited() {
            return Err(QueueError::WorkersExited);
        }

        let next = task.tx_num + 1;
        match self.mode {
            ExecutionMode::Historical => {
                task.history_execution = true;
                self.queue.add(task)?;
            }
            ExecutionMode::Live => match self.tracker.register_sender(task, self.queue) {
                Registration::Runnable(task) => self.queue.add(task)?,
                Registration::Deferred => {}
            },
        }
        self.progress.advance(next);
        Ok(())
    }
}
