//! Reorder buffer between the workers and the reducer.
//!
//! Workers complete tasks in any order. The buffer holds completed tasks until the reducer
//! drains the contiguous run starting at its watermark; anything past the first gap stays
//! buffered. Capacity is split between an arrival channel (`R`) and a heap (`H`), and the
//! total number of buffered results never exceeds `R + H`: a push blocks once both are full.

use crate::speculative::{
    queue::{DEFAULT_POLL_INTERVAL, QueueError},
    types::{BySequence, Task, TxNum},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BinaryHeap, VecDeque},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

struct BufferState<T> {
    /// Arrivals not yet seen by the reducer.
    channel: VecDeque<Task<T>>,
    /// Ordered by ascending sequence number.
    heap: BinaryHeap<BySequence<T>>,
    closed: bool,
}

impl<T> BufferState<T> {
    fn len(&self) -> usize {
        self.channel.len() + self.heap.len()
    }
}

/// Output of [`ReorderBuffer::drain_non_blocking`].
#[derive(Debug)]
pub struct Drained<T> {
    /// Contiguous tasks starting at the requested watermark.
    pub tasks: Vec<Task<T>>,
    /// The buffer is closed and nothing further can continue the sequence: it is either
    /// empty or every remaining task lies beyond a gap that no push will fill.
    pub closed: bool,
}

pub struct ReorderBuffer<T> {
    state: Mutex<BufferState<T>>,
    space: Condvar,
    arrived: Condvar,
    channel_capacity: usize,
    heap_capacity: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<T> ReorderBuffer<T> {
    pub fn new(channel_capacity: usize, heap_capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(BufferState {
                channel: VecDeque::with_capacity(channel_capacity),
                heap: BinaryHeap::with_capacity(channel_capacity + heap_capacity),
                closed: false,
            }),
            space: Condvar::new(),
            arrived: Condvar::new(),
            channel_capacity,
            heap_capacity,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn capacity(&self) -> usize {
        self.channel_capacity + self.heap_capacity
    }

    /// Buffers a completed task, blocking while the buffer is full.
    pub fn push(&self, task: Task<T>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        loop {
            if self.cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.len() < self.capacity() {
                if state.channel.len() < self.channel_capacity {
                    state.channel.push_back(task);
                } else {
                    state.heap.push(BySequence(task));
                }
                drop(state);
                self.arrived.notify_one();
                return Ok(());
            }
            self.space.wait_for(&mut state, self.poll_interval);
        }
    }

    /// Takes every buffered task that continues the sequence from `watermark` without a gap.
    pub fn drain_non_blocking(&self, watermark: TxNum) -> Drained<T> {
        let mut state = self.state.lock();
        while let Some(task) = state.channel.pop_front() {
            state.heap.push(BySequence(task));
        }

        let mut tasks = Vec::new();
        let mut next = watermark;
        while state.heap.peek().is_some_and(|head| head.0.tx_num == next) {
            if let Some(BySequence(task)) = state.heap.pop() {
                tasks.push(task);
                next += 1;
            }
        }

        // The loop above stopped at a gap or an empty heap; nothing pushed later can fill it.
        let closed = state.closed;
        drop(state);
        if !tasks.is_empty() {
            self.space.notify_all();
        }
        Drained { tasks, closed }
    }

    /// Waits up to `timeout` for a new arrival.
    pub fn wait_for_results(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if state.channel.is_empty() && !state.closed {
            self.arrived.wait_for(&mut state, timeout);
        }
    }

    /// No more pushes will be accepted; buffered tasks can still be drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.arrived.notify_all();
        self.space.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speculative::types::{BlockContext, BlockHeader};
    use std::{sync::Arc, thread};

    fn task(tx_num: TxNum) -> Task<()> {
        let block = Arc::new(BlockContext::new(BlockHeader::default(), 0));
        Task::block_start(tx_num, block)
    }

    fn buffer(channel: usize, heap: usize) -> ReorderBuffer<()> {
        ReorderBuffer::new(channel, heap, CancellationToken::new())
            .with_poll_interval(Duration::from_millis(1))
    }

    fn tx_nums(drained: &Drained<()>) -> Vec<TxNum> {
        drained.tasks.iter().map(|task| task.tx_num).collect()
    }

    #[test]
    fn test_drain_stops_at_first_gap() {
        let buffer = buffer(2, 4);
        for tx_num in [3, 0, 1, 4] {
            buffer.push(task(tx_num)).unwrap();
        }

        let drained = buffer.drain_non_blocking(0);
        assert_eq!(tx_nums(&drained), vec![0, 1]);
        assert!(!drained.closed);
        assert_eq!(buffer.len(), 2);

        buffer.push(task(2)).unwrap();
        let drained = buffer.drain_non_blocking(2);
        assert_eq!(tx_nums(&drained), vec![2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_nothing_drained_before_watermark_arrives() {
        let buffer = buffer(4, 4);
        buffer.push(task(6)).unwrap();
        buffer.push(task(7)).unwrap();

        assert!(buffer.drain_non_blocking(5).tasks.is_empty());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_reverse_arrival_is_reordered() {
        let buffer = buffer(3, 7);
        for tx_num in (0..10).rev() {
            buffer.push(task(tx_num)).unwrap();
        }
        let drained = buffer.drain_non_blocking(0);
        assert_eq!(tx_nums(&drained), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_push_blocks_when_full() {
        let buffer = buffer(1, 1);
        buffer.push(task(1)).unwrap();
        buffer.push(task(2)).unwrap();

        thread::scope(|s| {
            let pusher = s.spawn(|| buffer.push(task(3)));
            thread::sleep(Duration::from_millis(20));
            assert!(!pusher.is_finished(), "push must block at R+H results");
            assert_eq!(buffer.len(), 2);

            buffer.close();
            assert_eq!(pusher.join().unwrap(), Err(QueueError::Closed));
        });
    }

    #[test]
    fn test_push_unblocks_after_drain() {
        let buffer = buffer(1, 1);
        buffer.push(task(0)).unwrap();
        buffer.push(task(1)).unwrap();

        thread::scope(|s| {
            let pusher = s.spawn(|| buffer.push(task(2)));
            thread::sleep(Duration::from_millis(10));
            assert_eq!(tx_nums(&buffer.drain_non_blocking(0)), vec![0, 1]);
            assert_eq!(pusher.join().unwrap(), Ok(()));
        });

        assert_eq!(tx_nums(&buffer.drain_non_blocking(2)), vec![2]);
    }

    #[test]
    fn test_closed_after_draining() {
        let buffer = buffer(2, 2);
        buffer.push(task(0)).unwrap();
        buffer.close();

        assert_eq!(buffer.push(task(1)), Err(QueueError::Closed));
        let drained = buffer.drain_non_blocking(0);
        assert_eq!(tx_nums(&drained), vec![0]);
        assert!(drained.closed);
    }

    #[test]
    fn test_closed_with_gap_reports_closure() {
        let buffer = buffer(2, 2);
        buffer.push(task(2)).unwrap();
        buffer.close();

        let drained = buffer.drain_non_blocking(0);
        assert!(drained.tasks.is_empty());
        assert!(drained.closed);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_cancel_unblocks_push() {
        let cancel = CancellationToken::new();
        let buffer = ReorderBuffer::new(1, 0, cancel.clone());
        buffer.push(task(1)).unwrap();

        thread::scope(|s| {
            let pusher = s.spawn(|| buffer.push(task(2)));
            thread::sleep(Duration::from_millis(10));
            cancel.cancel();
            assert_eq!(pusher.join().unwrap(), Err(QueueError::Cancelled));
        });
    }
}
