//! Speculative parallel execution of an ordered task stream.
//!
//! Blocks are flattened into a dense sequence of tasks (a start sentinel, one task per
//! transaction, an end sentinel). Tasks execute speculatively on a worker pool and are
//! committed strictly in sequence, so the committed state is identical to a sequential run.
//!
//! 1. The producer numbers tasks and feeds the retry queue
//! 2. Workers execute tasks against a state view and push results
//! 3. The reorder buffer hands back the contiguous prefix above the watermark
//! 4. The reducer validates, applies and checkpoints each result in order
//!
//! # Architecture
//!
//! - [`types`]: Tasks, block context, accounts, read/write sets
//! - [`state`]: Store traits and the per-task state views
//! - [`memory`]: In-process versioned store
//! - [`queue`]: Bounded task queue with a retry lane and dispatch window
//! - [`tracker`]: Same-sender dependency gating for live execution
//! - [`results`]: Bounded reorder buffer
//! - [`worker`]: Payload executor trait and the worker loop
//! - [`reducer`]: In-order commit loop
//! - [`producer`]: Block range to task stream
//! - [`pipeline`]: Wires everything into one run

pub mod memory;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod reducer;
pub mod results;
pub mod state;
pub mod tracker;
pub mod types;
pub mod worker;


// Re-export commonly used types
pub use memory::{Checkpoint, InMemoryStore};
pub use pipeline::{Pipeline, PipelineError, RunSummary};
pub use queue::{QueueError, RetryQueue};
pub use reducer::{Consumer, ConsumerError, apply_indices, apply_state};
pub use results::ReorderBuffer;
pub use state::{HistoryReader, StateReader, StateView, StoreError, VersionedStateStore};
pub use tracker::DependencyTracker;
pub use types::{
    Account, BlockContext, BlockHeader, BlockInput, BlockNum, Domain, Incarnation, IndexTable,
    Receipt, Rules, Task, TaskError, TaskKind, TxInput, TxNum,
};
pub use worker::{ExecOutcome, TxExecutor};
