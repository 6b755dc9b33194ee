//! Deterministic parallel execution engine for ordered block streams.
//!
//! See [`speculative`] for the pipeline and [`config`] for its settings.

pub mod config;
pub mod speculative;

pub use config::{EngineConfig, ExecutionMode, IndexConfig};
pub use speculative::{Pipeline, PipelineError, RunSummary};
