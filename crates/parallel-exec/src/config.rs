//! Engine configuration.

use alloy_primitives::Address;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{thread, time::Duration};

/// Default capacity of the task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Reorder buffer slots (per channel and per heap) reserved for each worker.
pub const RESULTS_PER_WORKER: usize = 16;

/// Default number of committed sequence numbers per checkpoint step.
pub const DEFAULT_STEP_SIZE: u64 = 156_250;

/// Default interval at which blocked components re-check for cancellation.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// How tasks are scheduled and committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Replay of finalized history: no dependency tracking, reads resolve as of each task
    /// and state writes are not re-applied.
    #[default]
    #[display("historical")]
    Historical,
    /// Speculative execution at the chain tip: same-sender tasks are serialized through the
    /// dependency tracker and stale reads are re-executed at commit.
    #[display("live")]
    Live,
}

/// Secondary index settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index only the logs of the deposit contract.
    pub prune_non_essentials: bool,
    pub deposit_contract: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum number of new tasks waiting for a worker. Retried tasks do not count.
    pub queue_capacity: usize,
    /// Reorder buffer arrival channel capacity (`R`).
    pub result_channel_capacity: usize,
    /// Reorder buffer heap capacity (`H`).
    pub result_heap_capacity: usize,
    /// Committed sequence numbers per checkpoint; must match the store.
    pub step_size: u64,
    pub mode: ExecutionMode,
    pub poll_interval_ms: u64,
    pub indexing: IndexConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_workers(default_workers())
    }
}

impl EngineConfig {
    /// Default configuration with buffer capacities scaled to `workers`.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            result_channel_capacity: workers * RESULTS_PER_WORKER,
            result_heap_capacity: workers * RESULTS_PER_WORKER,
            step_size: DEFAULT_STEP_SIZE,
            mode: ExecutionMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            indexing: IndexConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_step_size(mut self, step_size: u64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_result_capacity(mut self, channel: usize, heap: usize) -> Self {
        self.result_channel_capacity = channel;
        self.result_heap_capacity = heap;
        self
    }

    /// How far past the watermark tasks may be dispatched: the reorder buffer's total
    /// capacity, so every speculative result has a slot.
    pub fn speculation_window(&self) -> u64 {
        (self.result_channel_capacity + self.result_heap_capacity) as u64
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        for (name, value) in [
            ("queue_capacity", self.queue_capacity),
            ("result_channel_capacity", self.result_channel_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity { name });
            }
        }
        if self.step_size == 0 {
            return Err(ConfigError::ZeroStepSize);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get().saturating_sub(1).max(1))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("{name} must be greater than zero")]
    ZeroCapacity { name: &'static str },
    #[error("checkpoint step size must be greater than zero")]
    ZeroStepSize,
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("step size {config} does not match the store's step size {store}")]
    StepSizeMismatch { config: u64, store: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_defaults_scale_with_workers() {
        let config = EngineConfig::with_workers(4);
        assert_eq!(config.result_channel_capacity, 64);
        assert_eq!(config.result_heap_capacity, 64);
        assert_eq!(config.speculation_window(), 128);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.step_size, DEFAULT_STEP_SIZE);
        assert_eq!(config.mode, ExecutionMode::Historical);
        assert!(config.validate().is_ok());

        assert!(EngineConfig::default().workers >= 1);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert_eq!(EngineConfig::with_workers(0).validate(), Err(ConfigError::NoWorkers));
        assert_eq!(
            EngineConfig::with_workers(2).with_result_capacity(0, 8).validate(),
            Err(ConfigError::ZeroCapacity {
                name: "result_channel_capacity"
            })
        );
        assert_eq!(
            EngineConfig::with_workers(2).with_step_size(0).validate(),
            Err(ConfigError::ZeroStepSize)
        );
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "workers": 3,
                "mode": "live",
                "step_size": 4,
                "indexing": {
                    "prune_non_essentials": true,
                    "deposit_contract": "0x00000000219ab540356cbb839cbe05303d7705fa"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.mode, ExecutionMode::Live);
        assert_eq!(config.step_size, 4);
        assert_eq!(
            config.indexing.deposit_contract,
            Some(address!("0x00000000219ab540356cbb839cbe05303d7705fa"))
        );
        // Unspecified fields keep their defaults.
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }
}
