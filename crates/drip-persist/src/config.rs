//! Persister configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a persister run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
    /// A push that brings the flush buffer to this many events writes them
    /// before returning.
    pub max_batch_size: usize,
    /// How long one read of the change feed waits for an event (in
    /// milliseconds). Also the length of one idle cycle for noop detection.
    pub max_await_ms: u64,
}

impl PersisterConfig {
    pub fn max_await(&self) -> Duration {
        Duration::from_millis(self.max_await_ms)
    }
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_await_ms: 1000,
        }
    }
}

/// Builder for persister configuration.
pub struct PersisterConfigBuilder {
    config: PersisterConfig,
}

impl PersisterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PersisterConfig::default(),
        }
    }

    /// Values below one are raised to one.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size.max(1);
        self
    }

    pub fn max_await(mut self, ms: u64) -> Self {
        self.config.max_await_ms = ms;
        self
    }

    pub fn build(self) -> PersisterConfig {
        self.config
    }
}

impl Default for PersisterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
