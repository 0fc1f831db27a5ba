use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// Default number of successful fetches between checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u32 = 10;

/// Engine-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Checkpoint after this many successful fetches (0 = only on pause,
    /// failure and completion).
    pub checkpoint_interval: u32,

    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint_interval(mut self, fetches: u32) -> Self {
        self.checkpoint_interval = fetches;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
