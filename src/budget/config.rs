//! Node/request budget configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default hourly node allowance.
pub const DEFAULT_NODE_CAP: u64 = 500_000;

/// Default hourly request allowance.
pub const DEFAULT_REQUEST_CAP: u64 = 5_000;

/// Default rate-limit window length (one hour).
pub const DEFAULT_WINDOW_SECS: u64 = 3_600;

/// Configuration for a single credential's rate-limit budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum graph nodes per window.
    pub node_cap: u64,

    /// Maximum requests per window.
    pub request_cap: u64,

    /// Length of the rate-limit window in seconds.
    /// GitHub resets its allowance hourly; only tests should change this.
    pub window_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            node_cap: DEFAULT_NODE_CAP,
            request_cap: DEFAULT_REQUEST_CAP,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

impl BudgetConfig {
    /// Create a new budget config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hourly node cap.
    pub fn with_node_cap(mut self, nodes: u64) -> Self {
        self.node_cap = nodes;
        self
    }

    /// Set the hourly request cap.
    pub fn with_request_cap(mut self, requests: u64) -> Self {
        self.request_cap = requests;
        self
    }

    /// Set the window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_secs = window.as_secs().max(1);
        self
    }

    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    /// Window length as a chrono duration, for wall-clock arithmetic.
    pub fn window_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.max(1) as i64)
    }
}
