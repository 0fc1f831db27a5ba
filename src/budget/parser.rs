//! Rate-limit accounting parsed from GraphQL responses.
//!
//! GitHub reports consumption in two places:
//!
//! - **Body**: `{"rateLimit": {"limit": N, "cost": N, "remaining": N, "resetAt": "...", "nodeCount": N}}`
//!   when the query selects the `rateLimit` field.
//! - **Headers**: `x-ratelimit-remaining` / `x-ratelimit-reset` (epoch seconds).
//!
//! The parser prefers the body, falls back to headers, and finally to counting
//! the nodes that were actually returned.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tracker::Cost;

/// Server-side view of the rate limit for one response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub cost: Option<u64>,
    #[serde(default)]
    pub remaining: Option<u64>,
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_count: Option<u64>,
}

impl RateLimitSnapshot {
    /// Extract the `rateLimit` object from a response's `data` field.
    pub fn from_data(data: &Value) -> Option<Self> {
        let raw = data.get("rateLimit")?;
        if raw.is_null() {
            return None;
        }
        serde_json::from_value(raw.clone()).ok()
    }

    /// Build a snapshot from the REST-style rate-limit headers.
    pub fn from_headers(remaining: Option<&str>, reset_epoch: Option<&str>) -> Option<Self> {
        let remaining = remaining.and_then(|v| v.trim().parse::<u64>().ok());
        let reset_at = reset_epoch
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        if remaining.is_none() && reset_at.is_none() {
            return None;
        }

        Some(Self {
            remaining,
            reset_at,
            ..Self::default()
        })
    }

    /// Whether the snapshot carries an authoritative node count.
    pub fn has_node_count(&self) -> bool {
        self.node_count.is_some()
    }
}

/// Cost attributed to a single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCost {
    pub cost: Cost,
    /// Whether the node count came from the server rather than from counting.
    pub is_actual: bool,
}

/// Determine the actual cost of one request.
///
/// Uses the server's `nodeCount` when reported; otherwise the number of
/// nodes observed in the page.
pub fn extract_or_count(snapshot: Option<&RateLimitSnapshot>, observed_nodes: u64) -> ParsedCost {
    match snapshot.and_then(|s| s.node_count) {
        Some(nodes) => ParsedCost {
            cost: Cost::single_request(nodes),
            is_actual: true,
        },
        None => ParsedCost {
            cost: Cost::single_request(observed_nodes),
            is_actual: false,
        },
    }
}
