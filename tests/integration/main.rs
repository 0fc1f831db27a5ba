//! Integration tests for whole traversals driven through the public API.
//!
//! Every scenario runs the real engine, planner and budget tracker against
//! an in-memory organization, so nothing here touches the network.

mod budget_windows;
mod failures;
mod resume;
mod traversal;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::watch;

use ghwalk::budget::{BudgetConfig, BudgetTracker, ManualClock};
use ghwalk::checkpoint::CheckpointStore;
use ghwalk::engine::{EngineConfig, RetryPolicy, TraversalEngine};
use ghwalk::entity::EntityKind;
use ghwalk::planner::{PerEntityPolicy, PlannerConfig};
use ghwalk::testing::{CollectingSink, FixtureFetcher, FixtureTree};

pub const ORG: &str = "acme";

/// Members A (no repositories), B (three) and C (one).
pub fn abc_tree() -> FixtureTree {
    FixtureTree::new()
        .member("A", "alice", &[])
        .member("B", "bob", &["R1", "R2", "R3"])
        .member("C", "carol", &["R4"])
}

pub fn start_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
}

/// Page size 2 at both levels, fast retries.
pub fn engine(
    fetcher: Arc<FixtureFetcher>,
    store: Arc<dyn CheckpointStore>,
    sink: CollectingSink,
) -> TraversalEngine {
    TraversalEngine::new(ORG, fetcher, store, Box::new(sink))
        .with_policy(PerEntityPolicy::new(
            PlannerConfig::new()
                .with_outer_page_size(2)
                .with_inner_page_size(2),
        ))
        .with_config(EngineConfig::new().with_retry(fast_retry()))
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(4)
        .with_initial_backoff(Duration::from_millis(1))
        .with_max_backoff(Duration::from_millis(8))
}

/// A tracker with `node_cap` nodes per hour on a manual clock.
pub fn tight_budget(node_cap: u64, clock: &ManualClock) -> BudgetTracker {
    BudgetTracker::with_clock(
        BudgetConfig::new().with_node_cap(node_cap),
        Arc::new(clock.clone()),
    )
}

pub fn never_cancel() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

/// Emitted ids of `kind`, asserting none was emitted twice.
pub fn unique_ids(sink: &CollectingSink, kind: EntityKind) -> BTreeSet<String> {
    let ids = sink.ids_of(kind);
    let unique: BTreeSet<String> = ids.iter().cloned().collect();
    assert_eq!(unique.len(), ids.len(), "duplicate {kind} emitted: {ids:?}");
    unique
}

pub fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
