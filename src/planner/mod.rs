//! Fetch planning.
//!
//! Each iteration the engine asks a [`PlanningPolicy`] for the next
//! [`FetchPlan`], given the current traversal state and a read-only copy of
//! the budget window. Plans are derived fresh every time and never persisted.

mod config;
mod policy;

pub use config::{PlannerConfig, MAX_PAGE_SIZE};
pub use policy::{FetchPlan, LevelWeights, PerEntityPolicy, PlanOutcome, PlanningPolicy};
