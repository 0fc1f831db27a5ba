//! Cost-minimizing fetch planning.
//!
//! The default [`PerEntityPolicy`] never asks for nested lists alongside new
//! outer nodes. Outer pages are fetched bare, and each outer entity's inner
//! lists are then paged with a query scoped to that single node id. A turn of
//! an inner cursor therefore costs `1 + child_page_size * nodes_per_child`
//! nodes instead of `parents * children`, at the price of one extra request
//! per outer entity.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::PlannerConfig;
use crate::budget::{BudgetWindow, Cost};
use crate::cursor::{CursorFrame, CursorPath, FetchTarget, TraversalState};

/// One bounded fetch, derived fresh every iteration and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPlan {
    pub target: FetchTarget,
    /// Frames advanced by this fetch, outermost first. Outer levels pinned by
    /// a node id are not part of the path.
    pub target_cursor_path: CursorPath,
    /// Requested page size for each frame in `target_cursor_path`.
    pub page_size_per_level: Vec<u32>,
    pub estimated_cost: Cost,
    /// Payload of the outer entity an inner fetch is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_payload: Option<Value>,
}

impl FetchPlan {
    fn single(target: FetchTarget, frame: &CursorFrame, page_size: u32, cost: Cost) -> Self {
        Self {
            target,
            target_cursor_path: CursorPath::new(vec![frame.clone()]),
            page_size_per_level: vec![page_size],
            estimated_cost: cost,
            parent_payload: None,
        }
    }

    fn with_parent_payload(mut self, payload: Value) -> Self {
        self.parent_payload = Some(payload);
        self
    }

    /// Level whose cursor this fetch advances.
    pub fn level(&self) -> &str {
        self.target_cursor_path
            .last()
            .map(|frame| frame.level_name.as_str())
            .unwrap_or_default()
    }

    /// `after:` cursor for the advanced level.
    pub fn after(&self) -> Option<&str> {
        self.target_cursor_path.last().and_then(CursorFrame::next_cursor)
    }

    /// `first:` argument for the advanced level.
    pub fn page_size(&self) -> u32 {
        self.page_size_per_level.last().copied().unwrap_or(0)
    }
}

/// Nodes billed for each child returned at an inner level.
///
/// A child that carries its own nested selection (a repository with its
/// collaborator edge, say) is billed for both. Levels not listed weigh 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelWeights {
    per_child: BTreeMap<String, u64>,
}

impl LevelWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: impl Into<String>, nodes_per_child: u64) -> Self {
        self.per_child.insert(level.into(), nodes_per_child.max(1));
        self
    }

    pub fn nodes_per_child(&self, level: &str) -> u64 {
        self.per_child.get(level).copied().unwrap_or(1)
    }
}

/// Planner decision for the next iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Fetch(FetchPlan),
    /// Not even a minimum-size page fits the remaining window.
    Exhausted {
        /// Cheapest fetch that would have made progress.
        needed: Cost,
        retry_after: DateTime<Utc>,
    },
    /// Nothing left to fetch.
    Finished,
}

/// Swappable planning strategy.
///
/// The best trade between node and request budget depends on the shape of the
/// organization (wide-shallow vs narrow-deep), so the engine only talks to
/// this trait.
pub trait PlanningPolicy: Send + Sync + fmt::Debug {
    fn plan(&self, state: &TraversalState, budget: &BudgetWindow, weights: &LevelWeights) -> PlanOutcome;

    /// Consecutive inner pages allowed from one outer entity before the engine
    /// rotates it to the back of the queue. `None` disables rotation.
    fn rotation_bound(&self) -> Option<u32> {
        None
    }
}

/// Default policy: bare outer pages, then per-entity scoped inner pages in
/// FIFO order.
#[derive(Debug, Clone, Default)]
pub struct PerEntityPolicy {
    config: PlannerConfig,
}

impl PerEntityPolicy {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Estimated cost of a scoped inner page: the parent node plus its children.
    pub fn inner_cost(page_size: u32, nodes_per_child: u64) -> Cost {
        Cost::single_request(1 + u64::from(page_size).saturating_mul(nodes_per_child))
    }

    /// Estimated cost of a bare outer page.
    pub fn outer_cost(page_size: u32) -> Cost {
        Cost::single_request(u64::from(page_size))
    }

    /// Largest page size in `[min_page_size, preferred]` whose cost fits.
    fn fit_page_size(
        &self,
        preferred: u32,
        cost: impl Fn(u32) -> Cost,
        nodes_per_item: u64,
        budget: &BudgetWindow,
    ) -> Option<u32> {
        if budget.can_afford(cost(preferred)) {
            return Some(preferred);
        }
        let fixed = cost(0).nodes;
        let available = budget.nodes_remaining().checked_sub(fixed)? / nodes_per_item.max(1);
        let shrunk = u32::try_from(available).unwrap_or(u32::MAX).min(preferred);
        if shrunk >= self.config.min_page_size && budget.can_afford(cost(shrunk)) {
            Some(shrunk)
        } else {
            None
        }
    }

    fn exhausted(&self, cost: Cost, budget: &BudgetWindow) -> PlanOutcome {
        PlanOutcome::Exhausted {
            needed: cost,
            retry_after: budget.resets_at(),
        }
    }
}

impl PlanningPolicy for PerEntityPolicy {
    fn plan(&self, state: &TraversalState, budget: &BudgetWindow, weights: &LevelWeights) -> PlanOutcome {
        // Known entities first; a new outer page only once the queue drains.
        if let Some(entry) = state.head() {
            if let Some(frame) = entry.open_frame() {
                let weight = weights.nodes_per_child(&frame.level_name);
                let cost = |size| Self::inner_cost(size, weight);
                let preferred = self.config.inner_page_size;
                return match self.fit_page_size(preferred, cost, weight, budget) {
                    Some(size) => PlanOutcome::Fetch(
                        FetchPlan::single(
                            FetchTarget::Inner {
                                parent: entry.id.clone(),
                                level: frame.level_name.clone(),
                            },
                            frame,
                            size,
                            cost(size),
                        )
                        .with_parent_payload(entry.payload.clone()),
                    ),
                    None => self.exhausted(cost(self.config.min_page_size), budget),
                };
            }
        }

        if state.is_outer_exhausted() {
            return PlanOutcome::Finished;
        }

        let preferred = self.config.outer_page_size;
        match self.fit_page_size(preferred, Self::outer_cost, 1, budget) {
            Some(size) => PlanOutcome::Fetch(FetchPlan::single(
                FetchTarget::Outer,
                state.outer(),
                size,
                Self::outer_cost(size),
            )),
            None => self.exhausted(Self::outer_cost(self.config.min_page_size), budget),
        }
    }

    fn rotation_bound(&self) -> Option<u32> {
        match self.config.max_consecutive_pages {
            0 => None,
            pages => Some(pages),
        }
    }
}
