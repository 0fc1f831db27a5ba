//! Page-size configuration for the traversal planner.

use serde::{Deserialize, Serialize};

/// Largest `first:` argument the GitHub GraphQL API accepts.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Page sizes and fairness bounds used by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Page size for the outer list (members).
    pub outer_page_size: u32,

    /// Preferred page size for inner lists (repositories).
    pub inner_page_size: u32,

    /// Smallest page the planner will shrink to before giving up on the window.
    pub min_page_size: u32,

    /// Consecutive inner pages taken from one outer entity before rotating to
    /// the next (0 = never rotate).
    pub max_consecutive_pages: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            outer_page_size: MAX_PAGE_SIZE,
            inner_page_size: MAX_PAGE_SIZE,
            min_page_size: 1,
            max_consecutive_pages: 5,
        }
    }
}

impl PlannerConfig {
    /// Create a new planner config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outer page size (clamped to 1..=100).
    pub fn with_outer_page_size(mut self, size: u32) -> Self {
        self.outer_page_size = clamp_page_size(size);
        self
    }

    /// Set the inner page size (clamped to 1..=100).
    pub fn with_inner_page_size(mut self, size: u32) -> Self {
        self.inner_page_size = clamp_page_size(size);
        self
    }

    /// Set the minimum page size (clamped to 1..=100).
    pub fn with_min_page_size(mut self, size: u32) -> Self {
        self.min_page_size = clamp_page_size(size);
        self
    }

    /// Set the fairness rotation bound.
    pub fn with_max_consecutive_pages(mut self, pages: u32) -> Self {
        self.max_consecutive_pages = pages;
        self
    }

    /// Copy with every page size forced into the API's accepted range and the
    /// minimum no larger than either preferred size.
    pub fn normalized(&self) -> Self {
        let outer_page_size = clamp_page_size(self.outer_page_size);
        let inner_page_size = clamp_page_size(self.inner_page_size);
        let min_page_size = clamp_page_size(self.min_page_size)
            .min(outer_page_size)
            .min(inner_page_size);
        Self {
            outer_page_size,
            inner_page_size,
            min_page_size,
            max_consecutive_pages: self.max_consecutive_pages,
        }
    }
}

fn clamp_page_size(size: u32) -> u32 {
    size.clamp(1, MAX_PAGE_SIZE)
}
