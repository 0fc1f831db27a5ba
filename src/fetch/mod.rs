//! Page fetching.
//!
//! A [`PageFetcher`] turns one [`FetchPlan`] into one GraphQL request and
//! returns the resulting [`ResultPage`]. Execution of the request itself is
//! delegated to a [`GraphqlTransport`].

mod github;
mod transport;

use async_trait::async_trait;

use crate::budget::{Cost, RateLimitSnapshot};
use crate::cursor::PageInfo;
use crate::entity::{EntityKind, FetchedEntity};
use crate::error::{FatalKind, FetchError};
use crate::planner::FetchPlan;

pub use github::{
    ChildEdge, GithubPageFetcher, InnerLevel, MEMBERS_LEVEL, MEMBERS_QUERY, REPOSITORIES_LEVEL,
    REPOSITORIES_QUERY, REPOSITORY_NODES_PER_CHILD,
};
pub use transport::{
    classify_status, interpret_body, normalize_endpoint, GraphqlResponse, GraphqlTransport,
    HttpTransport, DEFAULT_ENDPOINT,
};

/// One page of results, merged into the traversal state and then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    /// Entities in API order.
    pub entities: Vec<FetchedEntity>,
    /// Updated page info for each frame of the plan's cursor path.
    pub page_info_per_level: Vec<PageInfo>,
    /// Authoritative cost of the request.
    pub actual_cost: Cost,
    /// Server-reported rate limit, when the response carried one.
    pub rate_limit: Option<RateLimitSnapshot>,
}

impl ResultPage {
    pub fn new(entities: Vec<FetchedEntity>, page_info: PageInfo, actual_cost: Cost) -> Self {
        Self {
            entities,
            page_info_per_level: vec![page_info],
            actual_cost,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimitSnapshot>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Page info of the innermost (advanced) level.
    pub fn page_info(&self) -> Option<&PageInfo> {
        self.page_info_per_level.last()
    }
}

/// Issues one bounded query per plan.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Name of the outer level (e.g. `members`).
    fn outer_level(&self) -> &str;

    /// Kind of the entities listed at the outer level.
    fn outer_kind(&self) -> EntityKind {
        EntityKind::Member
    }

    /// Names of the inner levels paged under each outer entity, in fetch order.
    fn inner_levels(&self) -> Vec<String>;

    /// Nodes the API bills for each child returned at `level`.
    fn nodes_per_child(&self, _level: &str) -> u64 {
        1
    }

    async fn fetch(&self, plan: &FetchPlan) -> Result<ResultPage, FetchError>;
}

/// Reject a page that claims more results but gives no cursor to reach them.
pub fn ensure_well_formed(page_info: &PageInfo, level: &str) -> Result<(), FetchError> {
    if page_info.is_well_formed() {
        Ok(())
    } else {
        Err(FetchError::fatal(
            FatalKind::MalformedResponse,
            format!("{level} page reports has_next_page without end_cursor"),
        ))
    }
}
