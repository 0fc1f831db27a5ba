//! Budget-aware, resumable traversal of nested paginated GitHub GraphQL
//! hierarchies.
//!
//! A [`TraversalEngine`] walks an organization's members and, for each
//! member, that member's repositories. Every request is planned to fit the
//! hourly node/request allowance, every cursor is checkpointed so a run can
//! stop at any moment and resume later without refetching completed work.

pub mod budget;
pub mod checkpoint;
pub mod cursor;
pub mod engine;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod planner;
pub mod settings;
pub mod testing;

pub use budget::{
    Admission, BudgetConfig, BudgetTracker, BudgetWindow, Cost, Reservation, SharedBudget,
};
pub use checkpoint::{CheckpointStore, CorruptCheckpointPolicy, FileCheckpointStore};
pub use cursor::{CursorFrame, CursorPath, FetchTarget, NodeId, PageInfo, TraversalState};
pub use engine::{
    EngineConfig, EngineState, EntitySink, JsonLinesSink, PauseReason, RetryPolicy, RunReport,
    RunStatus, TraversalEngine,
};
pub use entity::{EmittedEntity, EntityKey, EntityKind, FetchedEntity};
pub use error::{CheckpointError, FatalKind, FetchError, SettingsError, SinkError};
pub use fetch::{GithubPageFetcher, HttpTransport, PageFetcher, ResultPage};
pub use planner::{FetchPlan, PerEntityPolicy, PlanOutcome, PlannerConfig, PlanningPolicy};
pub use settings::{CheckpointSettings, OrganizationSettings, Settings};
