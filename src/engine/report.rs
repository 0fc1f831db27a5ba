//! Engine states and run reports.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::budget::Cost;
use crate::cursor::{FetchTarget, NodeId};
use crate::entity::EntityKind;
use crate::error::{FatalKind, FetchError};

/// Why a run stopped without finishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// No plan fits the current window; resume at or after `retry_after`.
    BudgetExhausted { retry_after: DateTime<Utc> },
    /// The caller asked the engine to stop.
    Cancelled,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::BudgetExhausted { retry_after } => {
                write!(f, "budget exhausted until {}", retry_after.to_rfc3339())
            }
            PauseReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// What ended a failed run.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    Fetch(FetchError),
    Checkpoint(String),
    Sink(String),
    /// The planner stopped while work remained.
    Planner(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Fetch(error) => write!(f, "{error}"),
            FailureCause::Checkpoint(message) => write!(f, "checkpoint error: {message}"),
            FailureCause::Sink(message) => write!(f, "sink error: {message}"),
            FailureCause::Planner(message) => write!(f, "planner error: {message}"),
        }
    }
}

/// Context for a failed run.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureInfo {
    pub cause: FailureCause,
    /// Attempts made for the failing fetch (0 when no fetch was involved).
    pub attempts: u32,
    /// Cursor the failing fetch was advancing.
    pub target: Option<FetchTarget>,
}

impl FailureInfo {
    pub fn new(cause: FailureCause) -> Self {
        Self {
            cause,
            attempts: 0,
            target: None,
        }
    }

    /// The outer entity whose inner list GitHub no longer knows about.
    ///
    /// Set when an inner fetch failed with `not_found`, which happens when a
    /// member leaves or is deleted after discovery.
    pub fn vanished_parent(&self) -> Option<&NodeId> {
        match (&self.cause, &self.target) {
            (
                FailureCause::Fetch(FetchError::Fatal {
                    kind: FatalKind::NotFound,
                    ..
                }),
                Some(FetchTarget::Inner { parent, .. }),
            ) => Some(parent),
            _ => None,
        }
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if self.attempts > 0 {
            write!(f, " after {} attempt(s)", self.attempts)?;
        }
        Ok(())
    }
}

/// Traversal engine lifecycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EngineState {
    #[default]
    Idle,
    Running,
    Paused(PauseReason),
    Completed,
    Failed(FailureInfo),
}

impl EngineState {
    /// No further run can make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Completed | EngineState::Failed(_))
    }
}

/// Coarse outcome of a run, as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Not a failure: the traversal can be resumed.
    Paused,
    Failed,
}

impl RunStatus {
    pub fn as_label(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Last cursor successfully recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastCursor {
    pub target: FetchTarget,
    pub level: String,
    pub end_cursor: Option<String>,
}

/// Summary of one call to `TraversalEngine::run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub traversal_id: String,
    pub state: EngineState,
    /// Successful fetches.
    pub fetches: u64,
    /// Retries after transient errors.
    pub retries: u64,
    /// Backoff delays applied, in order.
    pub backoff_delays: Vec<Duration>,
    /// Actual cost committed to the budget.
    pub consumed: Cost,
    pub emitted: BTreeMap<EntityKind, u64>,
    pub last_cursor: Option<LastCursor>,
    pub outer_completed: usize,
    pub outer_pending: usize,
}

impl RunReport {
    pub fn new(traversal_id: impl Into<String>) -> Self {
        Self {
            traversal_id: traversal_id.into(),
            state: EngineState::Idle,
            fetches: 0,
            retries: 0,
            backoff_delays: Vec::new(),
            consumed: Cost::ZERO,
            emitted: BTreeMap::new(),
            last_cursor: None,
            outer_completed: 0,
            outer_pending: 0,
        }
    }

    pub fn status(&self) -> RunStatus {
        match &self.state {
            EngineState::Completed => RunStatus::Completed,
            EngineState::Failed(_) => RunStatus::Failed,
            EngineState::Idle | EngineState::Running | EngineState::Paused(_) => RunStatus::Paused,
        }
    }

    pub fn emitted_total(&self) -> u64 {
        self.emitted.values().sum()
    }

    pub fn emitted_of(&self, kind: EntityKind) -> u64 {
        self.emitted.get(&kind).copied().unwrap_or(0)
    }

    pub(crate) fn record_emission(&mut self, kind: EntityKind) {
        *self.emitted.entry(kind).or_default() += 1;
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} fetches, {} retries, {}, {} entities, {} complete / {} pending)",
            self.traversal_id,
            self.status(),
            self.fetches,
            self.retries,
            self.consumed,
            self.emitted_total(),
            self.outer_completed,
            self.outer_pending
        )?;
        match &self.state {
            EngineState::Paused(reason) => write!(f, ": {reason}"),
            EngineState::Failed(info) => write!(f, ": {info}"),
            _ => Ok(()),
        }
    }
}
