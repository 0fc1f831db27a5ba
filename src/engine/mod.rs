//! Traversal engine.
//!
//! The engine loops over plan → reserve → fetch → commit → merge until the
//! tree is fully enumerated, the window's budget runs out, the caller cancels,
//! or a fetch fails for good.
//!
//! # State machine
//!
//! ```text
//! Idle -> Running -> Paused(BudgetExhausted | Cancelled)
//!                 -> Completed
//!                 -> Failed
//! Paused -> Running (next call to `run`)
//! ```
//!
//! A pause is not a failure. Budget waits are never slept through: the engine
//! checkpoints, reports when the window resets and hands control back.

mod config;
mod report;
mod retry;
mod sink;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::budget::{Admission, BudgetConfig, BudgetTracker, BudgetWindow, SharedBudget};
use crate::checkpoint::{resume_state, CheckpointStore, CorruptCheckpointPolicy};
use crate::cursor::{FetchTarget, NodeId, OuterEntry, TraversalState};
use crate::entity::EmittedEntity;
use crate::error::{CheckpointResult, FatalKind, FetchError, SinkError};
use crate::fetch::{ensure_well_formed, PageFetcher, ResultPage};
use crate::planner::{FetchPlan, LevelWeights, PerEntityPolicy, PlanOutcome, PlanningPolicy};

pub use config::{EngineConfig, DEFAULT_CHECKPOINT_INTERVAL};
pub use report::{
    EngineState, FailureCause, FailureInfo, LastCursor, PauseReason, RunReport, RunStatus,
};
pub use retry::{Backoff, RetryPolicy, DEFAULT_MULTIPLIER, MIN_INITIAL_BACKOFF};
pub use sink::{ChannelSink, EntitySink, JsonLinesSink};

enum Interrupt {
    Cancelled,
    Failed(FailureInfo),
}

/// Drives one traversal.
///
/// Owns its traversal state exclusively. The budget belongs to the
/// credential: engines for organizations read through one token share a
/// [`SharedBudget`].
pub struct TraversalEngine {
    traversal_id: String,
    config: EngineConfig,
    budget: SharedBudget,
    state: TraversalState,
    fetcher: Arc<dyn PageFetcher>,
    policy: Box<dyn PlanningPolicy>,
    weights: LevelWeights,
    store: Arc<dyn CheckpointStore>,
    sink: Box<dyn EntitySink>,
    status: EngineState,
    fetches_since_checkpoint: u32,
}

impl fmt::Debug for TraversalEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraversalEngine")
            .field("traversal_id", &self.traversal_id)
            .field("status", &self.status)
            .field("policy", &self.policy)
            .field("completed", &self.state.completed_count())
            .field("pending", &self.state.pending_count())
            .finish()
    }
}

impl TraversalEngine {
    /// Engine with empty state, default budget, default policy and config.
    pub fn new(
        traversal_id: impl Into<String>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn CheckpointStore>,
        sink: Box<dyn EntitySink>,
    ) -> Self {
        let inner_levels = fetcher.inner_levels();
        let weights = inner_levels
            .iter()
            .fold(LevelWeights::new(), |weights, level| {
                weights.with_level(level.as_str(), fetcher.nodes_per_child(level))
            });
        let state = TraversalState::new(fetcher.outer_level(), inner_levels);
        Self {
            traversal_id: traversal_id.into(),
            config: EngineConfig::default(),
            budget: BudgetTracker::new(BudgetConfig::default()).into(),
            state,
            fetcher,
            policy: Box::new(PerEntityPolicy::default()),
            weights,
            store,
            sink,
            status: EngineState::Idle,
            fetches_since_checkpoint: 0,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Spend from `budget`: a tracker of its own, or a handle shared with
    /// other engines on the same credential.
    pub fn with_budget(mut self, budget: impl Into<SharedBudget>) -> Self {
        self.budget = budget.into();
        self
    }

    pub fn with_policy(mut self, policy: impl PlanningPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Continue from a previously saved state.
    pub fn with_state(mut self, state: TraversalState) -> Self {
        if state.outer().level_name != self.fetcher.outer_level()
            || state.inner_levels() != self.fetcher.inner_levels().as_slice()
        {
            warn!(
                traversal_id = %self.traversal_id,
                "restored state levels differ from the fetcher's levels"
            );
        }
        self.state = state;
        self.status = EngineState::Idle;
        self
    }

    /// Load this traversal's checkpoint from the store, if there is one.
    pub fn resume_from_store(self, policy: CorruptCheckpointPolicy) -> CheckpointResult<Self> {
        match resume_state(self.store.as_ref(), &self.traversal_id, policy)? {
            Some(state) => Ok(self.with_state(state)),
            None => Ok(self),
        }
    }

    pub fn traversal_id(&self) -> &str {
        &self.traversal_id
    }

    pub fn status(&self) -> &EngineState {
        &self.status
    }

    pub fn state(&self) -> &TraversalState {
        &self.state
    }

    pub fn budget(&self) -> &SharedBudget {
        &self.budget
    }

    /// Drop a queued outer entity and checkpoint, so a failure on it does not
    /// repeat on every resume.
    ///
    /// A failed engine becomes idle again. Returns `false` when the entity was
    /// not queued.
    pub fn skip_entity(&mut self, id: &NodeId) -> CheckpointResult<bool> {
        if self.state.abandon(id).is_none() {
            return Ok(false);
        }
        warn!(traversal_id = %self.traversal_id, entity = %id, "dropped entity from the work queue");
        if matches!(self.status, EngineState::Failed(_)) {
            self.status = EngineState::Idle;
        }
        self.checkpoint()?;
        Ok(true)
    }

    /// Current budget window, after applying any pending reset.
    pub fn remaining_budget(&self) -> BudgetWindow {
        self.budget.remaining()
    }

    /// Run until completion, pause or failure.
    ///
    /// Calling `run` again after a pause resumes from the in-memory state.
    /// After completion or failure it returns immediately.
    pub async fn run(&mut self, mut cancel: watch::Receiver<bool>) -> RunReport {
        let mut report = RunReport::new(self.traversal_id.clone());
        if self.status.is_terminal() {
            debug!(traversal_id = %self.traversal_id, "traversal already finished");
            return self.finish_report(report);
        }

        self.status = EngineState::Running;
        info!(
            traversal_id = %self.traversal_id,
            completed = self.state.completed_count(),
            pending = self.state.pending_count(),
            "traversal running"
        );

        let outcome = self.drive(&mut cancel, &mut report).await;
        self.status = self.settle(outcome).await;
        self.finish_report(report)
    }

    async fn drive(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
        report: &mut RunReport,
    ) -> EngineState {
        loop {
            if *cancel.borrow() {
                return EngineState::Paused(PauseReason::Cancelled);
            }

            if let Err(err) = self.complete_exhausted_entries(report).await {
                return EngineState::Failed(FailureInfo::new(FailureCause::Sink(err.to_string())));
            }
            if self.state.is_complete() {
                return EngineState::Completed;
            }

            let window = self.budget.remaining();
            let plan = match self.policy.plan(&self.state, &window, &self.weights) {
                PlanOutcome::Fetch(plan) => plan,
                PlanOutcome::Exhausted {
                    needed,
                    retry_after,
                } => {
                    info!(
                        traversal_id = %self.traversal_id,
                        needed = %needed,
                        nodes_remaining = window.nodes_remaining(),
                        requests_remaining = window.requests_remaining(),
                        retry_after = %retry_after,
                        "no plan fits the remaining budget"
                    );
                    return EngineState::Paused(PauseReason::BudgetExhausted { retry_after });
                }
                PlanOutcome::Finished => {
                    return EngineState::Failed(FailureInfo::new(FailureCause::Planner(format!(
                        "planner finished with {} outer entities pending",
                        self.state.pending_count()
                    ))));
                }
            };

            let reservation = match self.budget.reserve(plan.estimated_cost) {
                Admission::Admitted(reservation) => reservation,
                Admission::Deferred { retry_after } => {
                    info!(
                        traversal_id = %self.traversal_id,
                        estimate = %plan.estimated_cost,
                        retry_after = %retry_after,
                        "budget reservation deferred"
                    );
                    return EngineState::Paused(PauseReason::BudgetExhausted { retry_after });
                }
            };

            let page = match self.fetch_with_retry(&plan, cancel, report).await {
                Ok(page) => page,
                Err(interrupt) => {
                    self.budget.release(reservation);
                    return match interrupt {
                        Interrupt::Cancelled => EngineState::Paused(PauseReason::Cancelled),
                        Interrupt::Failed(info) => EngineState::Failed(info),
                    };
                }
            };

            self.budget.commit(reservation, page.actual_cost);
            if let Some(rate_limit) = page.rate_limit.clone() {
                self.budget.observe(rate_limit);
            }
            report.fetches += 1;
            report.consumed += page.actual_cost;

            if let Err(info) = self.merge(&plan, page, report).await {
                return EngineState::Failed(info);
            }

            self.fetches_since_checkpoint += 1;
            let interval = self.config.checkpoint_interval;
            if interval > 0 && self.fetches_since_checkpoint >= interval {
                if let Err(err) = self.checkpoint() {
                    return EngineState::Failed(FailureInfo::new(FailureCause::Checkpoint(
                        err.to_string(),
                    )));
                }
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        plan: &FetchPlan,
        cancel: &mut watch::Receiver<bool>,
        report: &mut RunReport,
    ) -> Result<ResultPage, Interrupt> {
        let retry = &self.config.retry;
        let mut backoff = retry.backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let error = match self.fetcher.fetch(plan).await {
                Ok(page) => return Ok(page),
                Err(error) => error,
            };

            if !(error.is_retryable() && retry.allows_retry(attempts)) {
                return Err(Interrupt::Failed(FailureInfo {
                    cause: FailureCause::Fetch(error),
                    attempts,
                    target: Some(plan.target.clone()),
                }));
            }
            let retry_after = match &error {
                FetchError::Transient { retry_after, .. } => *retry_after,
                FetchError::Fatal { .. } => None,
            };

            let delay = backoff.next_delay(retry_after);
            warn!(
                traversal_id = %self.traversal_id,
                level = plan.level(),
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "transient fetch error, backing off"
            );
            report.retries += 1;
            report.backoff_delays.push(delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(cancel) => return Err(Interrupt::Cancelled),
            }
        }
    }

    async fn merge(
        &mut self,
        plan: &FetchPlan,
        page: ResultPage,
        report: &mut RunReport,
    ) -> Result<(), FailureInfo> {
        let malformed = |error: FetchError| FailureInfo {
            cause: FailureCause::Fetch(error),
            attempts: 1,
            target: Some(plan.target.clone()),
        };
        let page_info = page.page_info().cloned().ok_or_else(|| {
            malformed(FetchError::fatal(
                FatalKind::MalformedResponse,
                "page carried no page info",
            ))
        })?;
        ensure_well_formed(&page_info, plan.level()).map_err(malformed)?;

        let received = page.entities.len() as u64;
        match &plan.target {
            FetchTarget::Outer => {
                let mut discovered = 0;
                for entity in page.entities {
                    if self.state.discover(entity.id, entity.payload) {
                        discovered += 1;
                    }
                }
                self.state
                    .advance(&plan.target, page_info.clone(), plan.page_size(), received);
                debug!(
                    traversal_id = %self.traversal_id,
                    level = plan.level(),
                    received,
                    discovered,
                    has_next_page = page_info.has_next_page,
                    "merged outer page"
                );
            }
            FetchTarget::Inner { parent, level } => {
                for mut entity in page.entities {
                    self.state.record_child(parent, level, entity.id.clone());
                    if let Some(edge) = entity.edge.take() {
                        self.state.record_edge(parent, level, entity.id.clone(), edge);
                    }
                    self.emit(entity.into(), report).await.map_err(|err| {
                        FailureInfo::new(FailureCause::Sink(err.to_string()))
                    })?;
                }
                self.state
                    .advance(&plan.target, page_info.clone(), plan.page_size(), received);
                debug!(
                    traversal_id = %self.traversal_id,
                    level = %level,
                    parent = %parent,
                    received,
                    has_next_page = page_info.has_next_page,
                    "merged inner page"
                );
                self.apply_rotation(parent);
            }
        }

        report.last_cursor = Some(LastCursor {
            target: plan.target.clone(),
            level: plan.level().to_string(),
            end_cursor: page_info.end_cursor,
        });
        Ok(())
    }

    /// Send the head entity to the back once it has had its run of pages.
    fn apply_rotation(&mut self, parent: &NodeId) {
        if self.state.head().map(|head| &head.id) != Some(parent) {
            return;
        }
        self.state.note_head_page();

        let Some(bound) = self.policy.rotation_bound() else {
            return;
        };
        let head_open = self.state.head().is_some_and(|head| !head.is_exhausted());
        if head_open && self.state.head_streak() >= bound && self.state.pending_count() > 1 {
            debug!(
                traversal_id = %self.traversal_id,
                parent = %parent,
                streak = self.state.head_streak(),
                "rotating outer entity"
            );
            self.state.rotate_head();
        }
    }

    /// Emit and complete every outer entity whose inner levels are exhausted.
    async fn complete_exhausted_entries(&mut self, report: &mut RunReport) -> Result<(), SinkError> {
        let finished: Vec<NodeId> = self
            .state
            .pending()
            .filter(|entry| entry.is_exhausted())
            .map(|entry| entry.id.clone())
            .collect();

        for id in finished {
            let entity = self.state.entry(&id).map(|entry| EmittedEntity {
                kind: self.fetcher.outer_kind(),
                id: id.clone(),
                payload: outer_payload(entry, self.state.inner_levels()),
            });
            if let Some(entity) = entity {
                self.emit(entity, report).await?;
            }
            self.state.mark_entity_complete(&id);
            debug!(traversal_id = %self.traversal_id, id = %id, "outer entity complete");
        }
        Ok(())
    }

    async fn emit(&mut self, entity: EmittedEntity, report: &mut RunReport) -> Result<(), SinkError> {
        let key = entity.key();
        if self.state.is_emitted(&key) {
            debug!(kind = %key.kind, id = %key.id, "entity already emitted");
            return Ok(());
        }

        let kind = entity.kind;
        self.sink.emit(entity).await?;
        self.state.mark_emitted(key);
        report.record_emission(kind);
        Ok(())
    }

    fn checkpoint(&mut self) -> CheckpointResult<()> {
        let bytes = self.state.serialize()?;
        self.store.save(&self.traversal_id, &bytes)?;
        self.fetches_since_checkpoint = 0;
        debug!(
            traversal_id = %self.traversal_id,
            bytes = bytes.len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Persist according to how the run ended.
    async fn settle(&mut self, outcome: EngineState) -> EngineState {
        if let Err(err) = self.sink.flush().await {
            if !matches!(outcome, EngineState::Failed(_)) {
                error!(traversal_id = %self.traversal_id, error = %err, "failed to flush sink");
                if let Err(err) = self.checkpoint() {
                    warn!(traversal_id = %self.traversal_id, error = %err, "failed to checkpoint after sink failure");
                }
                return EngineState::Failed(FailureInfo::new(FailureCause::Sink(err.to_string())));
            }
        }

        match outcome {
            EngineState::Completed => {
                let archived = self
                    .checkpoint()
                    .and_then(|()| self.store.archive(&self.traversal_id));
                if let Err(err) = archived {
                    error!(traversal_id = %self.traversal_id, error = %err, "failed to archive checkpoint");
                    return EngineState::Failed(FailureInfo::new(FailureCause::Checkpoint(
                        err.to_string(),
                    )));
                }
                info!(
                    traversal_id = %self.traversal_id,
                    completed = self.state.completed_count(),
                    emitted = self.state.emitted_count(),
                    "traversal completed"
                );
                EngineState::Completed
            }
            EngineState::Paused(reason) => {
                if let Err(err) = self.checkpoint() {
                    error!(traversal_id = %self.traversal_id, error = %err, "failed to checkpoint paused traversal");
                    return EngineState::Failed(FailureInfo::new(FailureCause::Checkpoint(
                        err.to_string(),
                    )));
                }
                info!(
                    traversal_id = %self.traversal_id,
                    reason = %reason,
                    pending = self.state.pending_count(),
                    "traversal paused"
                );
                EngineState::Paused(reason)
            }
            EngineState::Failed(info) => {
                // The in-memory state only ever holds fully merged pages.
                if let Err(err) = self.checkpoint() {
                    warn!(traversal_id = %self.traversal_id, error = %err, "failed to checkpoint failed traversal");
                }
                error!(traversal_id = %self.traversal_id, failure = %info, "traversal failed");
                EngineState::Failed(info)
            }
            other => other,
        }
    }

    fn finish_report(&self, mut report: RunReport) -> RunReport {
        report.state = self.status.clone();
        report.outer_completed = self.state.completed_count();
        report.outer_pending = self.state.pending_count();
        report
    }
}

/// Outer payload plus the child ids gathered for every inner level.
///
/// Link attributes, when a level has any, go under `<level>_edges` keyed by
/// child id.
fn outer_payload(entry: &OuterEntry, inner_levels: &[String]) -> Value {
    let mut payload = entry.payload.clone();
    if let Value::Object(map) = &mut payload {
        for level in inner_levels {
            let children = entry
                .children
                .get(level)
                .map(|ids| ids.iter().map(|id| Value::String(id.to_string())).collect())
                .unwrap_or_default();
            map.insert(level.clone(), Value::Array(children));

            if let Some(edges) = entry.edges.get(level).filter(|edges| !edges.is_empty()) {
                let edges = edges
                    .iter()
                    .map(|(id, edge)| (id.to_string(), edge.clone()))
                    .collect();
                map.insert(format!("{level}_edges"), Value::Object(edges));
            }
        }
    }
    payload
}

/// Resolves once the cancel flag is set. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
