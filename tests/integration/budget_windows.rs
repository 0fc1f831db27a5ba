use std::sync::Arc;

use chrono::Duration;

use ghwalk::budget::{Clock, SharedBudget};
use ghwalk::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use ghwalk::cursor::TraversalState;
use ghwalk::engine::{EngineState, PauseReason, RunStatus};
use ghwalk::entity::EntityKind;
use ghwalk::testing::{CollectingSink, FixtureFetcher, FixtureTree};

use crate::{abc_tree, engine, never_cancel, set, start_clock, tight_budget, unique_ids, ORG};

#[tokio::test]
async fn test_pause_at_window_end_and_resume_after_reset() {
    let clock = start_clock();
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()));
    let store = Arc::new(MemoryCheckpointStore::new());
    let sink = CollectingSink::new();
    let mut engine = engine(fetcher.clone(), store.clone(), sink.clone())
        .with_budget(tight_budget(8, &clock));

    // Window 1: members page (2), A (1), B first page (3), B last page shrunk to one (2).
    let first = engine.run(never_cancel()).await;

    let reset = clock.now() + Duration::hours(1);
    assert_eq!(
        first.state,
        EngineState::Paused(PauseReason::BudgetExhausted { retry_after: reset })
    );
    assert_eq!(first.status(), RunStatus::Paused);
    assert_eq!(first.consumed.nodes, 8);
    assert_eq!(unique_ids(&sink, EntityKind::Member), set(&["A", "B"]));
    assert_eq!(unique_ids(&sink, EntityKind::Repository), set(&["R1", "R2", "R3"]));

    let saved = store.load(ORG).unwrap().expect("paused run checkpoints");
    assert_eq!(&TraversalState::deserialize(&saved).unwrap(), engine.state());

    // Still the same window: nothing fits, nothing is fetched.
    let calls = fetcher.calls().len();
    let early = engine.run(never_cancel()).await;
    assert_eq!(early.status(), RunStatus::Paused);
    assert_eq!(early.fetches, 0);
    assert_eq!(fetcher.calls().len(), calls);

    clock.advance(Duration::hours(1));
    let second = engine.run(never_cancel()).await;

    assert_eq!(second.status(), RunStatus::Completed);
    assert!(second.consumed.nodes <= 8);
    assert_eq!(unique_ids(&sink, EntityKind::Member), set(&["A", "B", "C"]));
    assert_eq!(
        unique_ids(&sink, EntityKind::Repository),
        set(&["R1", "R2", "R3", "R4"])
    );
    let bob = sink.find(EntityKind::Member, "B").expect("bob emitted");
    assert_eq!(bob.payload["repositories"], serde_json::json!(["R1", "R2", "R3"]));
    assert_eq!(store.load(ORG).unwrap(), None);
    assert_eq!(store.archived().len(), 1);
}

#[tokio::test]
async fn test_each_window_stays_within_node_cap() {
    let tree = FixtureTree::new()
        .member("U1", "octocat", &["R1", "R2", "R3", "R4", "R5"])
        .member("U2", "hubot", &["R6"])
        .member("U3", "monalisa", &["R7", "R8", "R9"])
        .member("U4", "defunkt", &[]);
    let node_cap = 7;
    let clock = start_clock();
    let sink = CollectingSink::new();
    let mut engine = engine(
        Arc::new(FixtureFetcher::new(tree)),
        Arc::new(MemoryCheckpointStore::new()),
        sink.clone(),
    )
    .with_budget(tight_budget(node_cap, &clock));

    let mut windows = 0;
    loop {
        let report = engine.run(never_cancel()).await;
        assert!(
            report.consumed.nodes <= node_cap,
            "window {windows} consumed {}",
            report.consumed
        );
        windows += 1;
        match report.state {
            EngineState::Completed => break,
            EngineState::Paused(PauseReason::BudgetExhausted { retry_after }) => {
                assert!(windows < 20, "traversal is not making progress");
                clock.set(retry_after);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    assert!(windows > 1);
    assert_eq!(sink.ids_of(EntityKind::Member).len(), 4);
    assert_eq!(unique_ids(&sink, EntityKind::Repository).len(), 9);
}

#[tokio::test]
async fn test_engines_on_one_credential_share_the_node_cap() {
    let node_cap = 8;
    let clock = start_clock();
    let budget = SharedBudget::new(tight_budget(node_cap, &clock));
    let first_sink = CollectingSink::new();
    let second_sink = CollectingSink::new();
    let mut first = engine(
        Arc::new(FixtureFetcher::new(abc_tree())),
        Arc::new(MemoryCheckpointStore::new()),
        first_sink.clone(),
    )
    .with_budget(budget.clone());
    let mut second = engine(
        Arc::new(FixtureFetcher::new(
            FixtureTree::new()
                .member("U1", "octocat", &["R5", "R6", "R7"])
                .member("U2", "hubot", &["R8"]),
        )),
        Arc::new(MemoryCheckpointStore::new()),
        second_sink.clone(),
    )
    .with_budget(budget.clone());

    let mut windows = 0;
    loop {
        let (a, b) = tokio::join!(first.run(never_cancel()), second.run(never_cancel()));
        windows += 1;
        let combined = a.consumed.nodes + b.consumed.nodes;
        assert!(combined <= node_cap, "window {windows} consumed {combined} nodes");
        assert!(budget.remaining().nodes_consumed <= node_cap);

        if a.status() == RunStatus::Completed && b.status() == RunStatus::Completed {
            break;
        }
        assert!(windows < 20, "traversals are not making progress");
        clock.set(budget.remaining().resets_at());
    }

    assert!(windows > 1);
    assert_eq!(unique_ids(&first_sink, EntityKind::Member), set(&["A", "B", "C"]));
    assert_eq!(unique_ids(&second_sink, EntityKind::Member), set(&["U1", "U2"]));
    assert_eq!(unique_ids(&second_sink, EntityKind::Repository).len(), 4);
}

#[tokio::test]
async fn test_window_resets_on_whole_hours() {
    let clock = start_clock();
    let start = clock.now();
    let mut engine = engine(
        Arc::new(FixtureFetcher::new(abc_tree())),
        Arc::new(MemoryCheckpointStore::new()),
        CollectingSink::new(),
    )
    .with_budget(tight_budget(3, &clock));

    engine.run(never_cancel()).await;

    // Two and a half hours later the window started on the two-hour mark.
    clock.advance(Duration::minutes(150));
    let window = engine.remaining_budget();
    assert_eq!(window.window_start_time, start + Duration::hours(2));
    assert_eq!(window.nodes_consumed, 0);
    assert_eq!(window.resets_at(), start + Duration::hours(3));
}
