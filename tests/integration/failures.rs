use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;

use ghwalk::budget::Cost;
use ghwalk::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use ghwalk::cursor::TraversalState;
use ghwalk::engine::{EngineConfig, EngineState, FailureCause, PauseReason, RetryPolicy, RunStatus};
use ghwalk::entity::EntityKind;
use ghwalk::error::{FatalKind, FetchError};
use ghwalk::testing::{CollectingSink, FixtureFetcher};

use crate::{abc_tree, engine, never_cancel, start_clock, tight_budget, unique_ids, ORG};

#[tokio::test]
async fn test_transient_errors_are_retried_with_growing_backoff() {
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()).with_failures(vec![
        FetchError::transient("502 Bad Gateway"),
        FetchError::transient("connection reset"),
    ]));
    let sink = CollectingSink::new();
    let mut engine = engine(fetcher.clone(), Arc::new(MemoryCheckpointStore::new()), sink.clone());

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.retries, 2);
    assert_eq!(
        report.backoff_delays,
        vec![Duration::from_millis(1), Duration::from_millis(2)]
    );
    assert_eq!(sink.len(), 7);
    // The first plan was issued three times with the same cursor.
    let calls = fetcher.calls();
    assert_eq!(calls[0], calls[1]);
    assert_eq!(calls[1], calls[2]);
}

#[tokio::test]
async fn test_backoff_grows_until_the_cap() {
    let failures = (0..5).map(|_| FetchError::transient("503")).collect();
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()).with_failures(failures));
    let mut engine = engine(
        fetcher,
        Arc::new(MemoryCheckpointStore::new()),
        CollectingSink::new(),
    )
    .with_config(
        EngineConfig::new().with_retry(
            RetryPolicy::new()
                .with_max_attempts(6)
                .with_initial_backoff(Duration::from_millis(1))
                .with_max_backoff(Duration::from_millis(4)),
        ),
    );

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    let millis: Vec<u128> = report.backoff_delays.iter().map(Duration::as_millis).collect();
    assert_eq!(millis, vec![1, 2, 4, 4, 4]);
}

#[tokio::test]
async fn test_retry_after_hint_is_bounded_by_max_backoff() {
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()).with_failures(vec![
        FetchError::Transient {
            message: "secondary rate limit".to_string(),
            retry_after: Some(Duration::from_secs(60)),
        },
    ]));
    let mut engine = engine(
        fetcher,
        Arc::new(MemoryCheckpointStore::new()),
        CollectingSink::new(),
    );

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.backoff_delays, vec![Duration::from_millis(8)]);
}

#[tokio::test]
async fn test_fatal_error_fails_and_keeps_last_good_checkpoint() {
    let clock = start_clock();
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()));
    let store = Arc::new(MemoryCheckpointStore::new());
    let sink = CollectingSink::new();
    let mut engine = engine(fetcher.clone(), store.clone(), sink.clone())
        .with_budget(tight_budget(8, &clock));

    let first = engine.run(never_cancel()).await;
    assert_eq!(first.status(), RunStatus::Paused);
    let before = engine.state().clone();

    fetcher.fail_next(FetchError::fatal(FatalKind::Auth, "Bad credentials"));
    clock.advance(ChronoDuration::hours(1));
    let calls = fetcher.calls().len();
    let failed = engine.run(never_cancel()).await;

    match &failed.state {
        EngineState::Failed(info) => {
            assert_eq!(info.attempts, 1);
            assert!(matches!(
                info.cause,
                FailureCause::Fetch(FetchError::Fatal {
                    kind: FatalKind::Auth,
                    ..
                })
            ));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(fetcher.calls().len(), calls + 1);
    assert_eq!(engine.remaining_budget().reserved, Cost::ZERO);

    let saved = store.load(ORG).unwrap().expect("checkpoint kept");
    assert_eq!(TraversalState::deserialize(&saved).unwrap(), before);

    // A failed engine stays failed and issues nothing further.
    let again = engine.run(never_cancel()).await;
    assert_eq!(again.status(), RunStatus::Failed);
    assert_eq!(again.fetches, 0);
    assert_eq!(fetcher.calls().len(), calls + 1);
    assert_eq!(unique_ids(&sink, EntityKind::Member).len(), 2);
}

#[tokio::test]
async fn test_cancel_before_start_pauses_without_fetching() {
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()));
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut engine = engine(fetcher.clone(), store.clone(), CollectingSink::new());

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let report = engine.run(rx).await;

    assert_eq!(report.state, EngineState::Paused(PauseReason::Cancelled));
    assert!(!report.status().is_failure());
    assert!(fetcher.calls().is_empty());
    assert!(store.load(ORG).unwrap().is_some());
}

#[tokio::test]
async fn test_cancel_during_backoff_releases_reservation() {
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()).with_failures(vec![
        FetchError::Transient {
            message: "rate limited".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        },
    ]));
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut engine = engine(fetcher.clone(), store.clone(), CollectingSink::new()).with_config(
        EngineConfig::new().with_retry(RetryPolicy::new().with_max_backoff(Duration::from_secs(30))),
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(true);
    });
    let report = tokio::time::timeout(Duration::from_secs(5), engine.run(rx))
        .await
        .expect("cancellation interrupts the backoff sleep");

    assert_eq!(report.state, EngineState::Paused(PauseReason::Cancelled));
    assert_eq!(report.retries, 1);
    assert_eq!(fetcher.calls().len(), 1);
    assert_eq!(engine.remaining_budget().reserved, Cost::ZERO);
    assert_eq!(engine.remaining_budget().nodes_consumed, 0);
    assert!(store.load(ORG).unwrap().is_some());

    // Resuming picks the same page up again.
    let resumed = engine.run(never_cancel()).await;
    assert_eq!(resumed.status(), RunStatus::Completed);
}
