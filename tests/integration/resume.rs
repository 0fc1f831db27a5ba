use std::sync::Arc;

use tempfile::TempDir;

use ghwalk::checkpoint::{
    CheckpointStore, CorruptCheckpointPolicy, FileCheckpointStore, MemoryCheckpointStore,
};
use ghwalk::cursor::FetchTarget;
use ghwalk::engine::{EngineConfig, EngineState, PauseReason, RunStatus};
use ghwalk::entity::EntityKind;
use ghwalk::testing::{CollectingSink, FixtureFetcher};

use crate::{
    abc_tree, engine, fast_retry, never_cancel, set, start_clock, tight_budget, unique_ids, ORG,
};

#[tokio::test]
async fn test_new_engine_resumes_from_file_checkpoint() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = Arc::new(FileCheckpointStore::new(temp_dir.path()).expect("store"));
    let clock = start_clock();

    let first_sink = CollectingSink::new();
    let mut first = engine(
        Arc::new(FixtureFetcher::new(abc_tree())),
        store.clone(),
        first_sink.clone(),
    )
    .with_budget(tight_budget(8, &clock));
    let paused = first.run(never_cancel()).await;
    assert!(matches!(
        paused.state,
        EngineState::Paused(PauseReason::BudgetExhausted { .. })
    ));
    assert!(store.checkpoint_path(ORG).unwrap().exists());
    drop(first);

    // A fresh process: new fetcher, new sink, a full budget.
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()));
    let second_sink = CollectingSink::new();
    let mut second = engine(fetcher.clone(), store.clone(), second_sink.clone())
        .resume_from_store(CorruptCheckpointPolicy::Abort)
        .expect("resume");
    assert_eq!(second.state().completed_count(), 2);

    let report = second.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    // Nothing finished in the first process is fetched or emitted again.
    let calls = fetcher.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].target, FetchTarget::Outer);
    assert_eq!(calls[0].after.as_deref(), Some("members:2"));
    assert_eq!(unique_ids(&second_sink, EntityKind::Member), set(&["C"]));
    assert_eq!(unique_ids(&second_sink, EntityKind::Repository), set(&["R4"]));

    let mut members = unique_ids(&first_sink, EntityKind::Member);
    members.extend(unique_ids(&second_sink, EntityKind::Member));
    assert_eq!(members, set(&["A", "B", "C"]));

    assert!(!store.checkpoint_path(ORG).unwrap().exists());
    assert_eq!(store.archived().unwrap().len(), 1);
}

#[tokio::test]
async fn test_corrupt_checkpoint_aborts_or_restarts() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = Arc::new(FileCheckpointStore::new(temp_dir.path()).expect("store"));
    store.save(ORG, b"{\"format_version\": 1, \"checksum\": \"00\", \"state\": \"{}\"}").unwrap();

    let aborted = engine(
        Arc::new(FixtureFetcher::new(abc_tree())),
        store.clone(),
        CollectingSink::new(),
    )
    .resume_from_store(CorruptCheckpointPolicy::Abort);
    match aborted {
        Err(err) => assert!(err.is_corrupt()),
        Ok(engine) => panic!("corrupt checkpoint accepted: {engine:?}"),
    }

    let sink = CollectingSink::new();
    let mut restarted = engine(
        Arc::new(FixtureFetcher::new(abc_tree())),
        store.clone(),
        sink.clone(),
    )
    .resume_from_store(CorruptCheckpointPolicy::RestartEmpty)
    .expect("restart from empty state");
    assert_eq!(restarted.state().completed_count(), 0);

    let report = restarted.run(never_cancel()).await;
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(sink.len(), 7);
}

#[tokio::test]
async fn test_checkpoints_written_every_interval() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut engine = engine(
        Arc::new(FixtureFetcher::new(abc_tree())),
        store.clone(),
        CollectingSink::new(),
    )
    .with_config(
        EngineConfig::new()
            .with_checkpoint_interval(2)
            .with_retry(fast_retry()),
    );

    let report = engine.run(never_cancel()).await;

    // Six fetches: three interval checkpoints, then the final one before archiving.
    assert_eq!(report.fetches, 6);
    assert_eq!(store.save_count(), 4);
    assert_eq!(store.archived().len(), 1);
}
