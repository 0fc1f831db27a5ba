use std::sync::Arc;

use serde_json::json;

use ghwalk::checkpoint::MemoryCheckpointStore;
use ghwalk::cursor::FetchTarget;
use ghwalk::engine::{ChannelSink, RunStatus, TraversalEngine};
use ghwalk::entity::EntityKind;
use ghwalk::planner::{PerEntityPolicy, PlannerConfig};
use ghwalk::testing::{CollectingSink, FixtureFetcher, FixtureTree};

use crate::{abc_tree, engine, never_cancel, set, unique_ids, ORG};

#[tokio::test]
async fn test_full_run_emits_every_entity_once() {
    let tree = FixtureTree::new()
        .member("U1", "octocat", &["R1", "R2", "R3", "R4", "R5"])
        .member("U2", "hubot", &[])
        .member("U3", "monalisa", &["R6", "R7", "R8"]);
    let fetcher = Arc::new(FixtureFetcher::new(tree.clone()));
    let sink = CollectingSink::new();
    let mut engine = engine(fetcher, Arc::new(MemoryCheckpointStore::new()), sink.clone());

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(unique_ids(&sink, EntityKind::Member), set(&["U1", "U2", "U3"]));
    let repositories = tree.repository_ids();
    let expected: Vec<&str> = repositories.iter().map(String::as_str).collect();
    assert_eq!(unique_ids(&sink, EntityKind::Repository), set(&expected));
    assert_eq!(report.emitted_total(), 11);
    assert_eq!(report.outer_completed, 3);
    assert_eq!(report.outer_pending, 0);
}

#[tokio::test]
async fn test_repository_shared_by_members_is_emitted_once() {
    let tree = FixtureTree::new()
        .member("A", "alice", &["R1", "SHARED"])
        .member("B", "bob", &["SHARED", "R2"]);
    let sink = CollectingSink::new();
    let mut engine = engine(
        Arc::new(FixtureFetcher::new(tree)),
        Arc::new(MemoryCheckpointStore::new()),
        sink.clone(),
    );

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(unique_ids(&sink, EntityKind::Repository), set(&["R1", "R2", "SHARED"]));
    assert_eq!(report.emitted_of(EntityKind::Repository), 3);

    // Both members still reference the shared repository.
    let bob = sink.find(EntityKind::Member, "B").expect("bob emitted");
    assert_eq!(bob.payload, json!({"login": "bob", "repositories": ["SHARED", "R2"]}));
}

#[tokio::test]
async fn test_member_payload_carries_repository_permissions() {
    let tree = FixtureTree::new()
        .member("A", "alice", &["R1", "SHARED"])
        .member("B", "bob", &["SHARED", "R2", "R3"])
        .permission("A", "SHARED", "ADMIN")
        .permission("B", "SHARED", "READ")
        .permission("B", "R3", "WRITE");
    let sink = CollectingSink::new();
    let mut engine = engine(
        Arc::new(FixtureFetcher::new(tree)),
        Arc::new(MemoryCheckpointStore::new()),
        sink.clone(),
    );

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    let alice = sink.find(EntityKind::Member, "A").expect("alice emitted");
    assert_eq!(
        alice.payload["repositories_edges"],
        json!({"SHARED": {"permission": "ADMIN"}})
    );
    let bob = sink.find(EntityKind::Member, "B").expect("bob emitted");
    assert_eq!(
        bob.payload["repositories_edges"],
        json!({"R3": {"permission": "WRITE"}, "SHARED": {"permission": "READ"}})
    );

    // The shared repository itself is emitted once and carries no member's permission.
    let shared = sink.find(EntityKind::Repository, "SHARED").expect("repository emitted");
    assert_eq!(shared.payload, json!({"name": "SHARED"}));
}

#[tokio::test]
async fn test_member_without_repositories_costs_one_scoped_fetch() {
    let fetcher = Arc::new(FixtureFetcher::new(FixtureTree::new().member("A", "alice", &[])));
    let sink = CollectingSink::new();
    let mut engine = engine(fetcher.clone(), Arc::new(MemoryCheckpointStore::new()), sink.clone());

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.fetches, 2);
    assert_eq!(report.consumed.nodes, 2);
    let alice = sink.find(EntityKind::Member, "A").expect("alice emitted");
    assert_eq!(alice.payload["repositories"], json!([]));
}

#[tokio::test]
async fn test_members_queue_in_discovery_order() {
    let fetcher = Arc::new(FixtureFetcher::new(abc_tree()));
    let mut engine = engine(
        fetcher.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        CollectingSink::new(),
    );

    engine.run(never_cancel()).await;

    let order: Vec<String> = fetcher
        .calls()
        .into_iter()
        .map(|call| match call.target {
            FetchTarget::Outer => format!("members@{}", call.after.unwrap_or_default()),
            FetchTarget::Inner { parent, .. } => parent.to_string(),
        })
        .collect();
    assert_eq!(
        order,
        vec!["members@", "A", "B", "B", "members@members:2", "C"]
    );
}

#[tokio::test]
async fn test_rotation_interleaves_large_members() {
    let tree = FixtureTree::new()
        .member("BIG", "big", &["R1", "R2", "R3", "R4", "R5", "R6", "R7", "R8"])
        .member("SMALL", "small", &["R9"]);
    let fetcher = Arc::new(FixtureFetcher::new(tree));
    let sink = CollectingSink::new();
    let mut engine = TraversalEngine::new(
        ORG,
        fetcher.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        Box::new(sink.clone()),
    )
    .with_policy(PerEntityPolicy::new(
        PlannerConfig::new()
            .with_outer_page_size(10)
            .with_inner_page_size(2)
            .with_max_consecutive_pages(2),
    ));

    let report = engine.run(never_cancel()).await;

    assert_eq!(report.status(), RunStatus::Completed);
    // SMALL finishes before BIG even though BIG was discovered first.
    assert_eq!(sink.ids_of(EntityKind::Member), vec!["SMALL", "BIG"]);
    assert_eq!(
        sink.find(EntityKind::Member, "BIG").expect("big emitted").payload["repositories"]
            .as_array()
            .map(Vec::len),
        Some(8)
    );
}

#[tokio::test]
async fn test_channel_sink_receives_entities() {
    let (sink, mut rx) = ChannelSink::channel(64);
    let mut engine = TraversalEngine::new(
        ORG,
        Arc::new(FixtureFetcher::new(abc_tree())),
        Arc::new(MemoryCheckpointStore::new()),
        Box::new(sink),
    );

    let report = engine.run(never_cancel()).await;
    drop(engine);

    let mut received = Vec::new();
    while let Some(entity) = rx.recv().await {
        received.push(entity.id.to_string());
    }
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(received.len(), 7);
    assert!(received.contains(&"R4".to_string()));
}
