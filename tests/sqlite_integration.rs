//! Integration tests for mirroring a SQLite source
//!
//! Runs the mirror against a SQLite database file shared with a writer.

use doc_mirror::adapters::outbound::{DashMapTopicTree, SqliteDocumentStore};
use doc_mirror::{
    DocumentId, MirrorError, MirrorService, MirrorSettings, Namespace, ShutdownController,
    TopicRoot, TopicTree,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn ns() -> Namespace {
    Namespace::new("shop", "orders")
}

fn settings() -> MirrorSettings {
    MirrorSettings::default()
        .max_await(Duration::from_millis(100))
        .bootstrap_timeout(Duration::from_millis(300))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn open(path: &std::path::Path) -> SqliteDocumentStore {
    SqliteDocumentStore::open(path)
        .unwrap()
        .poll_interval(Duration::from_millis(5))
}

#[tokio::test]
async fn test_mirror_follows_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("documents.db");
    let writer = open(&path);
    writer
        .load(&ns(), vec![json!({"_id": "A1", "value": 1})])
        .unwrap();

    let source = open(&path);
    let tree = Arc::new(DashMapTopicTree::new());
    let root = TopicRoot::new("feeds/shop/orders").unwrap();
    let service = MirrorService::start(
        Arc::new(source.clone()),
        Arc::new(source),
        tree.clone() as Arc<dyn TopicTree>,
        ns(),
        root,
        settings(),
    )
    .await
    .unwrap();

    let shutdown = ShutdownController::new();
    let stop = shutdown.clone();
    let handle = tokio::spawn(async move { service.run(&stop).await });

    eventually("snapshot", || tree.value("feeds/shop/orders/A1").is_some()).await;

    writer
        .update(&ns(), &DocumentId::from("A1"), json!({"value": 2}))
        .unwrap();
    writer.insert(&ns(), json!({"_id": "A2"})).unwrap();
    eventually("update and insert", || {
        tree.value("feeds/shop/orders/A1") == Some(json!({"_id": "A1", "value": 2}))
            && tree.value("feeds/shop/orders/A2").is_some()
    })
    .await;

    writer.drop_collection(&ns()).unwrap();
    eventually("drop", || tree.paths_under("feeds/shop/orders").is_empty()).await;

    shutdown.shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.drops, 1);
    assert!(stats.created >= 2);
}

#[tokio::test]
async fn test_trimmed_log_stops_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("documents.db");
    let writer = open(&path);

    // a slow poller cannot keep up with the trim below
    let source = SqliteDocumentStore::open(&path)
        .unwrap()
        .poll_interval(Duration::from_secs(5));
    let tree = Arc::new(DashMapTopicTree::new());
    let service = MirrorService::start(
        Arc::new(source.clone()),
        Arc::new(source),
        tree.clone() as Arc<dyn TopicTree>,
        ns(),
        TopicRoot::compose("mirror", &ns()).unwrap(),
        settings().max_await(Duration::from_millis(300)),
    )
    .await
    .unwrap();

    let shutdown = ShutdownController::new();
    let stop = shutdown.clone();
    let handle = tokio::spawn(async move { service.run(&stop).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..5 {
        writer.insert(&ns(), json!({"_id": i})).unwrap();
    }
    writer.trim_log(1).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(MirrorError::CursorInvalidated(_))));
}
