//! Integration tests for the in-memory store seams.

use drip_core::{ClusterTime, ManualClock, OrderKey};
use drip_delta::UpdateDescription;
use drip_store::{
    ChangeKind, DocumentKey, MemoryStore, OperationType, PcsQuery, Rule, SourceStore, StoreError,
    WatchOptions, Write,
};
use futures::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_millis(50);

fn store() -> MemoryStore {
    MemoryStore::with_clock(Arc::new(ManualClock::from_millis(10_000)))
}

#[tokio::test]
async fn test_scan_source_is_ordered_filtered_and_paged() {
    let store = store();
    for (id, a) in [(3, 0), (1, 0), (2, 1), (5, 0)] {
        store.insert("orders", json!({"_id": id, "a": a})).unwrap();
    }
    store.insert("orders", json!({"_id": "z", "a": 0})).unwrap();

    let mut session = store.start_session().await.unwrap();
    let rule = Rule::matching(json!({"a": 0}));

    let (first, ct1) = store.scan_source(&mut session, "orders", &rule, None, 2).await.unwrap();
    let keys: Vec<_> = first.iter().map(|d| d["_id"].clone()).collect();
    assert_eq!(keys, vec![json!(1), json!(3)]);

    let last = DocumentKey::from(3i64);
    let (rest, ct2) = store
        .scan_source(&mut session, "orders", &rule, Some(&last), 10)
        .await
        .unwrap();
    let keys: Vec<_> = rest.iter().map(|d| d["_id"].clone()).collect();
    assert_eq!(keys, vec![json!(5), json!("z")]);
    assert!(ct2 >= ct1);
}

#[tokio::test]
async fn test_majority_read_advances_session() {
    let store = store();
    store.insert("orders", json!({"_id": 1})).unwrap();
    let mut session = store.start_session().await.unwrap();
    let b = store.majority_read_time(&mut session).await.unwrap();
    assert_eq!(b, store.cluster_time());
    assert_eq!(session.cluster_time(), Some(b));
}

#[tokio::test]
async fn test_feed_respects_operation_filter() {
    let store = store();
    store.insert("orders", json!({"_id": 1})).unwrap();
    let mut feed = store
        .watch(
            "orders",
            WatchOptions {
                operation_types: vec![OperationType::Delete],
                ..WatchOptions::default()
            },
        )
        .await
        .unwrap();

    store.replace("orders", json!({"_id": 1, "v": 2})).unwrap();
    store.delete("orders", 1i64).unwrap();

    let event = feed.next_within(WAIT).await.unwrap().unwrap();
    match event.kind {
        ChangeKind::Delete { key, before } => {
            assert_eq!(key, DocumentKey::from(1i64));
            assert_eq!(before["v"], json!(2));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_transaction_writes_share_cluster_time() {
    let store = store();
    let mut feed = store.watch("orders", WatchOptions::default()).await.unwrap();
    let ct = store
        .transaction(
            "orders",
            vec![
                Write::Insert(json!({"_id": 1})),
                Write::Insert(json!({"_id": 2})),
                Write::Update(
                    DocumentKey::from(1i64),
                    UpdateDescription::new().set("x", json!(true)),
                ),
            ],
        )
        .unwrap();

    for _ in 0..3 {
        let event = feed.next_within(WAIT).await.unwrap().unwrap();
        assert_eq!(event.cluster_time, ct);
    }
    assert!(feed.next_within(Duration::from_millis(10)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_feed_waits_for_late_writes() {
    let store = store();
    let mut feed = store.watch("orders", WatchOptions::default()).await.unwrap();

    let writer = store.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.insert("orders", json!({"_id": 7})).unwrap();
    });

    let event = feed.next_within(Duration::from_secs(2)).await.unwrap().unwrap();
    assert!(matches!(event.kind, ChangeKind::Insert { .. }));
    handle.await.unwrap();
}

#[tokio::test]
async fn test_drop_invalidates_feed_and_identity() {
    let store = store();
    let id = store.create_collection("orders");
    assert_eq!(store.collection_id("orders").await.unwrap(), id);

    let mut feed = store.watch("orders", WatchOptions::default()).await.unwrap();
    store.drop_collection("orders").unwrap();

    let event = feed.next_within(WAIT).await.unwrap().unwrap();
    assert!(event.is_invalidate());
    assert!(matches!(
        store.collection_id("orders").await,
        Err(StoreError::CollectionNotFound(_))
    ));
}

#[tokio::test]
async fn test_raw_injection_surfaces_malformed_change() {
    let store = store();
    let mut feed = store.watch("orders", WatchOptions::default()).await.unwrap();
    store.inject_raw_change("orders", json!({"operationType": "insert", "bogus": true}));
    let err = feed.next_within(WAIT).await.unwrap_err();
    assert!(matches!(err, StoreError::MalformedChange(_)));
}

#[tokio::test]
async fn test_empty_log_scan_is_empty() {
    let store = store();
    let events: Vec<_> = drip_store::LogStore::scan_log(
        &store,
        "orders",
        PcsQuery::between(OrderKey::MIN, OrderKey::lower_bound(ClusterTime::new(u32::MAX, 0))),
    )
    .try_collect()
    .await
    .unwrap();
    assert!(events.is_empty());
}
