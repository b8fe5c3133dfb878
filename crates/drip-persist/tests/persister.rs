//! Persister runs against the in-memory store.

use drip_core::{ClusterTime, ManualClock, OrderKey};
use drip_delta::UpdateDescription;
use drip_persist::{
    run_persister, PersistError, Persister, PersisterConfig, PersisterConfigBuilder,
    PersisterHandle,
};
use drip_store::{
    DocumentKey, LogStore, MemoryStore, OperationType, PcsEvent, PcsOp, PcsQuery, StoreError,
};
use futures::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SOURCE: &str = "orders";

fn config() -> PersisterConfig {
    PersisterConfigBuilder::new().max_batch_size(100).max_await(20).build()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

async fn log(store: &MemoryStore) -> Vec<PcsEvent> {
    store
        .scan_log(
            SOURCE,
            PcsQuery::between(OrderKey::MIN, OrderKey::lower_bound(ClusterTime::new(u32::MAX, 0))),
        )
        .try_collect()
        .await
        .unwrap()
}

async fn started(store: &Arc<MemoryStore>) -> PersisterHandle {
    let handle = run_persister(store.clone(), SOURCE, config());
    settle().await;
    handle
}

async fn joined(handle: PersisterHandle) -> Result<drip_persist::PersisterSummary, PersistError> {
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("persister did not finish")
}

#[tokio::test]
async fn test_burst_lands_in_one_batch() {
    let store = Arc::new(MemoryStore::new());
    let handle = started(&store).await;

    for id in 0..5 {
        store.insert(SOURCE, json!({"_id": id, "a": 0})).unwrap();
    }
    settle().await;

    let summary = handle.stop().await.unwrap();
    assert!(!summary.resumed);
    assert_eq!(summary.events_written, 5);
    assert_eq!(summary.batches_written, 1);
    assert_eq!(log(&store).await.len(), 5);
}

#[tokio::test]
async fn test_log_keeps_feed_order_across_batches() {
    let store = Arc::new(MemoryStore::new());
    let handle = Persister::new(store.clone(), SOURCE)
        .config(PersisterConfigBuilder::new().max_batch_size(3).max_await(20).build())
        .spawn();
    settle().await;

    for id in 0..20 {
        store.insert(SOURCE, json!({"_id": id})).unwrap();
        if id % 7 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    settle().await;
    handle.stop().await.unwrap();

    let events = log(&store).await;
    assert_eq!(events.len(), 20);
    assert!(events.windows(2).all(|w| w[0].key() < w[1].key()));
    let keys: Vec<_> = events.iter().filter_map(|e| e.document_key().cloned()).collect();
    let expected: Vec<_> = (0..20i64).map(DocumentKey::from).collect();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn test_saved_token_matches_last_write() {
    let store = Arc::new(MemoryStore::new());
    let handle = started(&store).await;
    store.insert(SOURCE, json!({"_id": 1})).unwrap();
    store.insert(SOURCE, json!({"_id": 2})).unwrap();
    settle().await;

    let summary = handle.stop().await.unwrap();
    let saved = store.load_resume_token(SOURCE).await.unwrap();
    assert!(saved.is_some());
    assert_eq!(summary.last_token, saved);
    assert!(store.metadata_record(SOURCE).is_some());
}

#[tokio::test]
async fn test_idle_feed_spaces_noops() {
    let clock = Arc::new(ManualClock::from_millis(10_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let handle = Persister::new(store.clone(), SOURCE)
        .config(config())
        .clock(clock.clone())
        .spawn();
    settle().await;

    store.tick();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(log(&store).await.iter().filter(|e| e.is_noop()).count(), 1);

    // Same cluster-time second as the last noop.
    store.tick();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(log(&store).await.iter().filter(|e| e.is_noop()).count(), 1);

    clock.advance_millis(1_000);
    store.tick();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let summary = handle.stop().await.unwrap();
    let noops: Vec<_> = log(&store).await.into_iter().filter(|e| e.is_noop()).collect();
    assert_eq!(noops.len(), 2);
    assert_eq!(summary.noops_written, 2);
    assert!(noops[0].cluster_time.t < noops[1].cluster_time.t);
}

#[tokio::test]
async fn test_restart_resumes_after_saved_token() {
    let store = Arc::new(MemoryStore::new());
    let handle = started(&store).await;
    store.insert(SOURCE, json!({"_id": "a"})).unwrap();
    settle().await;
    handle.stop().await.unwrap();

    store.insert(SOURCE, json!({"_id": "b"})).unwrap();

    let handle = started(&store).await;
    settle().await;
    let summary = handle.stop().await.unwrap();
    assert!(summary.resumed);

    let keys: Vec<_> = log(&store)
        .await
        .iter()
        .filter_map(|e| e.document_key().cloned())
        .collect();
    assert_eq!(keys, vec![DocumentKey::from("a"), DocumentKey::from("b")]);
}

#[tokio::test]
async fn test_expired_token_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let handle = started(&store).await;
    store.insert(SOURCE, json!({"_id": 1})).unwrap();
    settle().await;
    handle.stop().await.unwrap();

    store.insert(SOURCE, json!({"_id": 2})).unwrap();
    store.truncate_oplog();

    let err = joined(run_persister(store.clone(), SOURCE, config())).await.unwrap_err();
    assert!(err.is_invalid_resume_token());
    assert!(!err.class().is_retryable());
}

#[tokio::test]
async fn test_malformed_change_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let handle = started(&store).await;
    store.inject_raw_change(SOURCE, json!({"operationType": "insert", "bogus": 1}));

    let err = joined(handle).await.unwrap_err();
    assert!(matches!(err, PersistError::Store(StoreError::MalformedChange(_))));
    assert_eq!(store.log_len(SOURCE), 0);
}

#[tokio::test]
async fn test_transient_write_failure_propagates() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next_appends(1);
    let handle = started(&store).await;

    store.insert(SOURCE, json!({"_id": 1})).unwrap();
    settle().await;
    store.insert(SOURCE, json!({"_id": 2})).unwrap();

    let err = joined(handle).await.unwrap_err();
    assert!(err.class().is_retryable());
    assert_eq!(store.log_len(SOURCE), 0);
}

#[tokio::test]
async fn test_drop_invalidates_persister() {
    let store = Arc::new(MemoryStore::new());
    store.insert(SOURCE, json!({"_id": 1})).unwrap();
    let handle = started(&store).await;
    store.drop_collection(SOURCE).unwrap();

    match joined(handle).await.unwrap_err() {
        PersistError::CollectionInvalidated { collection, operation } => {
            assert_eq!(collection, SOURCE);
            assert_eq!(operation, OperationType::Drop);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_log_of_dropped_generation_is_not_extended() {
    let store = Arc::new(MemoryStore::new());
    let first = store.create_collection(SOURCE);
    let handle = started(&store).await;
    store.insert(SOURCE, json!({"_id": 1})).unwrap();
    settle().await;
    handle.stop().await.unwrap();
    assert_eq!(store.log_collection_id(SOURCE).await.unwrap(), Some(first));

    store.drop_collection(SOURCE).unwrap();
    let second = store.create_collection(SOURCE);
    store.insert(SOURCE, json!({"_id": 2})).unwrap();

    match joined(run_persister(store.clone(), SOURCE, config())).await.unwrap_err() {
        PersistError::LogGenerationMismatch { log, current } => {
            assert_eq!(log, first);
            assert_eq!(current, second);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(store.log_len(SOURCE), 1);
}

#[tokio::test]
async fn test_update_carries_diff_and_replace_does_not() {
    let store = Arc::new(MemoryStore::new());
    store.insert(SOURCE, json!({"_id": 1, "a": 0})).unwrap();
    let handle = started(&store).await;

    store
        .update(SOURCE, 1i64, UpdateDescription::new().set("a", json!(1)))
        .unwrap();
    store.replace(SOURCE, json!({"_id": 1, "b": true})).unwrap();
    store.delete(SOURCE, 1i64).unwrap();
    settle().await;
    handle.stop().await.unwrap();

    let events = log(&store).await;
    assert_eq!(events.len(), 3);
    match &events[0].op {
        PcsOp::Update { before, after, diff, .. } => {
            assert_eq!(before["a"], json!(0));
            assert_eq!(after["a"], json!(1));
            assert_eq!(diff.clone().map(|p| p.into_value()), Some(json!({"i": {"a": 1}})));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(&events[1].op, PcsOp::Update { diff: None, .. }));
    assert!(matches!(&events[2].op, PcsOp::Deletion { .. }));
}
