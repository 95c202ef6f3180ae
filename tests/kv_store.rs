use std::sync::Arc;
use std::time::Duration;

use codemate_sync::clock::ManualClock;
use codemate_sync::kv::{KvValue, ReplicatedStore};
use codemate_sync::{MemoryTransport, SyncError, TransportPath};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn scope() -> TransportPath {
    TransportPath::from_segments(["CodeMate", "k3j9x2", "database"])
}

fn store(transport: &MemoryTransport, clock: &Arc<ManualClock>, read_only: bool) -> ReplicatedStore {
    ReplicatedStore::new(
        Arc::new(transport.clone()),
        scope(),
        clock.clone(),
        Duration::from_millis(100),
        read_only,
    )
}

#[tokio::test(start_paused = true)]
async fn set_writes_a_typed_envelope_visible_to_peers() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(1_700_000_000_000);
    let alice = store(&hub, &clock, false);
    let bob = store(&hub.peer(), &clock, false);

    alice.set("username", "Ada").await.unwrap();
    assert_eq!(
        hub.graph().get(&scope().child("username")),
        Some(json!({"value": "Ada", "type": "string", "timestamp": 1_700_000_000_000i64}))
    );
    assert_eq!(bob.get("username").await.unwrap(), Some(KvValue::String("Ada".into())));

    clock.advance(5);
    bob.set("username", 42i64).await.unwrap();
    let entry = alice.get_entry("username").await.unwrap().unwrap();
    assert_eq!(entry.value, KvValue::Number(42.0));
    assert_eq!(entry.timestamp, 1_700_000_000_005);

    alice.delete("username").await.unwrap();
    assert_eq!(bob.get("username").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn push_and_increment_check_types() {
    let hub = MemoryTransport::new();
    let kv = store(&hub, &ManualClock::new(0), false);

    assert_eq!(kv.push("todos", "milk").await.unwrap(), vec![json!("milk")]);
    assert_eq!(kv.push("todos", 2i64).await.unwrap(), vec![json!("milk"), json!(2)]);
    assert_eq!(kv.get_entry("todos").await.unwrap().unwrap().value.type_tag(), "object");

    kv.set("name", "Ada").await.unwrap();
    assert_eq!(kv.push("name", "x").await, Err(SyncError::ArrayType("name".into())));
    assert_eq!(kv.get("name").await.unwrap(), Some(KvValue::String("Ada".into())));

    assert_eq!(kv.increment("hits", 1.0).await.unwrap(), 1.0);
    assert_eq!(kv.increment("hits", 5.0).await.unwrap(), 6.0);
    assert_eq!(kv.increment("name", 1.0).await, Err(SyncError::NumberType("name".into())));
}

#[tokio::test(start_paused = true)]
async fn sequential_pushes_to_an_emptied_array_keep_order() {
    let hub = MemoryTransport::new();
    let kv = store(&hub, &ManualClock::new(0), false);

    kv.push("queue", "stale").await.unwrap();
    kv.set("queue", KvValue::Json(json!([]))).await.unwrap();
    for item in ["a", "b", "c"] {
        kv.push("queue", item).await.unwrap();
    }
    assert_eq!(
        kv.get("queue").await.unwrap(),
        Some(KvValue::Json(json!(["a", "b", "c"])))
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_pushes_from_two_writers_may_lose_one() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(0);
    let alice = store(&hub, &clock, false);
    let bob = store(&hub.peer(), &clock, false);

    let (a, b) = tokio::join!(alice.push("list", "from-alice"), bob.push("list", "from-bob"));
    assert!(a.is_ok() && b.is_ok());

    let Some(KvValue::Json(serde_json::Value::Array(items))) = alice.get("list").await.unwrap() else {
        panic!("list is not an array");
    };
    assert!((1..=2).contains(&items.len()), "unexpected length {}", items.len());
    assert!(items
        .iter()
        .all(|item| *item == json!("from-alice") || *item == json!("from-bob")));
}

#[tokio::test(start_paused = true)]
async fn list_skips_tombstones_and_query_filters() {
    let hub = MemoryTransport::new();
    let kv = store(&hub, &ManualClock::new(0), false);

    kv.set("a", 1i64).await.unwrap();
    kv.set("b", "two").await.unwrap();
    kv.set("c", true).await.unwrap();
    kv.delete("b").await.unwrap();

    let listed = kv.list().await;
    assert_eq!(listed.keys().cloned().collect::<Vec<_>>(), vec!["a", "c"]);

    let numbers = kv.query(|_, value| value.as_f64().is_some()).await;
    assert_eq!(numbers, vec![("a".to_string(), KvValue::Number(1.0))]);

    assert_eq!(kv.clear().await.unwrap(), 2);
    assert!(kv.list().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn watch_delivers_current_value_and_later_updates() {
    let hub = MemoryTransport::new();
    let writer = store(&hub, &ManualClock::new(0), false);
    let watcher = store(&hub.peer(), &ManualClock::new(0), false);
    writer.set("status", "draft").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = watcher.watch("status", move |value, key| {
        let _ = tx.send((key.to_string(), value));
    });

    assert_eq!(
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten(),
        Some(("status".into(), KvValue::String("draft".into())))
    );

    writer.delete("status").await.unwrap();
    writer.set("status", "final").await.unwrap();
    // The tombstone is not delivered.
    assert_eq!(
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten(),
        Some(("status".into(), KvValue::String("final".into())))
    );
}

#[tokio::test(start_paused = true)]
async fn read_only_store_rejects_writes_but_observes() {
    let hub = MemoryTransport::new();
    let writer = store(&hub, &ManualClock::new(0), false);
    let viewer = store(&hub.peer(), &ManualClock::new(0), true);

    assert_eq!(viewer.set("k", 1i64).await, Err(SyncError::ReadOnly));
    assert_eq!(viewer.delete("k").await, Err(SyncError::ReadOnly));
    assert_eq!(viewer.push("k", 1i64).await, Err(SyncError::ReadOnly));
    assert_eq!(viewer.clear().await, Err(SyncError::ReadOnly));

    writer.set("k", "v").await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(viewer.get("k").await.unwrap(), Some(KvValue::String("v".into())));
}

#[tokio::test(start_paused = true)]
async fn offline_link_surfaces_transport_errors() {
    let hub = MemoryTransport::new();
    let link = hub.peer();
    let kv = store(&link, &ManualClock::new(0), false);

    link.set_offline(true);
    let err = kv.set("k", 1i64).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { .. }));
    assert!(err.is_retryable());

    link.set_offline(false);
    kv.set("k", 1i64).await.unwrap();
    assert_eq!(kv.get("k").await.unwrap(), Some(KvValue::Number(1.0)));
}
