use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use codemate_sync::clock::{self, ManualClock};
use codemate_sync::kv::{KvEntry, KvValue, ReplicatedStore};
use codemate_sync::storage::{EngineState, SqlDatabase, SqlParams, SqlValue, SNAPSHOT_KEY};
use codemate_sync::{MemoryTransport, Notifier, SessionEvent, SyncError, TransportPath};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, timeout};

const T0: i64 = 1_700_000_000_000;

fn root() -> TransportPath {
    TransportPath::from_segments(["CodeMate", "k3j9x2"])
}

async fn open_db(
    transport: &MemoryTransport,
    clock: &Arc<ManualClock>,
    notifier: Notifier,
    read_only: bool,
) -> SqlDatabase {
    let store = ReplicatedStore::new(
        Arc::new(transport.clone()),
        root(),
        clock.clone(),
        Duration::from_millis(100),
        read_only,
    );
    SqlDatabase::open(store, notifier, Duration::from_secs(10)).await
}

fn snapshot(transport: &MemoryTransport) -> Option<KvEntry> {
    transport
        .graph()
        .get(&root().child(SNAPSHOT_KEY))
        .and_then(|raw| KvEntry::from_wire(&raw))
}

fn plant(transport: &MemoryTransport, encoded: &str, timestamp: i64) {
    let entry = KvEntry::new(KvValue::String(encoded.to_string()), timestamp);
    transport
        .graph()
        .apply(root().child(SNAPSHOT_KEY), Some(entry.to_wire()), None);
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

async fn rows(db: &SqlDatabase, sql: &str) -> Vec<Vec<SqlValue>> {
    db.query(sql)
        .await
        .unwrap()
        .into_iter()
        .next()
        .map(|result| result.values)
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_room_gets_default_schema_and_a_published_snapshot() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let db = open_db(&hub, &clock, Notifier::new(), false).await;

    assert_eq!(db.state(), EngineState::Ready);
    db.wait_ready().await.unwrap();
    assert_eq!(db.tables().await.unwrap(), vec!["kv_store".to_string()]);

    let entry = snapshot(&hub).expect("snapshot published");
    assert_eq!(entry.timestamp, T0);
    let encoded = entry.value.as_str().unwrap();
    assert!(STANDARD.decode(encoded).unwrap().starts_with(b"SQLite format 3\0"));
    assert_eq!(db.stamp().map(|s| s.timestamp), Some(T0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutations_replicate_to_other_peers() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let alice = open_db(&hub, &clock, Notifier::new(), false).await;

    let bob_events = Notifier::new();
    let mut events = bob_events.subscribe();
    let bob = open_db(&hub.peer(), &clock, bob_events, false).await;
    assert_eq!(bob.state(), EngineState::Ready);

    clock.advance(1_000);
    let outcome = alice
        .exec(
            "CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES (?)",
            SqlParams::Positional(vec![text("hello")]),
        )
        .await
        .unwrap();
    assert!(outcome.mutated);
    assert_eq!(snapshot(&hub).unwrap().timestamp, T0 + 1_000);

    let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, SessionEvent::DatabaseStateChanged);
    assert_eq!(rows(&bob, "SELECT body FROM notes").await, vec![vec![text("hello")]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_to_back_mutations_write_one_snapshot_each() {
    let hub = MemoryTransport::new();
    let store = |transport: &MemoryTransport| {
        ReplicatedStore::new(
            Arc::new(transport.clone()),
            root(),
            clock::system(),
            Duration::from_millis(100),
            false,
        )
    };
    let db = SqlDatabase::open(store(&hub), Notifier::new(), Duration::from_secs(10)).await;
    let peer_events = Notifier::new();
    let mut reloads = peer_events.subscribe();
    let peer = SqlDatabase::open(store(&hub.peer()), peer_events, Duration::from_secs(10)).await;
    assert_eq!(peer.state(), EngineState::Ready);

    let path = root().child(SNAPSHOT_KEY);
    let mut updates = hub.graph().updates();
    for i in 0..3 {
        db.exec(&format!("CREATE TABLE t{i} (a)"), SqlParams::None)
            .await
            .unwrap();
    }
    sleep(Duration::from_secs(1)).await;

    let mut writes = 0;
    loop {
        match updates.try_recv() {
            Ok(update) if update.path == path => writes += 1,
            Ok(_) => {}
            Err(TryRecvError::Lagged(skipped)) => writes += skipped as usize,
            Err(_) => break,
        }
    }
    assert_eq!(writes, 3);

    let mut reloaded = 0;
    while let Ok(event) = reloads.try_recv() {
        if event == SessionEvent::DatabaseStateChanged {
            reloaded += 1;
        }
    }
    assert!((1..=3).contains(&reloaded), "peer reloaded {reloaded} times");
    assert!(peer.tables().await.unwrap().contains(&"t2".to_string()));
    assert_eq!(peer.stamp(), db.stamp());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_do_not_republish() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let db = open_db(&hub, &clock, Notifier::new(), false).await;

    clock.advance(1_000);
    let outcome = db.exec("SELECT 1", SqlParams::None).await.unwrap();
    assert!(!outcome.mutated);
    assert_eq!(outcome.results[0].values, vec![vec![SqlValue::Integer(1)]]);
    assert_eq!(snapshot(&hub).unwrap().timestamp, T0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_snapshot_is_ignored_and_overwritten() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let db = open_db(&hub, &clock, Notifier::new(), false).await;
    let original = snapshot(&hub).unwrap();

    clock.advance(1_000);
    db.exec("CREATE TABLE t (x INTEGER)", SqlParams::None).await.unwrap();

    plant(&hub, original.value.as_str().unwrap(), T0);
    let republished = timeout(Duration::from_secs(5), async {
        loop {
            if snapshot(&hub).is_some_and(|entry| entry.timestamp >= T0 + 1_000) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(republished.is_ok(), "local snapshot was not republished");
    assert!(db.tables().await.unwrap().contains(&"t".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_remote_snapshot_keeps_local_state() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let db = open_db(&hub, &clock, Notifier::new(), false).await;
    db.set("kept", "yes").await.unwrap();

    plant(&hub, "%%% not base64 %%%", T0 + 5_000);
    let garbage = STANDARD.encode(vec![b'x'; 4096]);
    plant(&hub, &garbage, T0 + 6_000);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(db.state(), EngineState::Ready);
    assert_eq!(db.get("kept").await.unwrap(), Some(KvValue::String("yes".into())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreadable_snapshot_at_startup_disables_sql() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    plant(&hub, &STANDARD.encode(vec![b'x'; 4096]), T0);

    let db = open_db(&hub, &clock, Notifier::new(), false).await;
    assert!(matches!(db.state(), EngineState::Error(_)));
    assert!(!db.is_available());
    assert!(matches!(
        db.query("SELECT 1").await,
        Err(SyncError::EngineUnavailable(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_snapshot_at_startup_starts_empty() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    plant(&hub, "%%% not base64 %%%", T0);

    let db = open_db(&hub, &clock, Notifier::new(), false).await;
    assert_eq!(db.state(), EngineState::Ready);
    assert_eq!(db.tables().await.unwrap(), vec!["kv_store".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_room_loads_but_rejects_mutations() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let writer = open_db(&hub, &clock, Notifier::new(), false).await;
    writer.set("greeting", "hi").await.unwrap();
    let published = snapshot(&hub).unwrap();

    let viewer = open_db(&hub.peer(), &clock, Notifier::new(), true).await;
    assert_eq!(viewer.get("greeting").await.unwrap(), Some(KvValue::String("hi".into())));
    assert_eq!(
        viewer.exec("DELETE FROM kv_store", SqlParams::None).await,
        Err(SyncError::ReadOnly)
    );
    assert_eq!(viewer.reset().await, Err(SyncError::ReadOnly));
    assert_eq!(snapshot(&hub), Some(published));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kv_table_round_trips_typed_values() {
    let hub = MemoryTransport::new();
    let db = open_db(&hub, &ManualClock::new(T0), Notifier::new(), false).await;

    db.set("name", "Ada").await.unwrap();
    db.set("age", 36i64).await.unwrap();
    db.set("admin", true).await.unwrap();
    db.set("tags", KvValue::Json(serde_json::json!(["a", "b"]))).await.unwrap();
    db.set("age", 37i64).await.unwrap();

    assert_eq!(db.get("age").await.unwrap(), Some(KvValue::Number(37.0)));
    assert_eq!(db.get("admin").await.unwrap(), Some(KvValue::Boolean(true)));
    assert_eq!(
        db.get("tags").await.unwrap(),
        Some(KvValue::Json(serde_json::json!(["a", "b"])))
    );
    assert_eq!(db.list().await.unwrap().len(), 4);

    db.delete("name").await.unwrap();
    assert_eq!(db.get("name").await.unwrap(), None);
    assert_eq!(db.list().await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_drops_user_tables() {
    let hub = MemoryTransport::new();
    let db = open_db(&hub, &ManualClock::new(T0), Notifier::new(), false).await;
    db.exec("CREATE TABLE \"odd\"\"name\" (x); CREATE TABLE other (y)", SqlParams::None)
        .await
        .unwrap();
    db.set("k", "v").await.unwrap();

    db.reset().await.unwrap();
    assert_eq!(db.tables().await.unwrap(), vec!["kv_store".to_string()]);
    assert_eq!(db.get("k").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_reloads_from_the_room_snapshot() {
    let hub = MemoryTransport::new();
    let db = open_db(&hub, &ManualClock::new(T0), Notifier::new(), false).await;
    db.set("survives", "restart").await.unwrap();

    db.shutdown();
    assert!(matches!(db.get("survives").await, Err(SyncError::EngineUnavailable(_))));

    db.restart().await.unwrap();
    assert_eq!(db.state(), EngineState::Ready);
    assert_eq!(
        db.get("survives").await.unwrap(),
        Some(KvValue::String("restart".into()))
    );
}
