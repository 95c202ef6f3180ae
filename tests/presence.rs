use std::sync::Arc;
use std::time::Duration;

use codemate_sync::clock::{Clock, ManualClock};
use codemate_sync::kv::{KvEntry, KvValue, ReplicatedStore};
use codemate_sync::presence::{Peer, PresenceRegistry, PALETTE};
use codemate_sync::{MemoryTransport, Notifier, SessionEvent, SyncConfig, SyncError, TransportPath};
use tokio::time::sleep;

const T0: i64 = 1_700_000_000_000;

fn users() -> TransportPath {
    TransportPath::from_segments(["CodeMate", "k3j9x2", "users"])
}

fn registry(transport: &MemoryTransport, clock: &Arc<ManualClock>, read_only: bool) -> PresenceRegistry {
    let store = ReplicatedStore::new(
        Arc::new(transport.clone()),
        users(),
        clock.clone(),
        Duration::from_millis(100),
        read_only,
    );
    PresenceRegistry::start(store, clock.clone(), Notifier::new(), &SyncConfig::default())
}

/// Write a peer record straight to the transport, as a departed client would
/// have left it.
fn plant(transport: &MemoryTransport, peer: &Peer, timestamp: i64) {
    let entry = KvEntry::new(KvValue::Json(peer.to_record()), timestamp);
    transport
        .graph()
        .apply(users().child(peer.id.clone()), Some(entry.to_wire()), None);
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn peers_see_each_other_with_distinct_colors() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let alice = registry(&hub, &clock, false);
    let bob = registry(&hub.peer(), &clock, false);

    let a = alice.join("Alice").await.unwrap();
    settle().await;
    clock.advance(1);
    let b = bob.join("Bob").await.unwrap();
    settle().await;

    assert_eq!(a.color, PALETTE[0]);
    assert_eq!(b.color, PALETTE[1]);
    let names: Vec<String> = alice.peers().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
    assert_eq!(bob.peer(&a.id).map(|p| p.name), Some("Alice".to_string()));
    assert_eq!(alice.me().map(|p| p.id), Some(a.id));
}

#[tokio::test(start_paused = true)]
async fn active_file_drives_editors_of() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let alice = registry(&hub, &clock, false);
    let bob = registry(&hub.peer(), &clock, false);
    alice.join("Alice").await.unwrap();
    bob.join("Bob").await.unwrap();

    alice.set_active_file(Some("index.html")).await.unwrap();
    settle().await;

    let editors: Vec<String> = bob.editors_of("index.html").into_iter().map(|p| p.name).collect();
    assert_eq!(editors, vec!["Alice"]);
    assert!(bob.editors_of("style.css").is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_evicted_and_tombstoned() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let bob = registry(&hub, &clock, false);
    bob.join("Bob").await.unwrap();

    let ghost = Peer::new("ghost", "Ghost", PALETTE[3], T0);
    plant(&hub, &ghost, T0);
    settle().await;
    assert!(bob.peer("ghost").is_some());

    clock.advance(10_000);
    assert!(bob.sweep().await.is_empty());

    clock.advance(6_000);
    assert_eq!(bob.sweep().await, vec!["ghost".to_string()]);
    assert!(bob.peer("ghost").is_none());
    assert_eq!(hub.graph().get(&users().child("ghost")), None);
    // Our own record survives any sweep.
    assert!(bob.me().is_some());
}

#[tokio::test(start_paused = true)]
async fn hidden_and_blurred_peers_get_grace_periods() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let bob = registry(&hub, &clock, false);

    let mut hidden = Peer::new("hidden", "Hidden", PALETTE[4], T0);
    hidden.potentially_left = Some(T0);
    let mut blurred = Peer::new("blurred", "Blurred", PALETTE[5], T0);
    blurred.window_blurred = Some(T0);
    plant(&hub, &hidden, T0);
    plant(&hub, &blurred, T0);
    settle().await;

    // Keep both fresh so only the grace periods apply.
    clock.advance(11_000);
    hidden.last_active = Some(clock_now(&clock));
    blurred.last_active = Some(clock_now(&clock));
    plant(&hub, &hidden, clock_now(&clock));
    plant(&hub, &blurred, clock_now(&clock));
    settle().await;

    assert_eq!(bob.sweep().await, vec!["hidden".to_string()]);

    clock.advance(20_000);
    blurred.last_active = Some(clock_now(&clock));
    plant(&hub, &blurred, clock_now(&clock));
    settle().await;
    assert_eq!(bob.sweep().await, vec!["blurred".to_string()]);
}

fn clock_now(clock: &Arc<ManualClock>) -> i64 {
    clock.now_ms()
}

#[tokio::test(start_paused = true)]
async fn leave_tombstones_our_record() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let alice = registry(&hub, &clock, false);
    let bob = registry(&hub.peer(), &clock, false);

    let a = alice.join("Alice").await.unwrap();
    settle().await;
    assert!(bob.peer(&a.id).is_some());

    alice.leave().await.unwrap();
    settle().await;
    assert!(!alice.is_joined());
    assert!(bob.peer(&a.id).is_none());
    assert_eq!(hub.graph().get(&users().child(a.id)), None);
}

#[tokio::test(start_paused = true)]
async fn read_only_viewer_observes_without_joining() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let alice = registry(&hub, &clock, false);
    let viewer = registry(&hub.peer(), &clock, true);

    assert_eq!(viewer.join("Viewer").await, Err(SyncError::ReadOnly));
    alice.join("Alice").await.unwrap();
    settle().await;
    assert_eq!(viewer.peers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn peer_list_changes_are_notified() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let notifier = Notifier::new();
    let mut events = notifier.subscribe();
    let store = ReplicatedStore::new(
        Arc::new(hub.clone()),
        users(),
        clock.clone(),
        Duration::from_millis(100),
        false,
    );
    let registry = PresenceRegistry::start(store, clock.clone(), notifier, &SyncConfig::default());

    plant(&hub, &Peer::new("p1", "Remote", PALETTE[2], T0), T0);
    settle().await;
    assert_eq!(events.try_recv().unwrap(), SessionEvent::PeerListChanged);
    assert_eq!(registry.peers().len(), 1);
}

/// A peer's record as the transport currently holds it.
fn published(transport: &MemoryTransport, id: &str) -> Option<Peer> {
    let raw = transport.graph().get(&users().child(id))?;
    Peer::from_record(&KvEntry::from_wire(&raw)?.value.to_json())
}

#[tokio::test(start_paused = true)]
async fn visibility_and_focus_flags_publish_immediately() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let alice = registry(&hub, &clock, false);
    let bob = registry(&hub.peer(), &clock, false);
    let a = alice.join("Alice").await.unwrap();
    settle().await;

    clock.advance(2_000);
    alice.set_visibility(false).await.unwrap();
    assert_eq!(published(&hub, &a.id).unwrap().potentially_left, Some(T0 + 2_000));
    alice.set_focus(false).await.unwrap();
    assert_eq!(published(&hub, &a.id).unwrap().window_blurred, Some(T0 + 2_000));
    settle().await;
    let seen = bob.peer(&a.id).unwrap();
    assert_eq!(seen.potentially_left, Some(T0 + 2_000));
    assert_eq!(seen.window_blurred, Some(T0 + 2_000));

    clock.advance(1_000);
    alice.set_visibility(true).await.unwrap();
    let record = published(&hub, &a.id).unwrap();
    assert_eq!(record.potentially_left, None);
    assert_eq!(record.last_active, Some(T0 + 3_000));

    clock.advance(1_000);
    alice.set_focus(true).await.unwrap();
    settle().await;
    let seen = bob.peer(&a.id).unwrap();
    assert_eq!(seen.window_blurred, None);
    assert_eq!(seen.potentially_left, None);
    assert_eq!(seen.last_active, Some(T0 + 4_000));
}

#[tokio::test(start_paused = true)]
async fn record_filed_under_another_key_is_rejected() {
    let hub = MemoryTransport::new();
    let clock = ManualClock::new(T0);
    let bob = registry(&hub, &clock, false);

    let impostor = Peer::new("p2", "Impostor", PALETTE[1], T0);
    let entry = KvEntry::new(KvValue::Json(impostor.to_record()), T0);
    assert!(!bob.apply_remote("p1", Some(&entry.to_wire())));
    assert!(bob.peers().is_empty());

    assert!(bob.apply_remote("p2", Some(&entry.to_wire())));
    assert!(bob.apply_remote("p2", None));
    assert!(bob.peers().is_empty());
}
