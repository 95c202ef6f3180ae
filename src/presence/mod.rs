//! Presence registry: who is in the room, what they are editing, and whether
//! they are still around.
//!
//! Each peer owns its record under `users/<id>` and republishes it on a
//! heartbeat. Every replica sweeps for stale peers independently and
//! tombstones the ones it evicts; concurrent evictions of the same peer write
//! the same tombstone, so replicas converge without a coordinator.

pub mod peer;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{Notifier, SessionEvent};
use crate::kv::{KvEntry, KvValue, ReplicatedStore};
use crate::timer::{self, TaskHandle};

pub use peer::{pick_color, EvictReason, LivenessWindows, Peer, PALETTE};

/// Child scope of the room that holds peer records.
pub const USERS_KEY: &str = "users";

pub struct PresenceRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    store: ReplicatedStore,
    clock: SharedClock,
    notifier: Notifier,
    windows: LivenessWindows,
    heartbeat_every: Duration,
    peers: RwLock<HashMap<String, Peer>>,
    me: RwLock<Option<String>>,
    heartbeat: Mutex<Option<TaskHandle>>,
    background: Mutex<Vec<TaskHandle>>,
}

impl PresenceRegistry {
    /// Start observing `store` (scoped to the room's `users` child) and
    /// sweeping for stale peers. Must be called inside a tokio runtime.
    pub fn start(
        store: ReplicatedStore,
        clock: SharedClock,
        notifier: Notifier,
        config: &SyncConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            store,
            clock,
            notifier,
            windows: LivenessWindows::from(config),
            heartbeat_every: config.heartbeat_interval(),
            peers: RwLock::new(HashMap::new()),
            me: RwLock::new(None),
            heartbeat: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let watcher = inner.store.watch_children(move |peer_id, entry| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_remote(&peer_id, entry);
            }
        });

        let weak = Arc::downgrade(&inner);
        let sweeper = timer::every(config.sweep_interval(), move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.sweep().await;
                        true
                    }
                    None => false,
                }
            }
        });

        inner.background.lock().extend([watcher, sweeper]);
        Self { inner }
    }

    /// Register ourselves, publish the record and start the heartbeat.
    pub async fn join(&self, name: &str) -> SyncResult<Peer> {
        let inner = &self.inner;
        if inner.store.is_read_only() {
            return Err(SyncError::ReadOnly);
        }
        if let Some(me) = self.me() {
            return Ok(me);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let color = {
            let peers = inner.peers.read();
            pick_color(peers.values().map(|p| p.color.as_str()), &id)
        };
        let peer = Peer::new(id.clone(), name, color, inner.clock.now_ms());

        inner.peers.write().insert(id.clone(), peer.clone());
        *inner.me.write() = Some(id);
        inner.notifier.notify(SessionEvent::PeerListChanged);
        inner.publish(&peer).await;

        let weak: Weak<Inner> = Arc::downgrade(inner);
        let heartbeat = timer::every(inner.heartbeat_every, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.heartbeat().await,
                    None => false,
                }
            }
        });
        *inner.heartbeat.lock() = Some(heartbeat);

        tracing::info!(peer = %peer.id, name = %peer.name, color = %peer.color, "joined room");
        Ok(peer)
    }

    /// Apply a remote record for `peer_id`. Returns whether the list changed.
    pub fn apply_remote(&self, peer_id: &str, record: Option<&serde_json::Value>) -> bool {
        let entry = record.and_then(|raw| {
            KvEntry::from_wire(raw).or_else(|| {
                Peer::from_record(raw).map(|peer| KvEntry::new(KvValue::Json(peer.to_record()), 0))
            })
        });
        self.inner.apply_remote(peer_id, entry)
    }

    /// Evict stale peers. Returns the evicted ids.
    pub async fn sweep(&self) -> Vec<String> {
        self.inner.sweep().await
    }

    /// Tab visibility changed.
    pub async fn set_visibility(&self, visible: bool) -> SyncResult<()> {
        let now = self.inner.clock.now_ms();
        self.inner
            .update_me(|peer| {
                if visible {
                    peer.potentially_left = None;
                    peer.last_active = Some(now);
                } else {
                    peer.potentially_left = Some(now);
                }
            })
            .await
    }

    /// Window focus changed.
    pub async fn set_focus(&self, focused: bool) -> SyncResult<()> {
        let now = self.inner.clock.now_ms();
        self.inner
            .update_me(|peer| {
                if focused {
                    peer.window_blurred = None;
                    peer.last_active = Some(now);
                } else {
                    peer.window_blurred = Some(now);
                }
            })
            .await
    }

    pub async fn set_active_file(&self, document: Option<&str>) -> SyncResult<()> {
        let now = self.inner.clock.now_ms();
        let document = document.map(str::to_string);
        self.inner
            .update_me(move |peer| {
                peer.active_file = document;
                peer.last_active = Some(now);
            })
            .await
    }

    /// Peers currently editing `document`, ourselves included.
    pub fn editors_of(&self, document: &str) -> Vec<Peer> {
        self.peers()
            .into_iter()
            .filter(|peer| peer.active_file.as_deref() == Some(document))
            .collect()
    }

    /// Tombstone our record and stop the heartbeat.
    pub async fn leave(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let Some(id) = inner.me.write().take() else {
            return Ok(());
        };
        inner.heartbeat.lock().take();
        inner.peers.write().remove(&id);
        inner.notifier.notify(SessionEvent::PeerListChanged);
        tracing::info!(peer = %id, "left room");
        inner.store.delete(&id).await
    }

    /// Known peers, oldest first.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.inner.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.join_time.cmp(&b.join_time).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.inner.peers.read().get(id).cloned()
    }

    pub fn me(&self) -> Option<Peer> {
        let id = self.inner.me.read().clone()?;
        self.peer(&id)
    }

    pub fn is_joined(&self) -> bool {
        self.inner.me.read().is_some()
    }
}

impl Inner {
    fn my_id(&self) -> Option<String> {
        self.me.read().clone()
    }

    fn apply_remote(&self, peer_id: &str, entry: Option<KvEntry>) -> bool {
        // Our own record is authoritative locally; the heartbeat restores it
        // if someone else tombstoned it.
        if self.my_id().as_deref() == Some(peer_id) {
            return false;
        }

        // A record filed under another peer's key is treated as invalid.
        let peer = entry
            .and_then(|entry| Peer::from_record(&entry.value.to_json()))
            .filter(|peer| peer.id == peer_id);
        let changed = match peer {
            Some(peer) => {
                let mut peers = self.peers.write();
                if peers.get(&peer.id) == Some(&peer) {
                    false
                } else {
                    tracing::debug!(peer = %peer.id, name = %peer.name, "peer updated");
                    peers.insert(peer.id.clone(), peer);
                    true
                }
            }
            None => {
                let removed = self.peers.write().remove(peer_id).is_some();
                if removed {
                    tracing::debug!(peer = %peer_id, "peer removed");
                }
                removed
            }
        };

        if changed {
            self.notifier.notify(SessionEvent::PeerListChanged);
        }
        changed
    }

    async fn sweep(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let me = self.my_id();

        let evicted: Vec<(String, EvictReason)> = {
            let mut peers = self.peers.write();
            let doomed: Vec<(String, EvictReason)> = peers
                .values()
                .filter(|peer| me.as_deref() != Some(peer.id.as_str()))
                .filter_map(|peer| {
                    peer.eviction_reason(now, &self.windows)
                        .map(|reason| (peer.id.clone(), reason))
                })
                .collect();
            for (id, _) in &doomed {
                peers.remove(id);
            }
            doomed
        };

        if evicted.is_empty() {
            return Vec::new();
        }
        self.notifier.notify(SessionEvent::PeerListChanged);

        for (id, reason) in &evicted {
            tracing::info!(peer = %id, ?reason, "evicting peer");
            if !self.store.is_read_only() {
                // Failures are logged by the store; the next sweep retries.
                let _ = self.store.delete(id).await;
            }
        }
        evicted.into_iter().map(|(id, _)| id).collect()
    }

    /// Returns `false` once we have left, which stops the heartbeat loop.
    async fn heartbeat(&self) -> bool {
        let now = self.clock.now_ms();
        let peer = {
            let Some(id) = self.my_id() else {
                return false;
            };
            let mut peers = self.peers.write();
            let Some(peer) = peers.get_mut(&id) else {
                return false;
            };
            peer.last_active = Some(now);
            peer.clone()
        };
        self.publish(&peer).await;
        true
    }

    async fn update_me<F>(&self, change: F) -> SyncResult<()>
    where
        F: FnOnce(&mut Peer),
    {
        if self.store.is_read_only() {
            return Err(SyncError::ReadOnly);
        }
        let peer = {
            let Some(id) = self.my_id() else {
                return Ok(());
            };
            let mut peers = self.peers.write();
            let Some(peer) = peers.get_mut(&id) else {
                return Ok(());
            };
            change(peer);
            peer.clone()
        };
        self.notifier.notify(SessionEvent::PeerListChanged);
        self.store
            .set(&peer.id, KvValue::Json(peer.to_record()))
            .await
            .map(|_| ())
    }

    async fn publish(&self, peer: &Peer) {
        // Transport failures are already logged; the next heartbeat retries.
        let _ = self.store.set(&peer.id, KvValue::Json(peer.to_record())).await;
    }
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        self.inner.heartbeat.lock().take();
        self.inner.background.lock().clear();
    }
}
