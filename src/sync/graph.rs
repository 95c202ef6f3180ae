//! In-memory replicated graph: path -> value map plus a broadcast update feed.
//!
//! Backs the in-process transport, the relay client's local mirror and the
//! relay server's state.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{ChildStream, Transport, TransportPath, ValueStream};
use crate::error::{SyncError, SyncResult};

const UPDATE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct GraphUpdate {
    pub path: TransportPath,
    pub value: Option<Value>,
    /// Relay connection that produced the write, if any
    pub origin: Option<u64>,
}

pub struct Graph {
    entries: DashMap<TransportPath, Value>,
    updates: broadcast::Sender<GraphUpdate>,
}

impl Graph {
    pub fn new() -> Self {
        let (updates, _rx) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            entries: DashMap::new(),
            updates,
        }
    }

    /// Store a value (or drop it on tombstone) and broadcast the update.
    pub fn apply(&self, path: TransportPath, value: Option<Value>, origin: Option<u64>) {
        match &value {
            Some(v) if !v.is_null() => {
                self.entries.insert(path.clone(), v.clone());
            }
            _ => {
                self.entries.remove(&path);
            }
        }
        let value = value.filter(|v| !v.is_null());
        let _ = self.updates.send(GraphUpdate {
            path,
            value,
            origin,
        });
    }

    pub fn get(&self, path: &TransportPath) -> Option<Value> {
        self.entries.get(path).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live direct children of `parent`, sorted by key.
    pub fn children(&self, parent: &TransportPath) -> Vec<(String, Value)> {
        let mut children: Vec<(String, Value)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .child_of(parent)
                    .map(|key| (key.to_string(), entry.value().clone()))
            })
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    /// Every live entry at or below `prefix`.
    pub fn entries_under(&self, prefix: &TransportPath) -> Vec<(TransportPath, Value)> {
        let mut entries: Vec<(TransportPath, Value)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn updates(&self) -> broadcast::Receiver<GraphUpdate> {
        self.updates.subscribe()
    }

    pub fn watch_path(&self, path: &TransportPath) -> ValueStream {
        // Subscribe before reading so nothing falls between the two.
        let rx = self.updates.subscribe();
        let current = self.get(path);
        let path = path.clone();

        let live = futures::stream::unfold(rx, move |mut rx| {
            let path = path.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(update) if update.path == path => return Some((update.value, rx)),
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%path, skipped, "subscriber lagged behind updates");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        futures::stream::iter(current.map(Some)).chain(live).boxed()
    }

    pub fn watch_children(&self, parent: &TransportPath) -> ChildStream {
        let rx = self.updates.subscribe();
        let current: Vec<(String, Option<Value>)> = self
            .children(parent)
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect();
        let parent = parent.clone();

        let live = futures::stream::unfold(rx, move |mut rx| {
            let parent = parent.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(update) => {
                            if let Some(key) = update.path.child_of(&parent) {
                                return Some(((key.to_string(), update.value), rx));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%parent, skipped, "child subscriber lagged behind updates");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        futures::stream::iter(current).chain(live).boxed()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process transport. Every handle obtained through [`MemoryTransport::peer`]
/// behaves like a separate replica connected to the same relay.
#[derive(Clone)]
pub struct MemoryTransport {
    graph: Arc<Graph>,
    offline: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            graph: Arc::new(Graph::new()),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Another replica on the same in-memory relay, with its own link state.
    pub fn peer(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate losing (or regaining) the link: reads and writes fail while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    fn check_link(&self, path: &TransportPath) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::transport(path, "link offline"))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn put(&self, path: &TransportPath, value: Option<Value>) -> BoxFuture<'_, SyncResult<()>> {
        let result = self.check_link(path).map(|()| {
            self.graph.apply(path.clone(), value, None);
        });
        futures::future::ready(result).boxed()
    }

    fn once(&self, path: &TransportPath) -> BoxFuture<'_, SyncResult<Option<Value>>> {
        let result = self.check_link(path).map(|()| self.graph.get(path));
        futures::future::ready(result).boxed()
    }

    fn subscribe(&self, path: &TransportPath) -> ValueStream {
        self.graph.watch_path(path)
    }

    fn map_on(&self, path: &TransportPath) -> ChildStream {
        self.graph.watch_children(path)
    }
}
