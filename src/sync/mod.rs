pub mod graph;
pub mod protocol;
pub mod remote;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::SyncResult;

pub use graph::{Graph, GraphUpdate, MemoryTransport};
pub use protocol::SyncMessage;
pub use remote::RemoteTransport;

// Replication transport seam: a peer-synchronized path -> value store with
// push-based subscriptions. Every replicated component (key-value store,
// presence, documents, SQL snapshots) talks to peers only through this trait.

/// Value stream for one path. `None` is a tombstone.
pub type ValueStream = BoxStream<'static, Option<Value>>;

/// Update stream for the direct children of one path.
pub type ChildStream = BoxStream<'static, (String, Option<Value>)>;

pub trait Transport: Send + Sync + 'static {
    /// Write a value (or a tombstone) and resolve once the write is acknowledged.
    fn put(&self, path: &TransportPath, value: Option<Value>) -> BoxFuture<'_, SyncResult<()>>;

    /// Read the current value once.
    fn once(&self, path: &TransportPath) -> BoxFuture<'_, SyncResult<Option<Value>>>;

    /// Current value (if any), then every later update of exactly `path`.
    fn subscribe(&self, path: &TransportPath) -> ValueStream;

    /// Every existing direct child of `path`, then every later child update.
    fn map_on(&self, path: &TransportPath) -> ChildStream;
}

pub type SharedTransport = Arc<dyn Transport>;

/// Segmented transport path, e.g. `CodeMate/k3j9x2/users/<peer>`.
///
/// Segments are kept apart so that names containing `/` stay a single key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportPath(Vec<String>);

impl TransportPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &TransportPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The child segment if `self` sits exactly one level below `parent`.
    pub fn child_of(&self, parent: &TransportPath) -> Option<&str> {
        if self.0.len() == parent.0.len() + 1 && self.starts_with(parent) {
            self.last()
        } else {
            None
        }
    }
}

impl fmt::Display for TransportPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}
