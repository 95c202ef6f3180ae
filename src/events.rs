//! Notification surface consumed by the UI layer.

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A peer joined, left, was evicted, or changed its record
    PeerListChanged,
    /// A document was discovered or its content changed remotely
    DocumentChanged(String),
    /// The SQL engine reloaded from a remote snapshot
    DatabaseStateChanged,
}

/// Broadcast hub for [`SessionEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SessionEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of listeners that received the event.
    pub fn notify(&self, event: SessionEvent) -> usize {
        tracing::trace!(?event, "session event");
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.tx.receiver_count())
            .finish()
    }
}
