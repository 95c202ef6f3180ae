//! # CodeMate Sync - Real-Time Collaboration Core
//!
//! Synchronization engine for a multi-user code editor. Peers in a room share
//! state through a replicated key-value graph reached over a relay.
//!
//! ## Features
//!
//! - **Replicated key-value store**: last-writer-wins values with type tags and timestamps
//! - **Presence**: heartbeats, idle eviction and per-document "who is editing"
//! - **Document replication**: debounced writes with cursor-preserving remote updates
//! - **SQL snapshots**: an embedded SQLite database replicated as a whole image
//! - **Read-only rooms**: `view-` links observe without writing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use codemate_sync::{clock, MemoryTransport, RoomId, Session, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(MemoryTransport::new());
//!     let session = Session::start(
//!         transport,
//!         RoomId::parse("k3j9x2"),
//!         SyncConfig::default(),
//!         clock::system(),
//!     )
//!     .await;
//!
//!     session.join("Alice").await?;
//!     session.kv().set("greeting", "hello").await?;
//!     session.files().create("index.html", None).await?;
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod kv;
pub mod presence;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;
pub mod terminal;
pub mod timer;

// Re-export main types for library consumers
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use events::{Notifier, SessionEvent};
pub use files::{Document, FileReplicator};
pub use kv::{KvEntry, KvValue, ReplicatedStore};
pub use presence::{Peer, PresenceRegistry};
pub use room::RoomId;
pub use session::Session;
pub use storage::SqlDatabase;
pub use sync::{MemoryTransport, RemoteTransport, SharedTransport, Transport, TransportPath};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
