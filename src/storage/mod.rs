//! Embedded SQL engine and its whole-database replication.

pub mod engine;
pub mod snapshot;

/// Room-root key holding the base64 database image.
pub const SNAPSHOT_KEY: &str = "sqlDatabase";

pub use engine::{quote_ident, EngineClient, ExecOutcome, QueryResult, SqlParams, SqlValue};
pub use snapshot::{cell_to_kv, EngineState, SnapshotStamp, SqlDatabase, SqlKvRow, DEFAULT_SCHEMA};
