//! One client's view of one room: every engine wired to a shared transport.

use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{Notifier, SessionEvent};
use crate::files::{Document, FileReplicator};
use crate::kv::{KvValue, ReplicatedStore};
use crate::presence::{Peer, PresenceRegistry, USERS_KEY};
use crate::room::RoomId;
use crate::storage::{cell_to_kv, quote_ident, SqlDatabase, SqlParams, SqlValue};
use crate::sync::{SharedTransport, TransportPath};

/// Room-root child that holds the key-value store.
pub const DATABASE_KEY: &str = "database";

/// SQL table that receives key-value exports.
pub const EXPORT_TABLE: &str = "nosql_export";

/// Prefix for keys imported from SQL rows.
pub const IMPORT_PREFIX: &str = "sql_";

pub struct Session {
    room: RoomId,
    config: SyncConfig,
    root: TransportPath,
    notifier: Notifier,
    kv: ReplicatedStore,
    presence: PresenceRegistry,
    files: FileReplicator,
    sql: Option<SqlDatabase>,
}

impl Session {
    /// Wire up every engine for `room` and start following it.
    ///
    /// The SQL database is optional: if its engine cannot start, the session
    /// runs without it and [`sql`](Self::sql) reports `EngineUnavailable`.
    pub async fn start(
        transport: SharedTransport,
        room: RoomId,
        config: SyncConfig,
        clock: SharedClock,
    ) -> Self {
        let root = room.root(&config.namespace);
        let read_only = room.is_read_only();
        let notifier = Notifier::new();

        let base = ReplicatedStore::new(
            transport.clone(),
            root.clone(),
            clock.clone(),
            config.list_settle(),
            read_only,
        );
        let kv = base.rescoped(root.child(DATABASE_KEY));
        let presence = PresenceRegistry::start(
            base.rescoped(root.child(USERS_KEY)),
            clock,
            notifier.clone(),
            &config,
        );
        let files = FileReplicator::new(
            transport,
            root.clone(),
            notifier.clone(),
            config.edit_debounce(),
            read_only,
        );
        files.start_discovery();

        let sql = SqlDatabase::open(base, notifier.clone(), config.engine_ready_timeout()).await;
        let sql = match sql.state() {
            state if state.is_ready() => Some(sql),
            state => {
                tracing::error!(?state, "SQL database disabled for this session");
                None
            }
        };

        tracing::info!(room = %room, "session started");
        Self {
            room,
            config,
            root,
            notifier,
            kv,
            presence,
            files,
            sql,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn root(&self) -> &TransportPath {
        &self.root
    }

    pub fn is_read_only(&self) -> bool {
        self.room.is_read_only()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    pub fn kv(&self) -> &ReplicatedStore {
        &self.kv
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn files(&self) -> &FileReplicator {
        &self.files
    }

    pub fn sql(&self) -> SyncResult<&SqlDatabase> {
        self.sql
            .as_ref()
            .ok_or_else(|| SyncError::EngineUnavailable("SQL database is disabled".into()))
    }

    pub async fn join(&self, name: &str) -> SyncResult<Peer> {
        self.presence.join(name).await
    }

    /// Open a document and advertise it as our active file.
    pub async fn open_document(&self, name: &str) -> SyncResult<Document> {
        let doc = self.files.open(name)?;
        if self.presence.is_joined() {
            self.presence.set_active_file(Some(name)).await?;
        }
        Ok(doc)
    }

    /// Copy every live key-value entry into the `nosql_export` SQL table,
    /// replacing rows with the same key. Returns how many were written.
    pub async fn export_kv_to_sql(&self) -> SyncResult<usize> {
        let sql = self.sql()?;
        if self.is_read_only() {
            return Err(SyncError::ReadOnly);
        }
        if !sql.tables().await?.iter().any(|table| table == EXPORT_TABLE) {
            sql.exec(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {EXPORT_TABLE} (
                        key TEXT PRIMARY KEY,
                        value TEXT,
                        type TEXT,
                        original_timestamp DATETIME,
                        exported_at DATETIME DEFAULT CURRENT_TIMESTAMP
                    )"
                ),
                SqlParams::None,
            )
            .await?;
        }

        let rows: Vec<SqlParams> = self
            .kv
            .list()
            .await
            .into_iter()
            .map(|(key, entry)| {
                let value = match &entry.value {
                    KvValue::String(text) => text.clone(),
                    other => other.to_json().to_string(),
                };
                let exported_from = chrono::DateTime::from_timestamp_millis(entry.timestamp)
                    .map(|at| SqlValue::Text(at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)))
                    .unwrap_or(SqlValue::Null);
                SqlParams::Positional(vec![
                    SqlValue::Text(key),
                    SqlValue::Text(value),
                    SqlValue::Text(entry.value.type_tag().to_string()),
                    exported_from,
                ])
            })
            .collect();

        let written = sql
            .exec_each(
                &format!(
                    "INSERT OR REPLACE INTO {EXPORT_TABLE} (key, value, type, original_timestamp)
                     VALUES (?, ?, ?, ?)"
                ),
                rows,
            )
            .await?;
        tracing::info!(entries = written, "key-value store exported to SQL");
        Ok(written)
    }

    /// Copy `key_column` and `value_column` of every row in `table` into the
    /// key-value store as `sql_<key>`. Rows with a `NULL` or blob key or value
    /// are skipped. Returns how many entries were written.
    pub async fn import_sql_to_kv(
        &self,
        table: &str,
        key_column: &str,
        value_column: &str,
    ) -> SyncResult<usize> {
        if self.is_read_only() {
            return Err(SyncError::ReadOnly);
        }
        let query = format!(
            "SELECT {}, {} FROM {}",
            quote_ident(key_column),
            quote_ident(value_column),
            quote_ident(table)
        );
        let results = self.sql()?.query(&query).await?;
        let Some(result) = results.into_iter().next() else {
            return Ok(0);
        };

        let mut imported = 0;
        for row in &result.values {
            let key = match row.first() {
                Some(SqlValue::Text(key)) => key.clone(),
                Some(SqlValue::Integer(key)) => key.to_string(),
                Some(SqlValue::Real(key)) => key.to_string(),
                _ => continue,
            };
            let Some(value) = row.get(1).and_then(cell_to_kv) else {
                continue;
            };
            self.kv.set(&format!("{IMPORT_PREFIX}{key}"), value).await?;
            imported += 1;
        }
        tracing::info!(table, records = imported, "SQL rows imported into the key-value store");
        Ok(imported)
    }

    /// Flush pending edits, leave the room and stop the SQL engine.
    pub async fn shutdown(&self) {
        if !self.is_read_only() {
            if let Err(e) = self.files.flush().await {
                tracing::warn!("could not flush pending edits: {e}");
            }
        }
        if let Err(e) = self.presence.leave().await {
            tracing::warn!("could not leave room cleanly: {e}");
        }
        if let Some(sql) = &self.sql {
            sql.shutdown();
        }
        tracing::info!(room = %self.room, "session closed");
    }
}
