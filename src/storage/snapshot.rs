//! Whole-database replication for the embedded SQL engine.
//!
//! After every mutating batch the full database image is exported, base64
//! encoded and written under `sqlDatabase` at the room root. Replicas reload
//! the engine wholesale when a newer image shows up. There is no row-level
//! merge: the newest export wins.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use super::engine::{quote_ident, EngineClient, ExecOutcome, QueryResult, SqlParams, SqlValue};
use super::SNAPSHOT_KEY;
use crate::error::{SyncError, SyncResult};
use crate::events::{Notifier, SessionEvent};
use crate::kv::{KvEntry, KvValue, ReplicatedStore};
use crate::timer::TaskHandle;

pub const DEFAULT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT,
    type TEXT,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE TRIGGER IF NOT EXISTS update_kv_store_updated_at
AFTER UPDATE ON kv_store FOR EACH ROW
BEGIN
    UPDATE kv_store SET updated_at = CURRENT_TIMESTAMP WHERE key = OLD.key;
END;
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Constructing,
    LoadingRemote,
    Opening,
    Ready,
    Reloading,
    Error(String),
}

impl EngineState {
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineState::Ready)
    }
}

/// Identity of a replicated image: when it was written and what it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStamp {
    pub timestamp: i64,
    pub fingerprint: String,
}

impl SnapshotStamp {
    pub fn of(timestamp: i64, encoded: &str) -> Self {
        Self {
            timestamp,
            fingerprint: hex::encode(Sha256::digest(encoded.as_bytes())),
        }
    }

    /// Newer timestamp wins; equal timestamps are ordered by fingerprint.
    pub fn supersedes(&self, other: &SnapshotStamp) -> bool {
        (self.timestamp, &self.fingerprint) > (other.timestamp, &other.fingerprint)
    }
}

/// A row of the `kv_store` table.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlKvRow {
    pub key: String,
    pub value: KvValue,
    pub updated_at: Option<String>,
}

pub struct SqlDatabase {
    inner: Arc<Inner>,
}

struct Inner {
    store: ReplicatedStore,
    notifier: Notifier,
    ready_timeout: Duration,
    read_only: bool,
    engine: RwLock<Option<Arc<EngineClient>>>,
    state: watch::Sender<EngineState>,
    stamp: Mutex<Option<SnapshotStamp>>,
    /// Serializes mutate-then-export against reloads
    ops: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<TaskHandle>>,
}

impl SqlDatabase {
    /// Spawn the engine and load the room's replicated snapshot.
    ///
    /// Never fails: if the engine cannot start or the stored image is
    /// rejected, the database ends up in [`EngineState::Error`] and every SQL
    /// call returns `EngineUnavailable`. `store` must be scoped to the room root.
    pub async fn open(
        store: ReplicatedStore,
        notifier: Notifier,
        ready_timeout: Duration,
    ) -> Self {
        let (state, _rx) = watch::channel(EngineState::Constructing);
        let db = Self {
            inner: Arc::new(Inner {
                read_only: store.is_read_only(),
                store,
                notifier,
                ready_timeout,
                engine: RwLock::new(None),
                state,
                stamp: Mutex::new(None),
                ops: tokio::sync::Mutex::new(()),
                watcher: Mutex::new(None),
            }),
        };
        Inner::initialize(&db.inner).await;
        db
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.state(), EngineState::Error(_))
    }

    /// Current snapshot stamp, if any image was adopted or exported.
    pub fn stamp(&self) -> Option<SnapshotStamp> {
        self.inner.stamp.lock().clone()
    }

    /// Resolve once the database is `Ready`, or fail if it ended in `Error`.
    pub async fn wait_ready(&self) -> SyncResult<()> {
        let mut rx = self.inner.state.subscribe();
        let settled = rx
            .wait_for(|state| matches!(state, EngineState::Ready | EngineState::Error(_)))
            .await
            .map(|state| state.clone());
        match settled {
            Ok(EngineState::Ready) => Ok(()),
            Ok(EngineState::Error(reason)) => Err(SyncError::EngineUnavailable(reason)),
            _ => Err(SyncError::EngineUnavailable("database closed".into())),
        }
    }

    /// Run a batch. A batch that changed anything is exported and replicated.
    pub async fn exec(&self, sql: &str, params: SqlParams) -> SyncResult<ExecOutcome> {
        let engine = self.inner.engine()?;
        let _guard = self.inner.ops.lock().await;
        let outcome = engine.exec(sql, params, self.inner.read_only).await?;
        if outcome.mutated {
            self.inner.publish(&engine).await?;
        }
        Ok(outcome)
    }

    /// Run `sql` once per parameter set in a single transaction, then
    /// replicate once. Returns how many sets were applied.
    pub async fn exec_each(&self, sql: &str, rows: Vec<SqlParams>) -> SyncResult<usize> {
        if self.inner.read_only {
            return Err(SyncError::ReadOnly);
        }
        let engine = self.inner.engine()?;
        let _guard = self.inner.ops.lock().await;
        engine.exec("BEGIN", SqlParams::None, false).await?;
        let mut applied = 0;
        let mut mutated = false;
        for params in rows {
            match engine.exec(sql, params, false).await {
                Ok(outcome) => {
                    mutated |= outcome.mutated;
                    applied += 1;
                }
                Err(e) => {
                    let _ = engine.exec("ROLLBACK", SqlParams::None, false).await;
                    return Err(e);
                }
            }
        }
        if let Err(e) = engine.exec("COMMIT", SqlParams::None, false).await {
            let _ = engine.exec("ROLLBACK", SqlParams::None, false).await;
            return Err(e);
        }
        if mutated {
            self.inner.publish(&engine).await?;
        }
        Ok(applied)
    }

    /// Run a batch and return only its result sets.
    pub async fn query(&self, sql: &str) -> SyncResult<Vec<QueryResult>> {
        Ok(self.exec(sql, SqlParams::None).await?.results)
    }

    pub async fn tables(&self) -> SyncResult<Vec<String>> {
        self.inner.engine()?.tables().await
    }

    /// Drop every table and recreate the default schema.
    pub async fn reset(&self) -> SyncResult<()> {
        if self.inner.read_only {
            return Err(SyncError::ReadOnly);
        }
        let engine = self.inner.engine()?;
        let _guard = self.inner.ops.lock().await;
        let mut script = String::new();
        for table in engine.tables().await? {
            script.push_str(&format!("DROP TABLE IF EXISTS {};\n", quote_ident(&table)));
        }
        script.push_str(DEFAULT_SCHEMA);
        engine.exec(&script, SqlParams::None, false).await?;
        self.inner.publish(&engine).await?;
        tracing::info!("SQL database reset");
        Ok(())
    }

    /// Replace a lost engine and reload from the replicated snapshot.
    pub async fn restart(&self) -> SyncResult<()> {
        self.shutdown();
        let _ = self.inner.state.send_replace(EngineState::Constructing);
        Inner::initialize(&self.inner).await;
        self.wait_ready().await
    }

    /// Stop following the room and terminate the engine.
    pub fn shutdown(&self) {
        self.inner.watcher.lock().take();
        if let Some(engine) = self.inner.engine.write().take() {
            engine.terminate();
        }
        self.inner.set_state(EngineState::Error("engine shut down".into()));
    }

    pub async fn set(&self, key: &str, value: impl Into<KvValue>) -> SyncResult<KvValue> {
        let value = value.into();
        let stored = match &value {
            KvValue::String(s) => s.clone(),
            other => other.to_json().to_string(),
        };
        self.exec(
            "INSERT INTO kv_store (key, value, type) VALUES (:key, :value, :type)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, type = excluded.type",
            SqlParams::Named(vec![
                (":key".into(), SqlValue::Text(key.to_string())),
                (":value".into(), SqlValue::Text(stored)),
                (":type".into(), SqlValue::Text(value.type_tag().to_string())),
            ]),
        )
        .await?;
        Ok(value)
    }

    pub async fn get(&self, key: &str) -> SyncResult<Option<KvValue>> {
        let outcome = self
            .exec(
                "SELECT value, type FROM kv_store WHERE key = :key",
                SqlParams::Named(vec![(":key".into(), SqlValue::Text(key.to_string()))]),
            )
            .await?;
        let row = outcome
            .results
            .first()
            .and_then(|result| result.values.first());
        Ok(row.and_then(|row| decode_stored(row.first()?, row.get(1)?)))
    }

    pub async fn delete(&self, key: &str) -> SyncResult<()> {
        self.exec(
            "DELETE FROM kv_store WHERE key = :key",
            SqlParams::Named(vec![(":key".into(), SqlValue::Text(key.to_string()))]),
        )
        .await
        .map(|_| ())
    }

    /// Rows of `kv_store`, most recently updated first.
    pub async fn list(&self) -> SyncResult<Vec<SqlKvRow>> {
        let results = self
            .query("SELECT key, value, type, updated_at FROM kv_store ORDER BY updated_at DESC, key")
            .await?;
        let Some(result) = results.into_iter().next() else {
            return Ok(Vec::new());
        };
        Ok(result
            .values
            .iter()
            .filter_map(|row| {
                let SqlValue::Text(key) = row.first()? else {
                    return None;
                };
                let value = decode_stored(row.get(1)?, row.get(2)?)?;
                let updated_at = match row.get(3) {
                    Some(SqlValue::Text(at)) => Some(at.clone()),
                    _ => None,
                };
                Some(SqlKvRow {
                    key: key.clone(),
                    value,
                    updated_at,
                })
            })
            .collect())
    }
}

impl Drop for SqlDatabase {
    fn drop(&mut self) {
        self.inner.watcher.lock().take();
        if let Some(engine) = self.inner.engine.write().take() {
            engine.terminate();
        }
    }
}

/// Rebuild a `kv_store` value from its text and type tag.
fn decode_stored(value: &SqlValue, tag: &SqlValue) -> Option<KvValue> {
    let SqlValue::Text(text) = value else {
        return None;
    };
    let tag = match tag {
        SqlValue::Text(tag) => tag.as_str(),
        _ => "string",
    };
    match tag {
        "number" => text.parse::<f64>().ok().map(KvValue::Number),
        "boolean" => Some(KvValue::Boolean(text == "true")),
        "object" => Some(
            serde_json::from_str::<JsonValue>(text)
                .map(KvValue::Json)
                .unwrap_or_else(|_| KvValue::String(text.clone())),
        ),
        _ => Some(KvValue::String(text.clone())),
    }
}

/// Key-value form of a single SQL cell. `NULL` and blobs have none.
pub fn cell_to_kv(value: &SqlValue) -> Option<KvValue> {
    match value {
        SqlValue::Integer(i) => Some(KvValue::Number(*i as f64)),
        SqlValue::Real(r) => Some(KvValue::Number(*r)),
        SqlValue::Text(text) => Some(KvValue::String(text.clone())),
        SqlValue::Null | SqlValue::Blob(_) => None,
    }
}

impl Inner {
    fn set_state(&self, state: EngineState) {
        tracing::debug!(?state, "SQL database state");
        let _ = self.state.send_replace(state);
    }

    fn fail(&self, error: &SyncError) {
        tracing::error!("SQL database unavailable: {error}");
        self.set_state(EngineState::Error(error.to_string()));
    }

    fn engine(&self) -> SyncResult<Arc<EngineClient>> {
        if let EngineState::Error(reason) = &*self.state.borrow() {
            return Err(SyncError::EngineUnavailable(reason.clone()));
        }
        match self.engine.read().as_ref() {
            Some(engine) if engine.is_alive() => Ok(engine.clone()),
            _ => Err(SyncError::EngineUnavailable("engine is not running".into())),
        }
    }

    async fn initialize(this: &Arc<Self>) {
        if let Err(e) = Self::load(this).await {
            this.fail(&e);
            return;
        }
        this.set_state(EngineState::Ready);
        Self::follow(this);
    }

    async fn load(this: &Arc<Self>) -> SyncResult<()> {
        let engine = Arc::new(EngineClient::spawn()?);
        *this.engine.write() = Some(engine.clone());
        engine.wait_ready(this.ready_timeout).await?;

        this.set_state(EngineState::LoadingRemote);
        let remote = match this.store.get_entry(SNAPSHOT_KEY).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("could not load replicated database, starting empty: {e}");
                None
            }
        };

        let mut buffer = None;
        if let Some(entry) = &remote {
            match decode_entry(entry) {
                Ok((encoded, bytes)) => {
                    buffer = Some(bytes);
                    *this.stamp.lock() = Some(SnapshotStamp::of(entry.timestamp, &encoded));
                }
                Err(e) => tracing::warn!("{e}; starting with an empty database"),
            }
        }

        this.set_state(EngineState::Opening);
        let restored = buffer.is_some();
        engine.open(buffer).await?;

        if restored {
            tracing::info!("SQL database restored from room snapshot");
        } else {
            engine.exec(DEFAULT_SCHEMA, SqlParams::None, false).await?;
            if remote.is_none() && !this.read_only {
                let _guard = this.ops.lock().await;
                this.publish(&engine).await?;
            }
            tracing::info!("new SQL database created");
        }
        Ok(())
    }

    /// Reload whenever a newer image is written to the room.
    fn follow(this: &Arc<Self>) {
        let mut snapshots = this.store.entries(SNAPSHOT_KEY);
        let weak = Arc::downgrade(this);
        let task = TaskHandle::spawn(async move {
            while let Some(update) = snapshots.next().await {
                let Some(inner) = weak.upgrade() else { break };
                if let Some(entry) = update {
                    inner.on_remote(entry).await;
                }
            }
        });
        *this.watcher.lock() = Some(task);
    }

    async fn on_remote(&self, entry: KvEntry) {
        let (encoded, bytes) = match decode_entry(&entry) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("ignoring remote database: {e}");
                return;
            }
        };
        let incoming = SnapshotStamp::of(entry.timestamp, &encoded);

        let _guard = self.ops.lock().await;
        let current = self.stamp.lock().clone();
        if let Some(current) = &current {
            if *current == incoming {
                return;
            }
            if !incoming.supersedes(current) {
                tracing::debug!(
                    remote = incoming.timestamp,
                    local = current.timestamp,
                    "ignoring stale remote database"
                );
                if !self.read_only && self.transport_behind(current).await {
                    tracing::debug!("room holds an older database, republishing ours");
                    if let Ok(engine) = self.engine() {
                        let _ = self.publish(&engine).await;
                    }
                }
                return;
            }
        }

        let Ok(engine) = self.engine() else { return };
        self.set_state(EngineState::Reloading);
        match engine.open(Some(bytes)).await {
            Ok(()) => {
                *self.stamp.lock() = Some(incoming);
                self.set_state(EngineState::Ready);
                tracing::info!("SQL database reloaded from remote change");
                self.notifier.notify(SessionEvent::DatabaseStateChanged);
            }
            Err(SyncError::SnapshotDecode(reason)) => {
                tracing::warn!("remote database rejected, keeping local state: {reason}");
                self.set_state(EngineState::Ready);
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Whether the room's current image is older than `ours`.
    ///
    /// Queued echoes of our own earlier exports look stale too, but by then
    /// the room already holds our latest image and nothing needs writing.
    async fn transport_behind(&self, ours: &SnapshotStamp) -> bool {
        let current = match self.store.get_entry(SNAPSHOT_KEY).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return true,
            Err(_) => return false,
        };
        match decode_entry(&current) {
            Ok((encoded, _)) => ours.supersedes(&SnapshotStamp::of(current.timestamp, &encoded)),
            Err(_) => true,
        }
    }

    /// Export the engine and write the image to the room. Callers hold `ops`.
    async fn publish(&self, engine: &EngineClient) -> SyncResult<()> {
        let bytes = engine.export().await?;
        let encoded = STANDARD.encode(&bytes);
        // Always supersede the image this export was built on.
        let floor = self
            .stamp
            .lock()
            .as_ref()
            .map_or(i64::MIN, |stamp| stamp.timestamp.saturating_add(1));
        match self.store.set_entry_at_least(SNAPSHOT_KEY, encoded.clone(), floor).await {
            Ok(entry) => {
                tracing::debug!(bytes = bytes.len(), "database snapshot published");
                *self.stamp.lock() = Some(SnapshotStamp::of(entry.timestamp, &encoded));
            }
            // Logged by the store; the next mutation exports again.
            Err(SyncError::Transport { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn decode_entry(entry: &KvEntry) -> SyncResult<(String, Vec<u8>)> {
    let KvValue::String(encoded) = &entry.value else {
        return Err(SyncError::SnapshotDecode(format!(
            "expected a base64 string, found {}",
            entry.value.type_tag()
        )));
    };
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SyncError::SnapshotDecode(e.to_string()))?;
    Ok((encoded.clone(), bytes))
}
