//! Embedded SQL engine running on its own thread.
//!
//! The worker owns the only `rusqlite::Connection` and is reached through
//! id-tagged requests. Responses come back on an event channel; a dispatcher
//! task matches them to the pending table. When the worker goes away every
//! pending request is rejected at once and the client stays unusable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::{ToSql, Value};
use rusqlite::{params_from_iter, Batch, Connection};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{SyncError, SyncResult};
use crate::timer::TaskHandle;

pub type SqlValue = Value;

/// Parameters for [`EngineClient::exec`]. They are bound to every statement
/// in the batch that declares parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SqlParams {
    #[default]
    None,
    Positional(Vec<SqlValue>),
    /// Names with or without their `:`/`@`/`$` prefix; bare names get `:`.
    Named(Vec<(String, SqlValue)>),
}

/// One result set.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub values: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutcome {
    pub results: Vec<QueryResult>,
    /// Some statement in the batch was not read-only
    pub mutated: bool,
}

#[derive(Debug)]
pub enum WorkerAction {
    Open { buffer: Option<Vec<u8>> },
    Exec { sql: String, params: SqlParams, read_only: bool },
    Export,
    Tables,
}

#[derive(Debug)]
pub struct WorkerRequest {
    pub id: u64,
    pub action: WorkerAction,
}

#[derive(Debug)]
pub enum WorkerReply {
    Opened,
    Exec(ExecOutcome),
    Export(Vec<u8>),
    Tables(Vec<String>),
}

#[derive(Debug)]
pub enum WorkerEvent {
    Ready,
    Response {
        id: u64,
        result: Result<WorkerReply, SyncError>,
    },
}

type Responder = oneshot::Sender<Result<WorkerReply, SyncError>>;

pub struct EngineClient {
    requests: Mutex<Option<Sender<WorkerRequest>>>,
    pending: Arc<DashMap<u64, Responder>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    ready: watch::Receiver<bool>,
    _dispatcher: TaskHandle,
}

impl EngineClient {
    /// Start a worker thread. Must be called inside a tokio runtime.
    pub fn spawn() -> SyncResult<Self> {
        let (req_tx, req_rx) = unbounded::<WorkerRequest>();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let (ready_tx, ready_rx) = watch::channel(false);

        std::thread::Builder::new()
            .name("sql-engine".to_string())
            .spawn(move || match Worker::new(event_tx) {
                Ok(worker) => worker.run(req_rx),
                Err(e) => tracing::error!("SQL engine failed to start: {e}"),
            })
            .map_err(|e| SyncError::EngineUnavailable(e.to_string()))?;

        let pending: Arc<DashMap<u64, Responder>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let task_pending = pending.clone();
        let task_alive = alive.clone();
        let dispatcher = TaskHandle::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    WorkerEvent::Ready => {
                        let _ = ready_tx.send(true);
                    }
                    WorkerEvent::Response { id, result } => {
                        if let Some((_, responder)) = task_pending.remove(&id) {
                            let _ = responder.send(result);
                        }
                    }
                }
            }
            // Worker is gone: exited, panicked, or terminated.
            if task_alive.swap(false, Ordering::SeqCst) {
                tracing::error!("SQL engine worker exited unexpectedly");
            }
            reject_all(&task_pending, "engine worker exited");
        });

        Ok(Self {
            requests: Mutex::new(Some(req_tx)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            ready: ready_rx,
            _dispatcher: dispatcher,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Wait for the worker's ready signal.
    pub async fn wait_ready(&self, timeout: Duration) -> SyncResult<()> {
        let mut ready = self.ready.clone();
        let outcome = tokio::time::timeout(timeout, async {
            ready.wait_for(|ready| *ready).await.map(|_| ())
        })
        .await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SyncError::EngineUnavailable(
                "engine exited before becoming ready".into(),
            )),
            Err(_) => Err(SyncError::EngineUnavailable(
                "engine did not become ready in time".into(),
            )),
        }
    }

    async fn request(&self, action: WorkerAction) -> SyncResult<WorkerReply> {
        if !self.is_alive() {
            return Err(SyncError::EngineUnavailable("engine is not running".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let sent = match self.requests.lock().as_ref() {
            Some(requests) => requests.send(WorkerRequest { id, action }).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.remove(&id);
            return Err(SyncError::EngineUnavailable("engine is not running".into()));
        }

        rx.await.unwrap_or_else(|_| {
            Err(SyncError::EngineUnavailable(
                "engine dropped the request".into(),
            ))
        })
    }

    /// Replace the database with `buffer`, or with an empty one.
    pub async fn open(&self, buffer: Option<Vec<u8>>) -> SyncResult<()> {
        match self.request(WorkerAction::Open { buffer }).await? {
            WorkerReply::Opened => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn exec(&self, sql: &str, params: SqlParams, read_only: bool) -> SyncResult<ExecOutcome> {
        let action = WorkerAction::Exec {
            sql: sql.to_string(),
            params,
            read_only,
        };
        match self.request(action).await? {
            WorkerReply::Exec(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Full database image.
    pub async fn export(&self) -> SyncResult<Vec<u8>> {
        match self.request(WorkerAction::Export).await? {
            WorkerReply::Export(bytes) => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    /// User table names, sorted.
    pub async fn tables(&self) -> SyncResult<Vec<String>> {
        match self.request(WorkerAction::Tables).await? {
            WorkerReply::Tables(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    /// Stop the worker and reject everything still in flight.
    pub fn terminate(&self) {
        self.requests.lock().take();
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::info!("SQL engine terminated");
        }
        reject_all(&self.pending, "engine terminated");
    }
}

impl Drop for EngineClient {
    fn drop(&mut self) {
        self.requests.get_mut().take();
    }
}

fn reject_all(pending: &DashMap<u64, Responder>, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, responder)) = pending.remove(&id) {
            let _ = responder.send(Err(SyncError::EngineUnavailable(reason.to_string())));
        }
    }
}

fn unexpected(reply: WorkerReply) -> SyncError {
    SyncError::Sql(format!("unexpected engine reply: {reply:?}"))
}

fn sql_err(e: rusqlite::Error) -> SyncError {
    SyncError::Sql(e.to_string())
}

fn io_err(e: std::io::Error) -> SyncError {
    SyncError::EngineUnavailable(e.to_string())
}

struct Worker {
    conn: Connection,
    dir: TempDir,
    path: PathBuf,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> SyncResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("codemate-sql")
            .tempdir()
            .map_err(io_err)?;
        let path = dir.path().join("snapshot-0.db");
        let conn = Connection::open(&path).map_err(sql_err)?;
        Ok(Self {
            conn,
            dir,
            path,
            generation: 0,
            events,
        })
    }

    fn run(mut self, requests: Receiver<WorkerRequest>) {
        if self.events.send(WorkerEvent::Ready).is_err() {
            return;
        }
        while let Ok(WorkerRequest { id, action }) = requests.recv() {
            let result = match action {
                WorkerAction::Open { buffer } => self.open(buffer).map(|()| WorkerReply::Opened),
                WorkerAction::Exec {
                    sql,
                    params,
                    read_only,
                } => self.exec(&sql, &params, read_only).map(WorkerReply::Exec),
                WorkerAction::Export => self.export().map(WorkerReply::Export),
                WorkerAction::Tables => self.tables().map(WorkerReply::Tables),
            };
            if self.events.send(WorkerEvent::Response { id, result }).is_err() {
                break;
            }
        }
        tracing::debug!("SQL engine worker stopping");
    }

    fn next_path(&mut self, stem: &str) -> PathBuf {
        self.generation += 1;
        self.dir.path().join(format!("{stem}-{}.db", self.generation))
    }

    /// Stage the image in a fresh file and only swap it in once it checks out.
    fn open(&mut self, buffer: Option<Vec<u8>>) -> SyncResult<()> {
        let staged = self.next_path("snapshot");
        let _ = std::fs::remove_file(&staged);

        if let Some(bytes) = &buffer {
            std::fs::write(&staged, bytes).map_err(io_err)?;
        }
        let conn = match Self::open_checked(&staged, buffer.is_some()) {
            Ok(conn) => conn,
            Err(e) => {
                let _ = std::fs::remove_file(&staged);
                return Err(e);
            }
        };

        let old_path = std::mem::replace(&mut self.path, staged);
        self.conn = conn;
        let _ = std::fs::remove_file(old_path);
        tracing::debug!(bytes = buffer.as_ref().map_or(0, Vec::len), "database opened");
        Ok(())
    }

    fn open_checked(path: &Path, validate: bool) -> SyncResult<Connection> {
        let conn = Connection::open(path).map_err(sql_err)?;
        if validate {
            let verdict: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get(0))
                .map_err(|e| SyncError::SnapshotDecode(e.to_string()))?;
            if verdict != "ok" {
                return Err(SyncError::SnapshotDecode(verdict));
            }
        }
        Ok(conn)
    }

    fn exec(&mut self, sql: &str, params: &SqlParams, read_only: bool) -> SyncResult<ExecOutcome> {
        let mut outcome = ExecOutcome::default();
        let mut batch = Batch::new(&self.conn, sql);

        while let Some(mut stmt) = batch.next().map_err(sql_err)? {
            if !stmt.readonly() {
                if read_only {
                    return Err(SyncError::ReadOnly);
                }
                outcome.mutated = true;
            }

            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();
            let bind = stmt.parameter_count() > 0;

            let mut rows = match params {
                SqlParams::Positional(values) if bind => {
                    stmt.query(params_from_iter(values.iter())).map_err(sql_err)?
                }
                SqlParams::Named(pairs) if bind => {
                    let names: Vec<String> = pairs.iter().map(|(name, _)| named(name)).collect();
                    let bound: Vec<(&str, &dyn ToSql)> = names
                        .iter()
                        .zip(pairs.iter())
                        .map(|(name, (_, value))| (name.as_str(), value as &dyn ToSql))
                        .collect();
                    stmt.query(bound.as_slice()).map_err(sql_err)?
                }
                _ => stmt.query([]).map_err(sql_err)?,
            };

            let mut values = Vec::new();
            while let Some(row) = rows.next().map_err(sql_err)? {
                let mut record = Vec::with_capacity(width);
                for i in 0..width {
                    record.push(row.get::<_, Value>(i).map_err(sql_err)?);
                }
                values.push(record);
            }
            if width > 0 {
                outcome.results.push(QueryResult { columns, values });
            }
        }
        Ok(outcome)
    }

    fn export(&mut self) -> SyncResult<Vec<u8>> {
        let target = self.next_path("export");
        let _ = std::fs::remove_file(&target);
        let quoted = target.to_string_lossy().replace('\'', "''");
        self.conn
            .execute_batch(&format!("VACUUM INTO '{quoted}'"))
            .map_err(sql_err)?;
        let bytes = std::fs::read(&target).map_err(io_err);
        let _ = std::fs::remove_file(&target);
        bytes
    }

    fn tables(&self) -> SyncResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(sql_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(names)
    }
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn named(name: &str) -> String {
    if name.starts_with([':', '@', '$']) {
        name.to_string()
    } else {
        format!(":{name}")
    }
}
