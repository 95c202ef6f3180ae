//! Replicated key-value store over the transport.
//!
//! Every value travels as a `{value, type, timestamp}` envelope under
//! `<scope>/<key>`. Last writer wins per key; `push` and `increment` are plain
//! read-modify-write and may lose a concurrent update from another peer.

pub mod value;

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use crate::clock::SharedClock;
use crate::error::{SyncError, SyncResult};
use crate::sync::{SharedTransport, TransportPath};
use crate::timer::TaskHandle;

pub use value::{KvEntry, KvValue};

#[derive(Clone)]
pub struct ReplicatedStore {
    transport: SharedTransport,
    scope: TransportPath,
    clock: SharedClock,
    settle: Duration,
    read_only: bool,
}

impl ReplicatedStore {
    pub fn new(
        transport: SharedTransport,
        scope: TransportPath,
        clock: SharedClock,
        settle: Duration,
        read_only: bool,
    ) -> Self {
        Self {
            transport,
            scope,
            clock,
            settle,
            read_only,
        }
    }

    /// Same transport and settings, rooted at another scope.
    pub fn rescoped(&self, scope: TransportPath) -> Self {
        Self {
            scope,
            ..self.clone()
        }
    }

    pub fn scope(&self) -> &TransportPath {
        &self.scope
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn path(&self, key: &str) -> TransportPath {
        self.scope.child(key)
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.read_only {
            Err(SyncError::ReadOnly)
        } else {
            Ok(())
        }
    }

    async fn write(&self, key: &str, value: Option<Value>) -> SyncResult<()> {
        let path = self.path(key);
        self.transport.put(&path, value).await.map_err(|e| {
            tracing::warn!(%path, "write failed: {e}");
            e
        })
    }

    pub async fn set(&self, key: &str, value: impl Into<KvValue>) -> SyncResult<KvValue> {
        self.set_entry(key, value).await.map(|entry| entry.value)
    }

    /// Like [`set`](Self::set) but returns the full envelope that was written.
    pub async fn set_entry(&self, key: &str, value: impl Into<KvValue>) -> SyncResult<KvEntry> {
        self.set_entry_at_least(key, value, i64::MIN).await
    }

    /// Like [`set_entry`](Self::set_entry), stamped no earlier than `floor`.
    pub async fn set_entry_at_least(
        &self,
        key: &str,
        value: impl Into<KvValue>,
        floor: i64,
    ) -> SyncResult<KvEntry> {
        self.check_writable()?;
        let entry = KvEntry::new(value.into(), self.clock.now_ms().max(floor));
        self.write(key, Some(entry.to_wire())).await?;
        tracing::debug!(scope = %self.scope, key, kind = entry.value.type_tag(), "set");
        Ok(entry)
    }

    pub async fn get(&self, key: &str) -> SyncResult<Option<KvValue>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    pub async fn get_entry(&self, key: &str) -> SyncResult<Option<KvEntry>> {
        let path = self.path(key);
        let raw = self.transport.once(&path).await.map_err(|e| {
            tracing::warn!(%path, "read failed: {e}");
            e
        })?;
        Ok(raw.as_ref().and_then(KvEntry::from_wire))
    }

    pub async fn delete(&self, key: &str) -> SyncResult<()> {
        self.check_writable()?;
        self.write(key, None).await
    }

    /// Live entries seen within the settle window.
    ///
    /// Enumeration is asynchronous: entries that arrive after the window closes
    /// are not included.
    pub async fn list(&self) -> BTreeMap<String, KvEntry> {
        let mut children = self.transport.map_on(&self.scope);
        let deadline = tokio::time::Instant::now() + self.settle;
        let mut entries = BTreeMap::new();

        while let Ok(Some((key, raw))) = tokio::time::timeout_at(deadline, children.next()).await {
            match raw.as_ref().and_then(KvEntry::from_wire) {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        entries
    }

    /// Append to the array at `key`, creating it when absent.
    pub async fn push(&self, key: &str, value: impl Into<KvValue>) -> SyncResult<Vec<Value>> {
        self.check_writable()?;
        let mut items = match self.get(key).await? {
            None => Vec::new(),
            Some(KvValue::Json(Value::Array(items))) => items,
            Some(_) => return Err(SyncError::ArrayType(key.to_string())),
        };
        items.push(value.into().to_json());
        self.set(key, KvValue::Json(Value::Array(items.clone()))).await?;
        Ok(items)
    }

    /// Add `amount` to the number at `key`, starting from zero when absent.
    pub async fn increment(&self, key: &str, amount: f64) -> SyncResult<f64> {
        self.check_writable()?;
        let current = match self.get(key).await? {
            None => 0.0,
            Some(KvValue::Number(n)) => n,
            Some(_) => return Err(SyncError::NumberType(key.to_string())),
        };
        let next = current + amount;
        self.set(key, next).await?;
        Ok(next)
    }

    /// Envelopes observed for `key`: the current one first, then every update.
    /// Tombstones arrive as `None`.
    pub fn entries(&self, key: &str) -> BoxStream<'static, Option<KvEntry>> {
        self.transport
            .subscribe(&self.path(key))
            .map(|raw| raw.as_ref().and_then(KvEntry::from_wire))
            .boxed()
    }

    /// Call `callback(value, key)` with the current value and every later
    /// non-null update of `key`, until the handle is cancelled or dropped.
    pub fn watch<F>(&self, key: &str, mut callback: F) -> TaskHandle
    where
        F: FnMut(KvValue, &str) + Send + 'static,
    {
        let mut updates = self.entries(key);
        let key = key.to_string();
        TaskHandle::spawn(async move {
            while let Some(update) = updates.next().await {
                if let Some(entry) = update {
                    callback(entry.value, &key);
                }
            }
        })
    }

    /// Call `callback(key, entry)` for every child of the scope, existing and
    /// future. Tombstones and non-envelope values arrive as `None`.
    pub fn watch_children<F>(&self, mut callback: F) -> TaskHandle
    where
        F: FnMut(String, Option<KvEntry>) + Send + 'static,
    {
        let mut children = self.transport.map_on(&self.scope);
        TaskHandle::spawn(async move {
            while let Some((key, raw)) = children.next().await {
                callback(key, raw.as_ref().and_then(KvEntry::from_wire));
            }
        })
    }

    pub async fn query<P>(&self, predicate: P) -> Vec<(String, KvValue)>
    where
        P: Fn(&str, &KvValue) -> bool,
    {
        self.list()
            .await
            .into_iter()
            .filter(|(key, entry)| predicate(key, &entry.value))
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }

    /// Tombstone every live entry. Returns how many were removed.
    pub async fn clear(&self) -> SyncResult<usize> {
        self.check_writable()?;
        let keys: Vec<String> = self.list().await.into_keys().collect();
        for key in &keys {
            self.write(key, None).await?;
        }
        Ok(keys.len())
    }
}
