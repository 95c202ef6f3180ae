//! File replication engine.
//!
//! Each document lives as a raw string at `<room>/<name>`. Local edits update
//! memory at once and reach the transport through a trailing debounce; remote
//! strings that differ from local content overwrite it. Tombstones stop
//! propagation but never purge a copy a peer already holds.

pub mod document;
pub mod editor;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::events::{Notifier, SessionEvent};
use crate::sync::{SharedTransport, TransportPath};
use crate::timer::{Debouncer, TaskHandle};

pub use document::{DocType, Document};
pub use editor::{replace_preserving_cursor, Cursor, EditorBuffer};

/// Room-root names that hold other data and are never documents.
pub const RESERVED_NAMES: [&str; 4] = ["users", "database", "sqlDatabase", "files"];

pub fn is_reserved(name: &str) -> bool {
    name.starts_with('_') || RESERVED_NAMES.contains(&name)
}

#[derive(Default)]
struct OpenTabs {
    tabs: Vec<String>,
    current: Option<String>,
}

pub struct FileReplicator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: SharedTransport,
    root: TransportPath,
    notifier: Notifier,
    read_only: bool,
    docs: RwLock<BTreeMap<String, Document>>,
    subscriptions: Mutex<HashMap<String, TaskHandle>>,
    debouncer: Debouncer<String>,
    tabs: RwLock<OpenTabs>,
    editor: RwLock<Option<Arc<dyn EditorBuffer>>>,
    discovery: Mutex<Option<TaskHandle>>,
}

impl FileReplicator {
    pub fn new(
        transport: SharedTransport,
        root: TransportPath,
        notifier: Notifier,
        edit_debounce: Duration,
        read_only: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                root,
                notifier,
                read_only,
                docs: RwLock::new(BTreeMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                debouncer: Debouncer::new(edit_debounce),
                tabs: RwLock::new(OpenTabs::default()),
                editor: RwLock::new(None),
                discovery: Mutex::new(None),
            }),
        }
    }

    /// Register a local document and follow its transport key without
    /// publishing it. Returns `false` if the name was already tracked.
    pub fn track(&self, name: &str, content: &str) -> bool {
        if self.inner.docs.read().contains_key(name) {
            return false;
        }
        self.inner
            .docs
            .write()
            .insert(name.to_string(), Document::new(name, content));
        Inner::follow(&self.inner, name);
        true
    }

    /// Apply a value observed on the transport for `name`.
    pub fn apply_remote(&self, name: &str, value: Option<&Value>) -> bool {
        match value {
            Some(Value::String(content)) => self.inner.apply_remote(name, content),
            _ => false,
        }
    }

    /// Record a local edit. The transport write follows after the debounce window.
    pub fn edit(&self, name: &str, content: &str) -> SyncResult<()> {
        self.inner.check_writable()?;
        {
            let mut docs = self.inner.docs.write();
            let doc = docs
                .get_mut(name)
                .ok_or_else(|| SyncError::DocumentNotFound(name.to_string()))?;
            doc.content = content.to_string();
        }

        let weak = Arc::downgrade(&self.inner);
        let key = name.to_string();
        self.inner.debouncer.schedule(name.to_string(), async move {
            if let Some(inner) = weak.upgrade() {
                // Failures are logged; the next edit schedules another write.
                let _ = inner.publish(&key).await;
            }
        });
        Ok(())
    }

    /// Create a document, publish it and start following it. `None` content
    /// uses the starter template for the document type.
    pub async fn create(&self, name: &str, content: Option<&str>) -> SyncResult<Document> {
        self.inner.check_writable()?;
        let name = name.trim();
        if name.is_empty() || is_reserved(name) {
            return Err(SyncError::InvalidDocumentName(name.to_string()));
        }

        let doc = {
            let mut docs = self.inner.docs.write();
            if docs.contains_key(name) {
                return Err(SyncError::DocumentExists(name.to_string()));
            }
            let doc_type = DocType::from_filename(name);
            let doc = Document::new(name, content.unwrap_or(doc_type.template()));
            docs.insert(name.to_string(), doc.clone());
            doc
        };

        tracing::info!(document = %name, doc_type = %doc.doc_type, "creating document");
        self.inner.publish(name).await?;
        Inner::follow(&self.inner, name);
        self.inner
            .notifier
            .notify(SessionEvent::DocumentChanged(name.to_string()));
        Ok(doc)
    }

    /// Stop following `name`, tombstone it and close it if open.
    pub async fn delete(&self, name: &str) -> SyncResult<()> {
        self.inner.check_writable()?;
        let removed = self.inner.docs.write().remove(name);
        if removed.is_none() {
            return Err(SyncError::DocumentNotFound(name.to_string()));
        }
        self.inner.debouncer.cancel(&name.to_string());
        self.inner.subscriptions.lock().remove(name);
        self.close(name);

        tracing::info!(document = %name, "deleting document");
        self.inner.write(name, None).await
    }

    /// Write the new key, then tombstone the old one. Observers may briefly
    /// see both names.
    pub async fn rename(&self, old: &str, new: &str) -> SyncResult<Document> {
        self.inner.check_writable()?;
        let new = new.trim();
        if new.is_empty() || is_reserved(new) {
            return Err(SyncError::InvalidDocumentName(new.to_string()));
        }

        let content = {
            let docs = self.inner.docs.read();
            if docs.contains_key(new) {
                return Err(SyncError::DocumentExists(new.to_string()));
            }
            docs.get(old)
                .map(|doc| doc.content.clone())
                .ok_or_else(|| SyncError::DocumentNotFound(old.to_string()))?
        };

        tracing::info!(from = %old, to = %new, "renaming document");
        // Nothing changes locally until the new key is written.
        self.inner
            .write(new, Some(Value::String(content.clone())))
            .await?;

        let doc = Document::new(new, content);
        {
            let mut docs = self.inner.docs.write();
            docs.remove(old);
            docs.insert(new.to_string(), doc.clone());
        }
        self.inner.debouncer.cancel(&old.to_string());
        self.inner.subscriptions.lock().remove(old);
        {
            let mut tabs = self.inner.tabs.write();
            for tab in tabs.tabs.iter_mut().filter(|tab| tab.as_str() == old) {
                *tab = new.to_string();
            }
            if tabs.current.as_deref() == Some(old) {
                tabs.current = Some(new.to_string());
            }
        }
        Inner::follow(&self.inner, new);
        self.inner.write(old, None).await?;
        Ok(doc)
    }

    /// Follow every untracked document that appears at the room root.
    pub fn start_discovery(&self) {
        let mut discovery = self.inner.discovery.lock();
        if discovery.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut children = self.inner.transport.map_on(&self.inner.root);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *discovery = Some(TaskHandle::spawn(async move {
            while let Some((key, value)) = children.next().await {
                let Some(inner) = weak.upgrade() else { break };
                if let Some(Value::String(content)) = value {
                    Inner::discover(&inner, &key, content);
                }
            }
        }));
    }

    /// Make `name` the current document and add it to the open tabs.
    pub fn open(&self, name: &str) -> SyncResult<Document> {
        let doc = self
            .document(name)
            .ok_or_else(|| SyncError::DocumentNotFound(name.to_string()))?;
        {
            let mut tabs = self.inner.tabs.write();
            if !tabs.tabs.iter().any(|tab| tab == name) {
                tabs.tabs.push(name.to_string());
            }
            tabs.current = Some(name.to_string());
        }
        if let Some(editor) = self.inner.editor.read().as_ref() {
            editor.set_text(&doc.content);
        }
        Ok(doc)
    }

    /// Close a tab. If it was current, the first remaining tab becomes current.
    pub fn close(&self, name: &str) {
        let mut tabs = self.inner.tabs.write();
        tabs.tabs.retain(|tab| tab != name);
        if tabs.current.as_deref() == Some(name) {
            tabs.current = tabs.tabs.first().cloned();
        }
    }

    pub fn current(&self) -> Option<Document> {
        let name = self.inner.tabs.read().current.clone()?;
        self.document(&name)
    }

    pub fn open_tabs(&self) -> Vec<String> {
        self.inner.tabs.read().tabs.clone()
    }

    pub fn attach_editor(&self, editor: Arc<dyn EditorBuffer>) {
        if let Some(doc) = self.current() {
            editor.set_text(&doc.content);
        }
        *self.inner.editor.write() = Some(editor);
    }

    pub fn detach_editor(&self) {
        self.inner.editor.write().take();
    }

    /// Publish every pending debounced edit now. Returns how many were written.
    pub async fn flush(&self) -> SyncResult<usize> {
        self.inner.check_writable()?;
        let pending = self.inner.debouncer.cancel_all();
        let mut written = 0;
        for name in pending {
            let tracked = self.inner.docs.read().contains_key(&name);
            if tracked {
                self.inner.publish(&name).await?;
                written += 1;
            }
        }
        Ok(written)
    }

    pub fn has_pending_edit(&self, name: &str) -> bool {
        self.inner.debouncer.is_pending(&name.to_string())
    }

    pub fn documents(&self) -> Vec<Document> {
        self.inner.docs.read().values().cloned().collect()
    }

    pub fn document(&self, name: &str) -> Option<Document> {
        self.inner.docs.read().get(name).cloned()
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.inner.docs.read().contains_key(name)
    }
}

impl Inner {
    fn check_writable(&self) -> SyncResult<()> {
        if self.read_only {
            Err(SyncError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Subscribe to `name`, replacing any earlier subscription.
    fn follow(this: &Arc<Self>, name: &str) {
        let mut updates = this.transport.subscribe(&this.root.child(name));
        let weak = Arc::downgrade(this);
        let key = name.to_string();
        let task = TaskHandle::spawn(async move {
            while let Some(value) = updates.next().await {
                let Some(inner) = weak.upgrade() else { break };
                // Tombstones stop nothing locally; the copy stays.
                if let Some(Value::String(content)) = value {
                    inner.apply_remote(&key, &content);
                }
            }
        });
        this.subscriptions.lock().insert(name.to_string(), task);
    }

    fn discover(this: &Arc<Self>, name: &str, content: String) {
        if is_reserved(name) {
            return;
        }
        {
            let mut docs = this.docs.write();
            if docs.contains_key(name) {
                return;
            }
            docs.insert(name.to_string(), Document::new(name, content));
        }
        tracing::info!(document = %name, "discovered remote document");
        Self::follow(this, name);
        this.notifier
            .notify(SessionEvent::DocumentChanged(name.to_string()));
    }

    fn apply_remote(&self, name: &str, content: &str) -> bool {
        {
            let mut docs = self.docs.write();
            match docs.get_mut(name) {
                Some(doc) if doc.content != content => doc.content = content.to_string(),
                _ => return false,
            }
        }
        tracing::debug!(document = %name, len = content.len(), "remote content");

        let is_current = self.tabs.read().current.as_deref() == Some(name);
        if is_current {
            if let Some(editor) = self.editor.read().as_ref() {
                replace_preserving_cursor(editor.as_ref(), content);
            }
        }
        self.notifier
            .notify(SessionEvent::DocumentChanged(name.to_string()));
        true
    }

    /// Write the latest local content of `name`.
    async fn publish(&self, name: &str) -> SyncResult<()> {
        let content = self.docs.read().get(name).map(|doc| doc.content.clone());
        match content {
            Some(content) => self.write(name, Some(Value::String(content))).await,
            None => Ok(()),
        }
    }

    async fn write(&self, name: &str, value: Option<Value>) -> SyncResult<()> {
        let path = self.root.child(name);
        self.transport.put(&path, value).await.map_err(|e| {
            tracing::warn!(%path, "document write failed: {e}");
            e
        })
    }
}
