use std::sync::Arc;
use std::time::Duration;

use codemate_sync::files::{Cursor, DocType, EditorBuffer, FileReplicator};
use codemate_sync::sync::GraphUpdate;
use codemate_sync::{MemoryTransport, Notifier, SessionEvent, SyncError, TransportPath};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::sleep;

fn root() -> TransportPath {
    TransportPath::from_segments(["CodeMate", "k3j9x2"])
}

fn replicator(transport: &MemoryTransport, read_only: bool) -> FileReplicator {
    FileReplicator::new(
        Arc::new(transport.clone()),
        root(),
        Notifier::new(),
        Duration::from_millis(300),
        read_only,
    )
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[derive(Default)]
struct FakeEditor {
    text: Mutex<String>,
    cursor: Mutex<Cursor>,
}

impl EditorBuffer for FakeEditor {
    fn text(&self) -> String {
        self.text.lock().clone()
    }

    fn set_text(&self, text: &str) {
        *self.text.lock() = text.to_string();
    }

    fn cursor(&self) -> Cursor {
        *self.cursor.lock()
    }

    fn set_cursor(&self, cursor: Cursor) {
        *self.cursor.lock() = cursor;
    }
}

#[tokio::test(start_paused = true)]
async fn create_publishes_template_and_peers_discover_it() {
    let hub = MemoryTransport::new();
    let alice = replicator(&hub, false);
    let bob = replicator(&hub.peer(), false);
    bob.start_discovery();

    let doc = alice.create("index.html", None).await.unwrap();
    assert_eq!(doc.doc_type, DocType::Html);
    assert_eq!(doc.content, DocType::Html.template());
    assert_eq!(
        hub.graph().get(&root().child("index.html")),
        Some(json!(DocType::Html.template()))
    );

    settle().await;
    assert_eq!(bob.document("index.html").map(|d| d.content), Some(doc.content));
}

#[tokio::test(start_paused = true)]
async fn create_rejects_reserved_and_duplicate_names() {
    let hub = MemoryTransport::new();
    let files = replicator(&hub, false);

    for name in ["users", "database", "sqlDatabase", "files", "_meta", "  "] {
        assert!(matches!(
            files.create(name, Some("x")).await,
            Err(SyncError::InvalidDocumentName(_))
        ));
    }
    files.create("a.js", Some("1")).await.unwrap();
    assert_eq!(
        files.create("a.js", Some("2")).await,
        Err(SyncError::DocumentExists("a.js".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn discovery_ignores_reserved_keys() {
    let hub = MemoryTransport::new();
    let files = replicator(&hub, false);
    files.start_discovery();

    let graph = hub.graph();
    graph.apply(root().child("sqlDatabase"), Some(json!("AAAA")), None);
    graph.apply(root().child("_private"), Some(json!("x")), None);
    graph.apply(root().child("main.py"), Some(json!("print(1)")), None);
    settle().await;

    let names: Vec<String> = files.documents().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["main.py"]);
    assert_eq!(files.document("main.py").unwrap().doc_type, DocType::Python);
}

#[tokio::test(start_paused = true)]
async fn edits_are_debounced_into_one_write() {
    let hub = MemoryTransport::new();
    let files = replicator(&hub, false);
    files.create("app.js", Some("")).await.unwrap();

    let path = root().child("app.js");
    let mut updates = hub.graph().updates();

    for text in ["c", "co", "con", "cons"] {
        files.edit("app.js", text).unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    assert!(files.has_pending_edit("app.js"));
    assert_eq!(hub.graph().get(&path), Some(json!("")));

    sleep(Duration::from_millis(300)).await;
    assert!(!files.has_pending_edit("app.js"));
    assert_eq!(hub.graph().get(&path), Some(json!("cons")));

    let mut writes = Vec::new();
    while let Ok(GraphUpdate { path: p, value, .. }) = updates.try_recv() {
        if p == path {
            writes.push(value);
        }
    }
    assert_eq!(writes, vec![Some(json!("cons"))]);
}

#[tokio::test(start_paused = true)]
async fn flush_writes_pending_edits_immediately() {
    let hub = MemoryTransport::new();
    let files = replicator(&hub, false);
    files.create("a.txt", Some("")).await.unwrap();
    files.edit("a.txt", "draft").unwrap();

    assert_eq!(files.flush().await.unwrap(), 1);
    assert_eq!(hub.graph().get(&root().child("a.txt")), Some(json!("draft")));
    assert_eq!(files.flush().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn remote_content_replaces_editor_text_and_keeps_cursor() {
    let hub = MemoryTransport::new();
    let alice = replicator(&hub, false);
    let bob = replicator(&hub.peer(), false);
    bob.start_discovery();

    alice.create("notes.txt", Some("one\ntwo\nthree")).await.unwrap();
    settle().await;

    let editor = Arc::new(FakeEditor::default());
    bob.open("notes.txt").unwrap();
    bob.attach_editor(editor.clone());
    assert_eq!(editor.text(), "one\ntwo\nthree");
    editor.set_cursor(Cursor::new(2, 4));

    alice.edit("notes.txt", "one\nTWO").unwrap();
    sleep(Duration::from_millis(400)).await;

    assert_eq!(bob.document("notes.txt").unwrap().content, "one\nTWO");
    assert_eq!(editor.text(), "one\nTWO");
    assert_eq!(editor.cursor(), Cursor::new(1, 3));
}

#[tokio::test(start_paused = true)]
async fn remote_changes_fire_document_events() {
    let hub = MemoryTransport::new();
    let notifier = Notifier::new();
    let mut events = notifier.subscribe();
    let files = FileReplicator::new(
        Arc::new(hub.clone()),
        root(),
        notifier,
        Duration::from_millis(300),
        false,
    );
    files.track("a.txt", "old");

    assert!(files.apply_remote("a.txt", Some(&json!("new"))));
    assert!(!files.apply_remote("a.txt", Some(&json!("new"))));
    assert!(!files.apply_remote("a.txt", None));
    assert_eq!(events.try_recv().unwrap(), SessionEvent::DocumentChanged("a.txt".into()));
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn rename_moves_content_and_tombstones_old_key() {
    let hub = MemoryTransport::new();
    let files = replicator(&hub, false);
    files.create("old.js", Some("let x = 1;")).await.unwrap();
    files.open("old.js").unwrap();

    let doc = files.rename("old.js", "new.js").await.unwrap();
    assert_eq!(doc.content, "let x = 1;");
    assert_eq!(hub.graph().get(&root().child("new.js")), Some(json!("let x = 1;")));
    assert_eq!(hub.graph().get(&root().child("old.js")), None);
    assert_eq!(files.open_tabs(), vec!["new.js"]);
    assert_eq!(files.current().map(|d| d.name), Some("new.js".into()));
    assert!(!files.is_tracked("old.js"));
}

#[tokio::test(start_paused = true)]
async fn delete_stops_following_but_peers_keep_their_copy() {
    let hub = MemoryTransport::new();
    let alice = replicator(&hub, false);
    let bob = replicator(&hub.peer(), false);
    bob.start_discovery();

    alice.create("tmp.md", Some("# hi")).await.unwrap();
    settle().await;
    assert!(bob.is_tracked("tmp.md"));

    alice.delete("tmp.md").await.unwrap();
    settle().await;
    assert!(!alice.is_tracked("tmp.md"));
    assert_eq!(hub.graph().get(&root().child("tmp.md")), None);
    assert_eq!(bob.document("tmp.md").map(|d| d.content), Some("# hi".into()));
}

#[tokio::test(start_paused = true)]
async fn read_only_replicator_follows_but_never_writes() {
    let hub = MemoryTransport::new();
    let writer = replicator(&hub, false);
    let viewer = replicator(&hub.peer(), true);
    viewer.start_discovery();

    writer.create("index.html", Some("<p>hi</p>")).await.unwrap();
    settle().await;

    assert_eq!(viewer.document("index.html").map(|d| d.content), Some("<p>hi</p>".into()));
    assert_eq!(viewer.edit("index.html", "x"), Err(SyncError::ReadOnly));
    assert_eq!(viewer.create("b.txt", None).await, Err(SyncError::ReadOnly));
    assert_eq!(viewer.delete("index.html").await, Err(SyncError::ReadOnly));
}

#[tokio::test(start_paused = true)]
async fn failed_rename_leaves_local_state_alone() {
    let hub = MemoryTransport::new();
    let files = replicator(&hub, false);
    files.create("old.js", Some("let x = 1;")).await.unwrap();
    files.open("old.js").unwrap();

    hub.set_offline(true);
    assert!(matches!(
        files.rename("old.js", "new.js").await,
        Err(SyncError::Transport { .. })
    ));
    assert!(files.is_tracked("old.js"));
    assert!(!files.is_tracked("new.js"));
    assert_eq!(files.open_tabs(), vec!["old.js"]);
    assert_eq!(files.current().map(|d| d.name), Some("old.js".into()));

    hub.set_offline(false);
    files.rename("old.js", "new.js").await.unwrap();
    assert_eq!(hub.graph().get(&root().child("old.js")), None);
    assert_eq!(hub.graph().get(&root().child("new.js")), Some(json!("let x = 1;")));
}
