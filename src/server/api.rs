use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::get,
    Json, Router,
};
use colored::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::sync::{Graph, SyncMessage, TransportPath};

#[derive(Clone)]
pub struct RelayState {
    pub graph: Arc<Graph>,
    pub server_id: String,
    next_conn: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            graph: Arc::new(Graph::new()),
            server_id: format!("relay-{}", uuid::Uuid::new_v4().simple()),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(|| async { "CodeMate Relay" }))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    println!(
        "{} Relay running at {}",
        "✓".green(),
        format!("ws://{}/ws", addr).bright_blue()
    );
    serve_on(listener).await
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: TcpListener) -> Result<()> {
    axum::serve(listener, router(RelayState::new())).await?;
    Ok(())
}

async fn health(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "server_id": state.server_id,
        "entries": state.graph.len(),
    }))
}

async fn ws_handler(
    State(state): State<RelayState>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: RelayState, socket: WebSocket) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();
    let subscriptions: Arc<RwLock<Vec<TransportPath>>> = Arc::new(RwLock::new(Vec::new()));

    tracing::info!(conn, "peer connected");
    let _ = out_tx.send(SyncMessage::handshake(state.server_id.clone()));

    let writer = async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(text) = msg.to_text() else { continue };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    };

    // Relay updates from other connections to this one.
    let mut updates = state.graph.updates();
    let forward_tx = out_tx.clone();
    let forward_subs = subscriptions.clone();
    let forwarder = async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if update.origin == Some(conn) {
                        continue;
                    }
                    let wanted = forward_subs
                        .read()
                        .iter()
                        .any(|prefix| update.path.starts_with(prefix));
                    if wanted
                        && forward_tx
                            .send(SyncMessage::Update {
                                path: update.path,
                                value: update.value,
                            })
                            .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(conn, skipped, "peer lagged behind relay updates");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    let reader = async move {
        while let Some(frame) = receiver.next().await {
            let msg = match frame {
                Ok(Message::Text(text)) => SyncMessage::from_text(text.as_str()).map_err(|e| e.to_string()),
                Ok(Message::Binary(bin)) => SyncMessage::from_cbor(&bin).map_err(|e| e.to_string()),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let reply = match msg {
                Ok(msg) => handle_message(&state, conn, &subscriptions, msg),
                Err(message) => vec![SyncMessage::Error { id: None, message }],
            };
            for msg in reply {
                if out_tx.send(msg).is_err() {
                    return;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = forwarder => {}
        _ = reader => {}
    }
    tracing::info!(conn, "peer disconnected");
}

fn handle_message(
    state: &RelayState,
    conn: u64,
    subscriptions: &RwLock<Vec<TransportPath>>,
    msg: SyncMessage,
) -> Vec<SyncMessage> {
    match msg {
        SyncMessage::Subscribe { path } => {
            tracing::debug!(conn, %path, "subscribe");
            subscriptions.write().push(path.clone());
            state
                .graph
                .entries_under(&path)
                .into_iter()
                .map(|(path, value)| SyncMessage::Update {
                    path,
                    value: Some(value),
                })
                .collect()
        }
        SyncMessage::Put { id, path, value } => {
            tracing::debug!(conn, %path, tombstone = value.is_none(), "put");
            state.graph.apply(path, value, Some(conn));
            vec![SyncMessage::Ack { id }]
        }
        SyncMessage::Get { id, path } => vec![SyncMessage::Reply {
            id,
            value: state.graph.get(&path),
        }],
        SyncMessage::Handshake { server_id } => {
            tracing::debug!(conn, %server_id, "peer handshake");
            Vec::new()
        }
        SyncMessage::Ack { .. }
        | SyncMessage::Reply { .. }
        | SyncMessage::Update { .. }
        | SyncMessage::Error { .. } => vec![SyncMessage::Error {
            id: None,
            message: "unexpected message from peer".to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn room() -> TransportPath {
        TransportPath::from_segments(["CodeMate", "r1"])
    }

    #[test]
    fn subscribe_replays_existing_entries() {
        let state = RelayState::new();
        state
            .graph
            .apply(room().child("a.txt"), Some(json!("hello")), Some(9));
        state
            .graph
            .apply(TransportPath::from_segments(["CodeMate", "other", "b.txt"]), Some(json!("x")), Some(9));

        let subs = RwLock::new(Vec::new());
        let replies = handle_message(&state, 1, &subs, SyncMessage::Subscribe { path: room() });
        assert_eq!(
            replies,
            vec![SyncMessage::Update {
                path: room().child("a.txt"),
                value: Some(json!("hello")),
            }]
        );
        assert_eq!(subs.read().len(), 1);
    }

    #[test]
    fn put_is_applied_and_acknowledged() {
        let state = RelayState::new();
        let subs = RwLock::new(Vec::new());
        let replies = handle_message(
            &state,
            1,
            &subs,
            SyncMessage::Put {
                id: 4,
                path: room().child("a.txt"),
                value: Some(json!("v")),
            },
        );
        assert_eq!(replies, vec![SyncMessage::Ack { id: 4 }]);

        let replies = handle_message(
            &state,
            2,
            &subs,
            SyncMessage::Get {
                id: 5,
                path: room().child("a.txt"),
            },
        );
        assert_eq!(
            replies,
            vec![SyncMessage::Reply {
                id: 5,
                value: Some(json!("v"))
            }]
        );
    }
}
