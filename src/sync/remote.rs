use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::graph::Graph;
use super::protocol::SyncMessage;
use super::{ChildStream, Transport, TransportPath, ValueStream};
use crate::error::{with_retry, RetryPolicy, SyncError, SyncResult};
use crate::timer::TaskHandle;

type Responder = oneshot::Sender<Result<Option<Value>, String>>;

/// An in-flight request. A write is applied to the mirror only once the relay
/// acknowledges it.
struct Pending {
    link: u64,
    responder: Responder,
    write: Option<(TransportPath, Option<Value>)>,
}

type PendingTable = DashMap<u64, Pending>;

/// Transport backed by a WebSocket relay.
///
/// Everything under the subscribed prefix is mirrored into a local graph, so
/// subscriptions and reads are served locally while writes wait for the
/// relay's acknowledgment. A dropped connection is re-established on the next
/// request.
pub struct RemoteTransport {
    url: Url,
    prefix: TransportPath,
    mirror: Arc<Graph>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    next_link: AtomicU64,
    ack_timeout: Duration,
    reconnect: RetryPolicy,
    link: tokio::sync::Mutex<Link>,
    /// Liveness of the current link, readable without waiting on `link`
    up: RwLock<Arc<AtomicBool>>,
}

/// One live socket to the relay.
struct Link {
    id: u64,
    outbound: mpsc::UnboundedSender<SyncMessage>,
    connected: Arc<AtomicBool>,
    _task: TaskHandle,
}

impl Link {
    fn is_up(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open(
        id: u64,
        url: &Url,
        prefix: &TransportPath,
        mirror: Arc<Graph>,
        pending: Arc<PendingTable>,
    ) -> SyncResult<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::transport(url.as_str(), e))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, mut rx) = mpsc::unbounded_channel::<SyncMessage>();

        // Queued first so the relay replays the room before anything else.
        let _ = outbound.send(SyncMessage::Subscribe {
            path: prefix.clone(),
        });

        let task_connected = connected.clone();
        let relay = url.to_string();
        let task = TaskHandle::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => {
                        let Some(msg) = outgoing else { break };
                        match msg.to_text() {
                            Ok(text) => {
                                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("dropping unencodable frame: {e}"),
                        }
                    }
                    incoming = ws_rx.next() => {
                        let msg = match incoming {
                            Some(Ok(Message::Text(text))) => SyncMessage::from_text(text.as_str()).ok(),
                            Some(Ok(Message::Binary(bin))) => SyncMessage::from_cbor(&bin).ok(),
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => None,
                        };
                        if let Some(msg) = msg {
                            handle_incoming(&mirror, &pending, msg);
                        }
                    }
                }
            }

            task_connected.store(false, Ordering::SeqCst);
            let ids: Vec<u64> = pending
                .iter()
                .filter(|entry| entry.value().link == id)
                .map(|entry| *entry.key())
                .collect();
            for request in ids {
                if let Some((_, waiting)) = pending.remove(&request) {
                    let _ = waiting.responder.send(Err("relay connection closed".to_string()));
                }
            }
            tracing::warn!(%relay, "relay connection closed");
        });

        tracing::info!(%url, %prefix, link = id, "connected to relay");
        Ok(Self {
            id,
            outbound,
            connected,
            _task: task,
        })
    }
}

impl RemoteTransport {
    /// Connect to `url` and mirror every entry under `prefix`. After a drop,
    /// each request makes one reconnect attempt.
    pub async fn connect(url: &str, prefix: TransportPath, ack_timeout: Duration) -> SyncResult<Self> {
        let url = Url::parse(url).map_err(|e| SyncError::transport(url, format!("invalid ws url: {e}")))?;
        let mirror = Arc::new(Graph::new());
        let pending: Arc<PendingTable> = Arc::new(DashMap::new());
        let link = Link::open(0, &url, &prefix, mirror.clone(), pending.clone()).await?;

        Ok(Self {
            url,
            prefix,
            mirror,
            pending,
            next_id: AtomicU64::new(1),
            next_link: AtomicU64::new(1),
            ack_timeout,
            reconnect: RetryPolicy::no_retry(),
            up: RwLock::new(link.connected.clone()),
            link: tokio::sync::Mutex::new(link),
        })
    }

    /// Like [`connect`](Self::connect), retrying the first connection with
    /// `policy` and using it again for later reconnects.
    pub async fn connect_with_retry(
        url: &str,
        prefix: TransportPath,
        ack_timeout: Duration,
        policy: &RetryPolicy,
    ) -> SyncResult<Self> {
        let mut transport =
            with_retry(policy, || Self::connect(url, prefix.clone(), ack_timeout)).await?;
        transport.reconnect = policy.clone();
        Ok(transport)
    }

    pub fn is_connected(&self) -> bool {
        self.up.read().load(Ordering::SeqCst)
    }

    /// Outbound queue of a live link, reconnecting first if the last one dropped.
    async fn live_link(&self, path: &TransportPath) -> SyncResult<(u64, mpsc::UnboundedSender<SyncMessage>)> {
        let mut link = self.link.lock().await;
        if !link.is_up() {
            tracing::info!(url = %self.url, "reconnecting to relay");
            let (url, prefix, next_link) = (&self.url, &self.prefix, &self.next_link);
            let fresh = with_retry(&self.reconnect, || {
                let id = next_link.fetch_add(1, Ordering::Relaxed);
                Link::open(id, url, prefix, self.mirror.clone(), self.pending.clone())
            })
            .await
            .map_err(|e| {
                tracing::warn!(%path, "relay unreachable: {e}");
                e
            })?;
            *self.up.write() = fresh.connected.clone();
            *link = fresh;
        }
        Ok((link.id, link.outbound.clone()))
    }

    async fn request(
        &self,
        path: &TransportPath,
        write: Option<Option<Value>>,
        build: impl FnOnce(u64) -> SyncMessage,
    ) -> SyncResult<Option<Value>> {
        let (link, outbound) = self.live_link(path).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                link,
                responder: tx,
                write: write.map(|value| (path.clone(), value)),
            },
        );
        if outbound.send(build(id)).is_err() {
            self.pending.remove(&id);
            return Err(SyncError::transport(path, "relay disconnected"));
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(SyncError::transport(path, message)),
            Ok(Err(_)) => Err(SyncError::transport(path, "relay connection closed")),
            Err(_) => {
                self.pending.remove(&id);
                Err(SyncError::transport(path, "no acknowledgment from relay"))
            }
        }
    }
}

fn handle_incoming(mirror: &Graph, pending: &PendingTable, msg: SyncMessage) {
    if let Some(id) = msg.response_id() {
        let Some((_, waiting)) = pending.remove(&id) else {
            tracing::debug!(id, "response for an abandoned request");
            return;
        };
        let result = match msg {
            SyncMessage::Ack { .. } => {
                if let Some((path, value)) = waiting.write {
                    mirror.apply(path, value, None);
                }
                Ok(None)
            }
            SyncMessage::Reply { value, .. } => Ok(value),
            SyncMessage::Error { message, .. } => Err(message),
            _ => return,
        };
        let _ = waiting.responder.send(result);
        return;
    }

    match msg {
        SyncMessage::Handshake { server_id } => {
            tracing::debug!(%server_id, "relay handshake");
        }
        SyncMessage::Update { path, value } => {
            tracing::debug!(%path, "remote update");
            mirror.apply(path, value, None);
        }
        SyncMessage::Error { message, .. } => {
            tracing::warn!("relay error: {message}");
        }
        _ => tracing::debug!("ignoring client-only message from relay"),
    }
}

impl Transport for RemoteTransport {
    fn put(&self, path: &TransportPath, value: Option<Value>) -> BoxFuture<'_, SyncResult<()>> {
        let path = path.clone();
        async move {
            let target = path.clone();
            self.request(&path, Some(value.clone()), move |id| SyncMessage::Put {
                id,
                path: target,
                value,
            })
            .await
            .map(|_| ())
        }
        .boxed()
    }

    fn once(&self, path: &TransportPath) -> BoxFuture<'_, SyncResult<Option<Value>>> {
        let path = path.clone();
        async move {
            if let Some(value) = self.mirror.get(&path) {
                return Ok(Some(value));
            }
            let target = path.clone();
            self.request(&path, None, move |id| SyncMessage::Get { id, path: target })
                .await
        }
        .boxed()
    }

    fn subscribe(&self, path: &TransportPath) -> ValueStream {
        self.mirror.watch_path(path)
    }

    fn map_on(&self, path: &TransportPath) -> ChildStream {
        self.mirror.watch_children(path)
    }
}
