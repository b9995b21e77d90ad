//! WebSocket client backend for `ticketsync-hub`.
//!
//! One socket carries everything: data requests matched to responses by
//! `request_id`, topic subscriptions whose events are routed by `sub_id`,
//! broadcasts, and `Ping`/`Pong` liveness probes. Frames are postcard-encoded
//! [`HubFrame`]s in binary WebSocket messages.
//!
//! The socket is owned by a [`Link`]. When the socket dies the link closes:
//! waiting requests fail with [`BackendError::Unavailable`] and every
//! subscription stream ends, which is how the subscription layer learns about
//! the loss. [`RealtimeTransport::refresh_credentials`] replaces the link.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use ticketsync_proto::event::{Broadcast, ChangeEvent};
use ticketsync_proto::hub::{self, HubFailure, HubFrame, HubOp, HubReply};
use ticketsync_proto::ids::UserId;
use ticketsync_proto::record::{Entity, Filter, NewRecord, Patch, Record, RecordId};
use ticketsync_proto::topic::TopicKey;

use super::{BackendError, DataApi, RealtimeTransport, Subscribed, SubscriptionHandle};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSender = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

type ReplySender = oneshot::Sender<Result<HubReply, HubFailure>>;

/// Connection settings for [`HubBackend`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Hub WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// User the session authenticates as.
    pub user_id: UserId,
    /// Session token, if the hub wants one.
    pub token: Option<String>,
    /// Bound on opening the socket and on the authentication handshake.
    pub connect_timeout: Duration,
    /// Bound on one request, subscribe or probe round trip.
    pub request_timeout: Duration,
    /// Capacity of each subscription's event channel.
    pub subscription_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9100/ws".to_string(),
            user_id: UserId::new("anonymous"),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            subscription_buffer: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Link: one authenticated socket
// ---------------------------------------------------------------------------

/// Waiters and streams of one socket, shared with its reader task.
#[derive(Default)]
struct Routes {
    connected: AtomicBool,
    replies: Mutex<HashMap<u64, ReplySender>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    pongs: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    streams: Mutex<HashMap<u64, mpsc::Sender<ChangeEvent>>>,
}

impl Routes {
    /// Marks the socket dead and drops every waiter and stream.
    fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.replies.lock().clear();
        self.acks.lock().clear();
        self.pongs.lock().clear();
        self.streams.lock().clear();
    }
}

struct Link {
    routes: Arc<Routes>,
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    async fn open(config: &HubConfig) -> Result<Self, BackendError> {
        let url = config.url.as_str();
        let connect = tokio::time::timeout(config.connect_timeout, connect_async(url));
        let (ws_stream, _response) = connect
            .await
            .map_err(|_| {
                tracing::warn!(url, "hub connect timed out");
                BackendError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, error = %e, "hub connect failed");
                BackendError::Unavailable(e.to_string())
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = HubFrame::Authenticate {
            user_id: config.user_id.clone(),
            token: config.token.clone(),
        };
        let bytes = hub::encode(&hello).map_err(|e| BackendError::Protocol(e.to_string()))?;
        ws_sender
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| BackendError::Unavailable(format!("failed to send Authenticate: {e}")))?;

        let ack = tokio::time::timeout(config.connect_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url, "hub authentication timed out");
                BackendError::Timeout
            })?;

        match ack {
            Some(Ok(Message::Binary(data))) => match hub::decode(&data) {
                Ok(HubFrame::Authenticated { user_id }) => {
                    tracing::info!(user = %user_id, url, "authenticated with hub");
                }
                Ok(HubFrame::Error { reason }) => {
                    tracing::warn!(%reason, "hub refused session");
                    return Err(BackendError::Rejected(reason));
                }
                Ok(other) => {
                    return Err(BackendError::Protocol(format!(
                        "unexpected frame during authentication: {other:?}"
                    )));
                }
                Err(e) => return Err(BackendError::Protocol(e.to_string())),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(BackendError::Unavailable(
                    "hub closed the connection during authentication".into(),
                ));
            }
            Some(Ok(_)) => {
                return Err(BackendError::Protocol(
                    "unexpected non-binary frame during authentication".into(),
                ));
            }
            Some(Err(e)) => return Err(BackendError::Unavailable(e.to_string())),
        }

        let routes = Arc::new(Routes::default());
        routes.connected.store(true, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::channel(256);
        let reader = tokio::spawn(reader_loop(ws_reader, Arc::clone(&routes)));
        let writer = tokio::spawn(writer_loop(ws_sender, outbound_rx, Arc::clone(&routes)));

        Ok(Self {
            routes,
            outbound,
            reader,
            writer,
        })
    }

    fn is_connected(&self) -> bool {
        self.routes.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, frame: &HubFrame) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::Unavailable("hub connection closed".into()));
        }
        let bytes = hub::encode(frame).map_err(|e| BackendError::Protocol(e.to_string()))?;
        self.outbound
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| BackendError::Unavailable("hub connection closed".into()))
    }

    fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
        self.routes.close();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn writer_loop(
    mut ws_sender: WsSender,
    mut rx: mpsc::Receiver<Message>,
    routes: Arc<Routes>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = ws_sender.send(msg).await {
            tracing::warn!(error = %e, "hub send failed");
            break;
        }
    }
    let _ = ws_sender.close().await;
    routes.close();
}

/// Routes incoming frames to their waiters. Malformed frames are skipped.
async fn reader_loop(mut ws_reader: WsReader, routes: Arc<Routes>) {
    while let Some(msg_result) = ws_reader.next().await {
        let data = match msg_result {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => {
                tracing::info!("hub closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "hub read error");
                break;
            }
        };
        let frame = match hub::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "malformed hub frame, skipping");
                continue;
            }
        };
        match frame {
            HubFrame::Response { request_id, result } => {
                if let Some(tx) = routes.replies.lock().remove(&request_id) {
                    let _ = tx.send(result);
                }
            }
            HubFrame::Subscribed { sub_id } => {
                if let Some(tx) = routes.acks.lock().remove(&sub_id) {
                    let _ = tx.send(());
                }
            }
            HubFrame::Pong { nonce } => {
                if let Some(tx) = routes.pongs.lock().remove(&nonce) {
                    let _ = tx.send(());
                }
            }
            HubFrame::Event { sub_id, event } => {
                let tx = routes.streams.lock().get(&sub_id).cloned();
                let Some(tx) = tx else {
                    tracing::debug!(sub_id, "event for closed subscription dropped");
                    continue;
                };
                if tx.send(event).await.is_err() {
                    routes.streams.lock().remove(&sub_id);
                }
            }
            HubFrame::Error { reason } => {
                tracing::warn!(%reason, "hub error");
            }
            other => {
                tracing::debug!(?other, "unexpected hub frame");
            }
        }
    }
    routes.close();
    tracing::info!("hub reader task exiting");
}

// ---------------------------------------------------------------------------
// HubBackend
// ---------------------------------------------------------------------------

/// [`DataApi`] and [`RealtimeTransport`] over a hub connection.
///
/// A backend created with [`HubBackend::new`] starts without a socket; the
/// first probe fails and the connection supervisor calls
/// `refresh_credentials`, which opens it.
pub struct HubBackend {
    config: HubConfig,
    link: Mutex<Option<Arc<Link>>>,
    next_id: AtomicU64,
}

impl HubBackend {
    /// Creates a backend that is not connected yet.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a backend and opens its socket.
    ///
    /// # Errors
    ///
    /// [`BackendError::Timeout`] or [`BackendError::Unavailable`] if the hub
    /// cannot be reached, [`BackendError::Rejected`] if it refuses the session.
    pub async fn connect(config: HubConfig) -> Result<Self, BackendError> {
        let backend = Self::new(config);
        backend.reconnect().await?;
        Ok(backend)
    }

    /// The hub URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Whether the socket is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|l| l.is_connected())
    }

    /// Drops the socket, as if the network went away.
    pub fn disconnect(&self) {
        if let Some(link) = self.link.lock().take() {
            link.shutdown();
        }
    }

    async fn reconnect(&self) -> Result<(), BackendError> {
        self.disconnect();
        let link = Link::open(&self.config).await?;
        *self.link.lock() = Some(Arc::new(link));
        Ok(())
    }

    fn current(&self) -> Result<Arc<Link>, BackendError> {
        self.link
            .lock()
            .as_ref()
            .filter(|l| l.is_connected())
            .cloned()
            .ok_or_else(|| BackendError::Unavailable("not connected to hub".into()))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, op: HubOp) -> Result<HubReply, BackendError> {
        let link = self.current()?;
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        link.routes.replies.lock().insert(request_id, tx);

        if let Err(e) = link.send(&HubFrame::Request { request_id, op }).await {
            link.routes.replies.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result.map_err(|failure| match failure {
                HubFailure::NotFound(what) => BackendError::NotFound(what),
                HubFailure::Rejected(why) => BackendError::Rejected(why),
            }),
            Ok(Err(_)) => Err(BackendError::Unavailable(
                "hub connection lost before reply".into(),
            )),
            Err(_) => {
                link.routes.replies.lock().remove(&request_id);
                Err(BackendError::Timeout)
            }
        }
    }

    async fn request_record(&self, op: HubOp) -> Result<Record, BackendError> {
        match self.request(op).await? {
            HubReply::Record(record) => Ok(record),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &HubReply) -> BackendError {
    BackendError::Protocol(format!("unexpected reply: {reply:?}"))
}

impl DataApi for HubBackend {
    async fn fetch_list(
        &self,
        entity: Entity,
        filter: Filter,
    ) -> Result<Vec<Record>, BackendError> {
        match self.request(HubOp::FetchList { entity, filter }).await? {
            HubReply::Records(records) => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_one(&self, id: RecordId) -> Result<Record, BackendError> {
        self.request_record(HubOp::FetchOne(id)).await
    }

    async fn insert(&self, payload: NewRecord) -> Result<Record, BackendError> {
        self.request_record(HubOp::Insert(payload)).await
    }

    async fn update(&self, id: RecordId, patch: Patch) -> Result<Record, BackendError> {
        self.request_record(HubOp::Update { id, patch }).await
    }

    async fn delete(&self, id: RecordId) -> Result<(), BackendError> {
        match self.request(HubOp::Delete(id)).await? {
            HubReply::Deleted => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

impl RealtimeTransport for HubBackend {
    async fn subscribe(&self, topic: &TopicKey) -> Result<Subscribed, BackendError> {
        let link = self.current()?;
        let sub_id = self.next_id();
        let (events_tx, events) = mpsc::channel(self.config.subscription_buffer.max(1));
        let (ack_tx, ack_rx) = oneshot::channel();
        link.routes.streams.lock().insert(sub_id, events_tx);
        link.routes.acks.lock().insert(sub_id, ack_tx);

        let frame = HubFrame::Subscribe {
            sub_id,
            topic: topic.clone(),
        };
        let result = match link.send(&frame).await {
            Ok(()) => match tokio::time::timeout(self.config.request_timeout, ack_rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(BackendError::Unavailable(
                    "hub connection lost before subscribe ack".into(),
                )),
                Err(_) => Err(BackendError::Timeout),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            link.routes.acks.lock().remove(&sub_id);
            link.routes.streams.lock().remove(&sub_id);
            return Err(e);
        }
        tracing::debug!(%topic, sub_id, "hub subscription open");
        Ok(Subscribed {
            handle: SubscriptionHandle::new(sub_id),
            events,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let Ok(link) = self.current() else {
            return;
        };
        let sub_id = handle.raw();
        if link.routes.streams.lock().remove(&sub_id).is_none() {
            return;
        }
        if let Err(e) = link.send(&HubFrame::Unsubscribe { sub_id }).await {
            tracing::debug!(sub_id, error = %e, "unsubscribe not delivered");
        }
    }

    async fn broadcast(&self, topic: &TopicKey, payload: Broadcast) -> Result<(), BackendError> {
        let link = self.current()?;
        link.send(&HubFrame::Publish {
            topic: topic.clone(),
            payload,
        })
        .await
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let link = self.current()?;
        let nonce = self.next_id();
        let (tx, rx) = oneshot::channel();
        link.routes.pongs.lock().insert(nonce, tx);
        link.send(&HubFrame::Ping { nonce }).await?;
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BackendError::Unavailable("hub connection lost".into())),
            Err(_) => {
                link.routes.pongs.lock().remove(&nonce);
                Err(BackendError::Timeout)
            }
        }
    }

    async fn refresh_credentials(&self) -> Result<(), BackendError> {
        self.reconnect().await
    }
}
