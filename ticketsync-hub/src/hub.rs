//! Hub server core: shared state, WebSocket handler, request handling and
//! topic fan-out.
//!
//! Every connection authenticates first, then sends requests, subscribes to
//! topics and publishes broadcasts. Writes go through a [`MemoryStore`];
//! the change events it reports are delivered to every subscription on the
//! affected topics. Heartbeats feed a [`PresenceBoard`] whose full snapshot
//! is pushed to presence subscribers after every change.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use ticketsync_proto::event::{Broadcast, ChangeEvent};
use ticketsync_proto::hub::{self, HubFailure, HubFrame, HubOp, HubReply};
use ticketsync_proto::ids::{Timestamp, UserId};
use ticketsync_proto::presence::PresenceBoard;
use ticketsync_proto::store::{Effect, MemoryStore};
use ticketsync_proto::topic::TopicKey;

use crate::config::HubConfig;

/// One authenticated client connection.
struct Connection {
    user_id: UserId,
    tx: mpsc::UnboundedSender<Message>,
    subscriptions: HashMap<u64, TopicKey>,
}

/// Shared hub state: the record store, live connections and presence.
pub struct HubState {
    store: RwLock<MemoryStore>,
    connections: RwLock<HashMap<u64, Connection>>,
    presence: RwLock<PresenceBoard>,
    next_connection: AtomicU64,
    max_frame_size: usize,
    presence_ttl_ms: u64,
    access_token: Option<String>,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    /// Creates an empty hub with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&HubConfig::default())
    }

    /// Creates an empty hub using the limits of `config`.
    #[must_use]
    pub fn with_config(config: &HubConfig) -> Self {
        Self {
            store: RwLock::new(MemoryStore::new()),
            connections: RwLock::new(HashMap::new()),
            presence: RwLock::new(PresenceBoard::new()),
            next_connection: AtomicU64::new(1),
            max_frame_size: config.max_frame_size,
            presence_ttl_ms: duration_ms(config.presence_ttl),
            access_token: config.access_token.clone(),
        }
    }

    /// Number of authenticated connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of open subscriptions on `topic` across all connections.
    pub async fn subscriber_count(&self, topic: &TopicKey) -> usize {
        self.connections
            .read()
            .await
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|t| *t == topic)
            .count()
    }

    /// Send a WebSocket Close frame to every connection.
    ///
    /// Clients see the socket close and go through their reconnection path.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (id, conn) in conns.iter() {
            tracing::info!(connection = id, user = %conn.user_id, "closing connection");
            let _ = conn.tx.send(Message::Close(None));
        }
    }

    async fn register(&self, user_id: UserId, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(
            id,
            Connection {
                user_id,
                tx,
                subscriptions: HashMap::new(),
            },
        );
        id
    }

    async fn unregister(&self, id: u64) {
        let Some(gone) = self.connections.write().await.remove(&id) else {
            return;
        };
        let still_connected = self
            .connections
            .read()
            .await
            .values()
            .any(|c| c.user_id == gone.user_id);
        if !still_connected && self.presence.write().await.leave(&gone.user_id) {
            self.publish_presence().await;
        }
    }

    /// Delivers `event` to every subscription on `topic`, except those of
    /// connection `skip`.
    async fn publish(&self, topic: &TopicKey, event: &ChangeEvent, skip: Option<u64>) {
        let conns = self.connections.read().await;
        for (id, conn) in conns.iter() {
            if Some(*id) == skip {
                continue;
            }
            for (sub_id, _) in conn.subscriptions.iter().filter(|(_, t)| *t == topic) {
                send_frame(
                    &conn.tx,
                    &HubFrame::Event {
                        sub_id: *sub_id,
                        event: event.clone(),
                    },
                );
            }
        }
    }

    async fn publish_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.publish(&effect.topic, &effect.event, None).await;
        }
    }

    async fn presence_snapshot(&self) -> ChangeEvent {
        let snapshot = self
            .presence
            .read()
            .await
            .snapshot(Timestamp::now(), self.presence_ttl_ms);
        ChangeEvent::Broadcast(Broadcast::PresenceSync(snapshot))
    }

    async fn publish_presence(&self) {
        let event = self.presence_snapshot().await;
        self.publish(&TopicKey::Presence, &event, None).await;
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &HubFrame) {
    match hub::encode(frame) {
        Ok(bytes) => {
            let _ = tx.send(Message::Binary(bytes.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode hub frame"),
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Wait for `Authenticate` and answer `Authenticated` (or `Error`).
/// 2. Register the connection.
/// 3. Serve frames until the socket closes.
/// 4. Unregister, dropping the user from presence if this was their last
///    connection.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user_id = match wait_for_authenticate(&mut ws_receiver, state.access_token.as_deref()).await
    {
        Ok(user_id) => user_id,
        Err(reason) => {
            tracing::warn!(%reason, "authentication failed");
            if let Ok(bytes) = hub::encode(&HubFrame::Error { reason }) {
                let _ = ws_sender.send(Message::Binary(bytes.into())).await;
            }
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    send_frame(
        &tx,
        &HubFrame::Authenticated {
            user_id: user_id.clone(),
        },
    );
    let conn_id = state.register(user_id.clone(), tx).await;
    tracing::info!(connection = conn_id, user = %user_id, "client authenticated");

    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user_id.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(conn_id, &reader_user, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(conn_id).await;
    tracing::info!(connection = conn_id, user = %user_id, "client disconnected");
}

/// Waits for the first binary frame, which must be a valid `Authenticate`.
async fn wait_for_authenticate(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    access_token: Option<&str>,
) -> Result<UserId, String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match hub::decode(&data) {
                    Ok(HubFrame::Authenticate { user_id, token }) => {
                        if user_id.as_str().trim().is_empty() {
                            Err("empty user id".into())
                        } else if access_token.is_some_and(|t| token.as_deref() != Some(t)) {
                            Err("invalid token".into())
                        } else {
                            Ok(user_id)
                        }
                    }
                    Ok(other) => Err(format!("expected Authenticate, got {other:?}")),
                    Err(e) => Err(format!("malformed Authenticate: {e}")),
                };
            }
            Message::Close(_) => return Err("closed before authenticating".into()),
            _ => {}
        }
    }
    Err("closed before authenticating".into())
}

/// Handles one binary frame from an authenticated client.
async fn handle_binary_message(conn_id: u64, user_id: &UserId, data: &[u8], state: &Arc<HubState>) {
    if data.len() > state.max_frame_size {
        tracing::warn!(
            user = %user_id,
            size = data.len(),
            max = state.max_frame_size,
            "frame exceeds size limit"
        );
        reply(
            state,
            conn_id,
            &HubFrame::Error {
                reason: format!(
                    "frame too large: {} bytes (max {})",
                    data.len(),
                    state.max_frame_size
                ),
            },
        )
        .await;
        return;
    }

    let frame = match hub::decode(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user = %user_id, error = %e, "failed to decode frame");
            return;
        }
    };

    match frame {
        HubFrame::Request { request_id, op } => {
            let result = handle_request(state, op).await;
            if let Err(failure) = &result {
                tracing::debug!(user = %user_id, request_id, error = %failure, "request failed");
            }
            reply(state, conn_id, &HubFrame::Response { request_id, result }).await;
        }
        HubFrame::Subscribe { sub_id, topic } => {
            subscribe(state, conn_id, sub_id, topic).await;
        }
        HubFrame::Unsubscribe { sub_id } => {
            if let Some(conn) = state.connections.write().await.get_mut(&conn_id) {
                conn.subscriptions.remove(&sub_id);
            }
        }
        HubFrame::Publish { topic, payload } => {
            handle_publish(state, conn_id, user_id, topic, payload).await;
        }
        HubFrame::Ping { nonce } => {
            reply(state, conn_id, &HubFrame::Pong { nonce }).await;
        }
        other => {
            tracing::warn!(user = %user_id, frame = ?other, "unexpected frame from client");
        }
    }
}

async fn handle_request(state: &Arc<HubState>, op: HubOp) -> Result<HubReply, HubFailure> {
    let now = Timestamp::now();
    match op {
        HubOp::FetchList { entity, filter } => Ok(HubReply::Records(
            state.store.read().await.fetch_list(entity, &filter)?,
        )),
        HubOp::FetchOne(id) => Ok(HubReply::Record(state.store.read().await.fetch_one(&id)?)),
        HubOp::Insert(payload) => {
            // Publish under the store lock so events leave in write order.
            let mut store = state.store.write().await;
            let (record, effects) = store.insert(payload, now)?;
            state.publish_effects(effects).await;
            Ok(HubReply::Record(record))
        }
        HubOp::Update { id, patch } => {
            let mut store = state.store.write().await;
            let (record, effects) = store.update(&id, patch, now)?;
            state.publish_effects(effects).await;
            Ok(HubReply::Record(record))
        }
        HubOp::Delete(id) => {
            let mut store = state.store.write().await;
            let effects = store.delete(&id)?;
            state.publish_effects(effects).await;
            Ok(HubReply::Deleted)
        }
    }
}

async fn subscribe(state: &Arc<HubState>, conn_id: u64, sub_id: u64, topic: TopicKey) {
    {
        let mut conns = state.connections.write().await;
        let Some(conn) = conns.get_mut(&conn_id) else {
            return;
        };
        conn.subscriptions.insert(sub_id, topic.clone());
        send_frame(&conn.tx, &HubFrame::Subscribed { sub_id });
    }
    tracing::debug!(connection = conn_id, %topic, sub_id, "subscribed");

    if topic == TopicKey::Presence {
        let event = state.presence_snapshot().await;
        reply(state, conn_id, &HubFrame::Event { sub_id, event }).await;
    }
}

async fn handle_publish(
    state: &Arc<HubState>,
    conn_id: u64,
    user_id: &UserId,
    topic: TopicKey,
    payload: Broadcast,
) {
    match payload {
        Broadcast::Heartbeat(mut entry) => {
            // The session decides who is online, not the payload.
            entry.user_id = user_id.clone();
            entry.last_seen_at = Timestamp::now();
            state.presence.write().await.heartbeat(entry);
            state.publish_presence().await;
        }
        Broadcast::Typing(mut signal) => {
            signal.user_id = user_id.clone();
            state
                .publish(
                    &topic,
                    &ChangeEvent::Broadcast(Broadcast::Typing(signal)),
                    Some(conn_id),
                )
                .await;
        }
        Broadcast::PresenceSync(_) => {
            tracing::warn!(user = %user_id, "clients may not publish presence snapshots");
        }
    }
}

async fn reply(state: &Arc<HubState>, conn_id: u64, frame: &HubFrame) {
    if let Some(conn) = state.connections.read().await.get(&conn_id) {
        send_frame(&conn.tx, frame);
    }
}

/// Starts the hub on the given address and returns the bound address and a
/// join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(HubState::new())).await
}

/// Starts the hub with a pre-configured [`HubState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "hub server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<HubState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
