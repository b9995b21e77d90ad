//! Loopback backend for testing.
//!
//! A [`LoopbackServer`] holds an in-memory [`MemoryStore`], a presence board
//! and the subscriber registry. Each client obtains its own
//! [`LoopbackBackend`] link via [`LoopbackServer::connect`]; links share the
//! server state but have independent connectivity, so one client can be
//! taken offline while the others keep publishing.
//!
//! Every link carries fault switches (offline, rejected writes, lost
//! responses, slow or failing credential refresh, hanging probes, failing
//! subscribes) and counters that tests use to observe what the core did.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ticketsync_proto::event::{Broadcast, ChangeEvent};
use ticketsync_proto::ids::{Timestamp, UserId};
use ticketsync_proto::presence::PresenceBoard;
use ticketsync_proto::record::{
    ChatMessage, Entity, Filter, NewRecord, Patch, Record, RecordId, Ticket,
};
use ticketsync_proto::store::{Effect, MemoryStore, StoreError};
use ticketsync_proto::topic::TopicKey;

use super::{BackendError, DataApi, RealtimeTransport, Subscribed, SubscriptionHandle};

/// Capacity of each subscription's event channel.
const EVENT_BUFFER: usize = 256;

/// Presence entries older than this are left out of snapshots.
const PRESENCE_TTL_MS: u64 = 60_000;

struct Subscriber {
    link: u64,
    topic: TopicKey,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct ServerState {
    store: MemoryStore,
    presence: PresenceBoard,
    subscribers: HashMap<u64, Subscriber>,
    duplicate_delivery: bool,
    drop_deliveries: usize,
}

impl ServerState {
    /// Delivers `event` to every subscriber of `topic` except those on `skip_link`.
    fn publish(&mut self, topic: &TopicKey, event: &ChangeEvent, skip_link: Option<u64>) {
        let copies = if self.duplicate_delivery { 2 } else { 1 };
        let mut closed = Vec::new();
        for (id, sub) in &self.subscribers {
            if sub.topic != *topic || Some(sub.link) == skip_link {
                continue;
            }
            if self.drop_deliveries > 0 {
                self.drop_deliveries -= 1;
                tracing::debug!(topic = %topic, "loopback dropped a delivery");
                continue;
            }
            for _ in 0..copies {
                if let Err(mpsc::error::TrySendError::Closed(_)) = sub.tx.try_send(event.clone()) {
                    closed.push(*id);
                    break;
                }
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    fn publish_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.publish(&effect.topic, &effect.event, None);
        }
    }

    fn publish_presence(&mut self) {
        let snapshot = self.presence.snapshot(Timestamp::now(), PRESENCE_TTL_MS);
        self.publish(
            &TopicKey::Presence,
            &ChangeEvent::Broadcast(Broadcast::PresenceSync(snapshot)),
            None,
        );
    }
}

/// Shared in-process backend state. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackServer {
    /// Creates an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new client link authenticated as `user`. The link starts online.
    #[must_use]
    pub fn connect(&self, user: UserId) -> LoopbackBackend {
        LoopbackBackend {
            server: self.clone(),
            link: Arc::new(Link {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                user,
                online: AtomicBool::new(true),
                faults: Mutex::new(Faults::default()),
                fetches: Mutex::new(Vec::new()),
                refresh_calls: AtomicUsize::new(0),
                refresh_in_flight: AtomicUsize::new(0),
                refresh_peak: AtomicUsize::new(0),
                subscribe_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Snapshot of all stored tickets.
    #[must_use]
    pub fn tickets(&self) -> Vec<Ticket> {
        self.state.lock().store.tickets().to_vec()
    }

    /// Snapshot of all stored messages.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().store.messages().to_vec()
    }

    /// Deliver every event twice, as a redelivering transport would.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().duplicate_delivery = enabled;
    }

    /// Silently drop the next `count` deliveries.
    pub fn drop_next_deliveries(&self, count: usize) {
        self.state.lock().drop_deliveries = count;
    }

    /// Deliver an arbitrary event to every subscriber of `topic`.
    pub fn inject(&self, topic: &TopicKey, event: &ChangeEvent) {
        self.state.lock().publish(topic, event, None);
    }

    /// Number of open subscriptions to `topic` across all links.
    #[must_use]
    pub fn live_subscriptions(&self, topic: &TopicKey) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .filter(|s| s.topic == *topic && !s.tx.is_closed())
            .count()
    }
}

#[derive(Default)]
struct Faults {
    reject_writes: usize,
    lose_responses: usize,
    response_delay: Option<Duration>,
    refresh_fails: bool,
    refresh_delay: Option<Duration>,
    probe_hangs: bool,
    subscribe_failures: usize,
    subscribe_delay: Option<Duration>,
}

struct Link {
    id: u64,
    user: UserId,
    online: AtomicBool,
    faults: Mutex<Faults>,
    fetches: Mutex<Vec<(Entity, Filter)>>,
    refresh_calls: AtomicUsize,
    refresh_in_flight: AtomicUsize,
    refresh_peak: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

/// Decrements an in-flight counter when dropped, even if the future is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One client's connection to a [`LoopbackServer`].
#[derive(Clone)]
pub struct LoopbackBackend {
    server: LoopbackServer,
    link: Arc<Link>,
}

impl LoopbackBackend {
    /// The server this link talks to.
    #[must_use]
    pub const fn server(&self) -> &LoopbackServer {
        &self.server
    }

    /// The user this link is authenticated as.
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.link.user
    }

    /// Whether the link is currently reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.link.online.load(Ordering::Acquire)
    }

    /// Take the link offline or bring it back.
    ///
    /// Going offline closes every subscription stream of this link and
    /// removes its user from presence; events published meanwhile are lost.
    pub fn set_online(&self, online: bool) {
        let was = self.link.online.swap(online, Ordering::AcqRel);
        if was && !online {
            let mut state = self.server.state.lock();
            state.subscribers.retain(|_, s| s.link != self.link.id);
            if state.presence.leave(&self.link.user) {
                state.publish_presence();
            }
            drop(state);
            tracing::info!(user = %self.link.user, "loopback link offline");
        } else if !was && online {
            tracing::info!(user = %self.link.user, "loopback link online");
        }
    }

    /// Refuse the next `count` writes with [`BackendError::Rejected`].
    pub fn reject_next_writes(&self, count: usize) {
        self.link.faults.lock().reject_writes = count;
    }

    /// Apply the next `count` writes but report [`BackendError::Unavailable`].
    pub fn lose_next_responses(&self, count: usize) {
        self.link.faults.lock().lose_responses = count;
    }

    /// Hold every write response for `delay` after the write is applied.
    pub fn delay_responses(&self, delay: Option<Duration>) {
        self.link.faults.lock().response_delay = delay;
    }

    /// Make `refresh_credentials` fail even while online.
    pub fn fail_refresh(&self, fail: bool) {
        self.link.faults.lock().refresh_fails = fail;
    }

    /// Make `refresh_credentials` take `delay` before answering.
    pub fn delay_refresh(&self, delay: Option<Duration>) {
        self.link.faults.lock().refresh_delay = delay;
    }

    /// Make `probe` never answer.
    pub fn hang_probes(&self, hang: bool) {
        self.link.faults.lock().probe_hangs = hang;
    }

    /// Fail the next `count` subscribe calls.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.link.faults.lock().subscribe_failures = count;
    }

    /// Make `subscribe` take `delay` before the subscription is opened.
    pub fn delay_subscribes(&self, delay: Option<Duration>) {
        self.link.faults.lock().subscribe_delay = delay;
    }

    /// Every `fetch_list` call made through this link, in order.
    #[must_use]
    pub fn fetches(&self) -> Vec<(Entity, Filter)> {
        self.link.fetches.lock().clone()
    }

    /// Number of `fetch_list` calls matching `filter`.
    #[must_use]
    pub fn fetch_count(&self, filter: &Filter) -> usize {
        self.link
            .fetches
            .lock()
            .iter()
            .filter(|(_, f)| f == filter)
            .count()
    }

    /// Number of `refresh_credentials` calls so far.
    #[must_use]
    pub fn refresh_calls(&self) -> usize {
        self.link.refresh_calls.load(Ordering::Acquire)
    }

    /// Highest number of `refresh_credentials` calls ever running at once.
    #[must_use]
    pub fn refresh_peak(&self) -> usize {
        self.link.refresh_peak.load(Ordering::Acquire)
    }

    /// Number of `subscribe` calls so far.
    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.link.subscribe_calls.load(Ordering::Acquire)
    }

    /// Number of open subscriptions this link holds for `topic`.
    #[must_use]
    pub fn live_subscriptions(&self, topic: &TopicKey) -> usize {
        self.server
            .state
            .lock()
            .subscribers
            .values()
            .filter(|s| s.link == self.link.id && s.topic == *topic && !s.tx.is_closed())
            .count()
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("loopback link offline".into()))
        }
    }

    /// Runs a store write with the link's fault switches applied.
    async fn write<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut MemoryStore, Timestamp) -> Result<(T, Vec<Effect>), StoreError>,
    {
        self.ensure_online()?;
        let (reject, lose, delay) = {
            let mut faults = self.link.faults.lock();
            let reject = faults.reject_writes > 0;
            faults.reject_writes = faults.reject_writes.saturating_sub(1);
            let lose = !reject && faults.lose_responses > 0;
            if lose {
                faults.lose_responses -= 1;
            }
            (reject, lose, faults.response_delay)
        };
        if reject {
            return Err(BackendError::Rejected("write refused by loopback".into()));
        }

        let value = {
            let mut state = self.server.state.lock();
            let (value, effects) = op(&mut state.store, Timestamp::now()).map_err(map_store_error)?;
            state.publish_effects(effects);
            value
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lose {
            return Err(BackendError::Unavailable("write response lost".into()));
        }
        Ok(value)
    }
}

fn map_store_error(err: StoreError) -> BackendError {
    match err {
        StoreError::NotFound(what) => BackendError::NotFound(what),
        StoreError::Rejected(reason) => BackendError::Rejected(reason),
    }
}

impl DataApi for LoopbackBackend {
    async fn fetch_list(
        &self,
        entity: Entity,
        filter: Filter,
    ) -> Result<Vec<Record>, BackendError> {
        self.ensure_online()?;
        self.link.fetches.lock().push((entity, filter.clone()));
        self.server
            .state
            .lock()
            .store
            .fetch_list(entity, &filter)
            .map_err(map_store_error)
    }

    async fn fetch_one(&self, id: RecordId) -> Result<Record, BackendError> {
        self.ensure_online()?;
        self.server
            .state
            .lock()
            .store
            .fetch_one(&id)
            .map_err(map_store_error)
    }

    async fn insert(&self, payload: NewRecord) -> Result<Record, BackendError> {
        self.write(move |store, now| store.insert(payload, now))
            .await
    }

    async fn update(&self, id: RecordId, patch: Patch) -> Result<Record, BackendError> {
        self.write(move |store, now| store.update(&id, patch, now))
            .await
    }

    async fn delete(&self, id: RecordId) -> Result<(), BackendError> {
        self.write(move |store, _| store.delete(&id).map(|effects| ((), effects)))
            .await
    }
}

impl RealtimeTransport for LoopbackBackend {
    async fn subscribe(&self, topic: &TopicKey) -> Result<Subscribed, BackendError> {
        self.link.subscribe_calls.fetch_add(1, Ordering::AcqRel);
        self.ensure_online()?;
        let delay = {
            let mut faults = self.link.faults.lock();
            if faults.subscribe_failures > 0 {
                faults.subscribe_failures -= 1;
                return Err(BackendError::Unavailable("subscribe refused by loopback".into()));
            }
            faults.subscribe_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_online()?;
        }

        let id = self.server.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut state = self.server.state.lock();
        if *topic == TopicKey::Presence {
            let snapshot = state.presence.snapshot(Timestamp::now(), PRESENCE_TTL_MS);
            let _ = tx.try_send(ChangeEvent::Broadcast(Broadcast::PresenceSync(snapshot)));
        }
        state.subscribers.insert(
            id,
            Subscriber {
                link: self.link.id,
                topic: topic.clone(),
                tx,
            },
        );
        drop(state);
        tracing::debug!(topic = %topic, sub = id, "loopback subscription opened");
        Ok(Subscribed {
            handle: SubscriptionHandle::new(id),
            events: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.server.state.lock().subscribers.remove(&handle.raw());
    }

    async fn broadcast(&self, topic: &TopicKey, payload: Broadcast) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut state = self.server.state.lock();
        match payload {
            Broadcast::Heartbeat(entry) => {
                state.presence.heartbeat(entry);
                state.publish_presence();
            }
            other => {
                state.publish(topic, &ChangeEvent::Broadcast(other), Some(self.link.id));
            }
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let hang = self.link.faults.lock().probe_hangs;
        if hang {
            std::future::pending::<()>().await;
        }
        self.ensure_online()
    }

    async fn refresh_credentials(&self) -> Result<(), BackendError> {
        self.link.refresh_calls.fetch_add(1, Ordering::AcqRel);
        let now_in_flight = self.link.refresh_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = InFlight(&self.link.refresh_in_flight);
        self.link
            .refresh_peak
            .fetch_max(now_in_flight, Ordering::AcqRel);

        let (fails, delay) = {
            let faults = self.link.faults.lock();
            (faults.refresh_fails, faults.refresh_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_online()?;
        if fails {
            return Err(BackendError::Unavailable("credential refresh refused".into()));
        }
        Ok(())
    }
}
