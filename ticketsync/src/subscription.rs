//! Topic subscription lifecycle.
//!
//! The [`SubscriptionOrchestrator`] keeps at most one live transport
//! subscription per [`TopicKey`]. Each subscription has a liveness flag and
//! a pump task that drains its event channel in delivery order and hands
//! events to the topic's [`TopicHandler`]. Releasing a topic flips the flag
//! synchronously, so a stale pump never dispatches another event, even if
//! the transport still has some buffered.
//!
//! Every (re-)establishment calls [`TopicHandler::on_established`], which is
//! where the owner runs a full resynchronization fetch: the transport does
//! not replay events missed while a subscription was down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use ticketsync_proto::event::{Broadcast, ChangeEvent};
use ticketsync_proto::ids::Timestamp;
use ticketsync_proto::record::Record;
use ticketsync_proto::topic::TopicKey;

use crate::backend::{BackendError, RealtimeTransport, SubscriptionHandle};
use crate::connection::ConnectionStatus;

/// Receives the events of one topic.
///
/// Called from the topic's pump task, one event at a time, in delivery
/// order. Implementations must not block.
pub trait TopicHandler: Send + Sync + 'static {
    /// A record was created.
    fn on_insert(&self, _topic: &TopicKey, _record: Record) {}

    /// A record changed.
    fn on_update(&self, _topic: &TopicKey, _record: Record) {}

    /// A record was removed.
    fn on_delete(&self, _topic: &TopicKey, _record: Record) {}

    /// An ephemeral broadcast arrived.
    fn on_broadcast(&self, _topic: &TopicKey, _payload: Broadcast) {}

    /// A subscription for the topic was (re-)established.
    fn on_established(&self, _topic: &TopicKey) {}

    /// The transport closed the stream without being asked to.
    fn on_stream_closed(&self, _topic: &TopicKey) {}
}

/// Errors from [`SubscriptionOrchestrator::ensure`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The transport refused or failed to open the subscription.
    #[error("failed to subscribe to {topic}: {source}")]
    Open {
        /// The topic.
        topic: TopicKey,
        /// The transport error.
        source: BackendError,
    },

    /// Too many consecutive failures; no attempt is made until the cooldown ends.
    #[error("subscription to {topic} is cooling down for {remaining:?}")]
    CoolingDown {
        /// The topic.
        topic: TopicKey,
        /// Time left until the next attempt is allowed.
        remaining: Duration,
    },
}

/// Successful result of [`SubscriptionOrchestrator::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A new subscription was opened.
    Opened,
    /// A live subscription already existed.
    AlreadyLive,
    /// Another call is opening the subscription right now.
    InProgress,
    /// The topic was released or reopened while this call was opening it;
    /// the new subscription was closed again.
    Superseded,
}

/// Tuning for subscription opens.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Upper bound for a single subscribe call.
    pub open_timeout: Duration,
    /// Consecutive failed opens before a topic cools down.
    pub max_open_attempts: u32,
    /// How long a topic cools down.
    pub cooldown: Duration,
    /// Delay between open attempts of a maintained topic.
    pub retry_delay: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            max_open_attempts: 3,
            cooldown: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Public view of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// The topic.
    pub topic: TopicKey,
    /// Transport handle.
    pub handle: SubscriptionHandle,
    /// When the subscription was opened.
    pub established_at: Timestamp,
    /// How many times this topic has been opened.
    pub attempt: u32,
}

struct Live {
    handle: SubscriptionHandle,
    established_at: Timestamp,
    attempt: u32,
    alive: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl Live {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn kill(self) -> SubscriptionHandle {
        self.alive.store(false, Ordering::Release);
        self.pump.abort();
        self.handle
    }
}

struct Slot {
    handler: Arc<dyn TopicHandler>,
    live: Option<Live>,
    opening: Option<u64>,
    opens: u32,
    failures: u32,
    cooldown_until: Option<Instant>,
}

struct Inner<T> {
    transport: Arc<T>,
    config: SubscriptionConfig,
    slots: Mutex<HashMap<TopicKey, Slot>>,
    next_generation: AtomicU64,
    saw_disconnect: AtomicBool,
}

/// Opens, tracks, and tears down topic subscriptions.
pub struct SubscriptionOrchestrator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SubscriptionOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: RealtimeTransport + 'static> SubscriptionOrchestrator<T> {
    /// Creates an orchestrator with no topics.
    #[must_use]
    pub fn new(transport: Arc<T>, config: SubscriptionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                saw_disconnect: AtomicBool::new(false),
            }),
        }
    }

    /// Makes `topic` desired with `handler` and opens it unless it is
    /// already live or opening.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError::Open`] if the transport fails and
    /// [`SubscribeError::CoolingDown`] while the topic is cooling down.
    pub async fn ensure(
        &self,
        topic: TopicKey,
        handler: Arc<dyn TopicHandler>,
    ) -> Result<EnsureOutcome, SubscribeError> {
        {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&topic) {
                Some(slot) => slot.handler = handler,
                None => {
                    slots.insert(
                        topic.clone(),
                        Slot {
                            handler,
                            live: None,
                            opening: None,
                            opens: 0,
                            failures: 0,
                            cooldown_until: None,
                        },
                    );
                }
            }
        }
        self.open(topic).await
    }

    /// Keeps `topic` desired and retries opening it in the background until
    /// it is live or released.
    pub fn maintain(&self, topic: TopicKey, handler: Arc<dyn TopicHandler>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let first = this.ensure(topic.clone(), handler).await;
            this.retry_until_live(topic, first).await;
        })
    }

    /// Reopens an already desired topic in the background (after its stream
    /// closed). Does nothing if the topic is not desired.
    pub fn revive(&self, topic: TopicKey) {
        if !self.is_desired(&topic) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let first = this.open(topic.clone()).await;
            this.retry_until_live(topic, first).await;
        });
    }

    async fn retry_until_live(
        &self,
        topic: TopicKey,
        mut last: Result<EnsureOutcome, SubscribeError>,
    ) {
        loop {
            let wait = match &last {
                Ok(_) => return,
                Err(SubscribeError::CoolingDown { remaining, .. }) => *remaining,
                Err(SubscribeError::Open { source, .. }) => {
                    tracing::warn!(topic = %topic, error = %source, "subscription open failed");
                    self.inner.config.retry_delay
                }
            };
            tokio::time::sleep(wait).await;
            if !self.is_desired(&topic) {
                return;
            }
            last = self.open(topic.clone()).await;
        }
    }

    async fn open(&self, topic: TopicKey) -> Result<EnsureOutcome, SubscribeError> {
        let (generation, stale) = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(&topic) else {
                return Ok(EnsureOutcome::Superseded);
            };
            if slot.live.as_ref().is_some_and(Live::is_alive) {
                return Ok(EnsureOutcome::AlreadyLive);
            }
            if slot.opening.is_some() {
                return Ok(EnsureOutcome::InProgress);
            }
            if let Some(until) = slot.cooldown_until {
                let now = Instant::now();
                if now < until {
                    return Err(SubscribeError::CoolingDown {
                        topic,
                        remaining: until - now,
                    });
                }
                slot.cooldown_until = None;
                slot.failures = 0;
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            slot.opening = Some(generation);
            (generation, slot.live.take().map(Live::kill))
        };

        if let Some(handle) = stale {
            tracing::debug!(topic = %topic, %handle, "tearing down stale subscription");
            self.inner.transport.unsubscribe(handle).await;
        }

        let result = tokio::time::timeout(
            self.inner.config.open_timeout,
            self.inner.transport.subscribe(&topic),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout));

        let subscribed = match result {
            Ok(subscribed) => subscribed,
            Err(source) => {
                let mut slots = self.inner.slots.lock();
                if let Some(slot) = slots.get_mut(&topic)
                    && slot.opening == Some(generation)
                {
                    slot.opening = None;
                    slot.failures += 1;
                    if slot.failures >= self.inner.config.max_open_attempts {
                        tracing::warn!(
                            topic = %topic,
                            failures = slot.failures,
                            "subscription cooling down"
                        );
                        slot.cooldown_until = Some(Instant::now() + self.inner.config.cooldown);
                        slot.failures = 0;
                    }
                }
                return Err(SubscribeError::Open { topic, source });
            }
        };

        let handler = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&topic) {
                Some(slot) if slot.opening == Some(generation) => {
                    slot.opening = None;
                    slot.failures = 0;
                    slot.opens += 1;
                    let alive = Arc::new(AtomicBool::new(true));
                    let pump = spawn_pump(
                        topic.clone(),
                        Arc::clone(&slot.handler),
                        Arc::clone(&alive),
                        subscribed.events,
                    );
                    slot.live = Some(Live {
                        handle: subscribed.handle,
                        established_at: Timestamp::now(),
                        attempt: slot.opens,
                        alive,
                        pump,
                    });
                    Some(Arc::clone(&slot.handler))
                }
                _ => None,
            }
        };
        let Some(handler) = handler else {
            tracing::debug!(topic = %topic, "subscription superseded while opening");
            self.inner.transport.unsubscribe(subscribed.handle).await;
            return Ok(EnsureOutcome::Superseded);
        };

        tracing::info!(topic = %topic, handle = %subscribed.handle, "subscription established");
        handler.on_established(&topic);
        Ok(EnsureOutcome::Opened)
    }

    /// Forgets `topic` and stops its pump without touching the transport.
    ///
    /// Returns the transport handle so the caller can close it later.
    /// Events already buffered for the old subscription are never
    /// dispatched.
    pub fn detach(&self, topic: &TopicKey) -> Option<SubscriptionHandle> {
        let slot = self.inner.slots.lock().remove(topic)?;
        slot.live.map(|live| {
            tracing::info!(topic = %topic, "subscription released");
            live.kill()
        })
    }

    /// Forgets `topic` and closes its transport subscription. Safe to call
    /// on a topic that is not subscribed.
    pub async fn release(&self, topic: &TopicKey) {
        if let Some(handle) = self.detach(topic) {
            self.inner.transport.unsubscribe(handle).await;
        }
    }

    /// Releases every topic.
    pub async fn release_all(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut slots = self.inner.slots.lock();
            slots
                .drain()
                .filter_map(|(_, slot)| slot.live.map(Live::kill))
                .collect()
        };
        for handle in handles {
            self.inner.transport.unsubscribe(handle).await;
        }
    }

    /// Reacts to a connection status transition.
    ///
    /// A transition into `Connected` after a disconnect tears down and
    /// reopens every desired topic in the background.
    pub fn handle_status_change(&self, previous: ConnectionStatus, next: ConnectionStatus) {
        match next {
            ConnectionStatus::Disconnected => {
                self.inner.saw_disconnect.store(true, Ordering::Release);
            }
            ConnectionStatus::Connected => {
                if self.inner.saw_disconnect.swap(false, Ordering::AcqRel) {
                    tracing::info!(from = %previous, "reconnected, resubscribing all topics");
                    let this = self.clone();
                    tokio::spawn(async move { this.resubscribe_all().await });
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    /// Tears down and reopens every desired topic, retrying failures in
    /// the background.
    pub async fn resubscribe_all(&self) {
        let topics: Vec<TopicKey> = {
            let mut slots = self.inner.slots.lock();
            for slot in slots.values_mut() {
                slot.cooldown_until = None;
                slot.failures = 0;
                if let Some(live) = &slot.live {
                    live.alive.store(false, Ordering::Release);
                }
            }
            slots.keys().cloned().collect()
        };
        for topic in topics {
            let result = self.open(topic.clone()).await;
            if result.is_err() {
                let this = self.clone();
                tokio::spawn(async move { this.retry_until_live(topic, result).await });
            }
        }
    }

    /// Topics with a live subscription.
    #[must_use]
    pub fn live_topics(&self) -> Vec<TopicKey> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.live.as_ref().is_some_and(Live::is_alive))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Whether `topic` has a live subscription.
    #[must_use]
    pub fn is_live(&self, topic: &TopicKey) -> bool {
        self.inner
            .slots
            .lock()
            .get(topic)
            .and_then(|slot| slot.live.as_ref())
            .is_some_and(Live::is_alive)
    }

    /// Whether `topic` is wanted (live or not).
    #[must_use]
    pub fn is_desired(&self, topic: &TopicKey) -> bool {
        self.inner.slots.lock().contains_key(topic)
    }

    /// Details of the live subscription for `topic`.
    #[must_use]
    pub fn subscription(&self, topic: &TopicKey) -> Option<Subscription> {
        let slots = self.inner.slots.lock();
        let live = slots.get(topic)?.live.as_ref().filter(|l| l.is_alive())?;
        Some(Subscription {
            topic: topic.clone(),
            handle: live.handle,
            established_at: live.established_at,
            attempt: live.attempt,
        })
    }
}

fn spawn_pump(
    topic: TopicKey,
    handler: Arc<dyn TopicHandler>,
    alive: Arc<AtomicBool>,
    mut events: mpsc::Receiver<ChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !alive.load(Ordering::Acquire) {
                return;
            }
            match event {
                ChangeEvent::Insert(record) => handler.on_insert(&topic, record),
                ChangeEvent::Update(record) => handler.on_update(&topic, record),
                ChangeEvent::Delete(record) => handler.on_delete(&topic, record),
                ChangeEvent::Broadcast(payload) => handler.on_broadcast(&topic, payload),
            }
        }
        if alive.swap(false, Ordering::AcqRel) {
            tracing::info!(topic = %topic, "subscription stream closed");
            handler.on_stream_closed(&topic);
        }
    })
}
