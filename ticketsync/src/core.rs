//! The synchronization core.
//!
//! [`SyncCore`] is the one object a UI layer holds. It owns the connection
//! supervisor, the subscription orchestrator and all in-memory state, and
//! exposes reads, optimistic mutations and change notification.
//!
//! All state sits behind a single lock. Every handler takes the lock,
//! mutates, collects the [`SyncEvent`]s to emit, and releases the lock
//! before emitting or awaiting anything.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use ticketsync_proto::event::{Broadcast, ChangeEvent};
use ticketsync_proto::ids::{LocalId, TicketId, Timestamp, UserId};
use ticketsync_proto::presence::PresenceEntry;
use ticketsync_proto::record::{
    ChatMessage, Entity, Filter, Patch, Record, RecordId, Role, Ticket, TicketPatch, TicketStatus,
};
use ticketsync_proto::topic::TopicKey;
use ticketsync_proto::typing::TypingSignal;

use crate::backend::{Backend, BackendError};
use crate::connection::{
    ConnectionState, ConnectionStatus, ConnectionSupervisor, EnvironmentSignal, ListenerId,
    SupervisorConfig,
};
use crate::merge::{
    ApplyOutcome, MessageRecord, Optimistic, ReconcileOutcome, RecordStore, RolledBack,
    TicketRecord, ViewFilter,
};
use crate::notify::{ChangeSubscription, Notifier, SyncEvent};
use crate::optimistic::{
    Mutation, MutationConfig, MutationError, MutationLedger, PendingWrite, SettledBy, Submitted,
    TicketDraft,
};
use crate::presence::{PresenceTracker, RoleFilter};
use crate::subscription::{SubscriptionConfig, SubscriptionOrchestrator, TopicHandler};
use crate::typing::TypingTracker;
use crate::unread::UnreadCounters;

/// The authenticated user a core runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id issued by the authentication collaborator.
    pub user_id: UserId,
    /// Name shown to other participants.
    pub display_name: String,
    /// Role; staff roles see every ticket and announce presence.
    pub role: Role,
}

/// Tuning for every component of a core.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Connection probing and reconnection.
    pub supervisor: SupervisorConfig,
    /// Subscription opens and retries.
    pub subscriptions: SubscriptionConfig,
    /// Write and safety timeouts.
    pub mutations: MutationConfig,
    /// Window for matching a confirmation without correlation id.
    pub match_window: Duration,
    /// Interval between staff presence heartbeats.
    pub heartbeat_interval: Duration,
    /// Presence entries older than this are not shown.
    pub presence_ttl: Duration,
    /// How long one typing signal keeps a user listed as typing.
    pub typing_lease: Duration,
    /// Minimum spacing of outbound typing signals per ticket.
    pub typing_throttle: Duration,
    /// Interval of expired-lease housekeeping.
    pub typing_prune_interval: Duration,
    /// Capacity of each [`SyncCore::events`] channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            subscriptions: SubscriptionConfig::default(),
            mutations: MutationConfig::default(),
            match_window: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            presence_ttl: Duration::from_secs(60),
            typing_lease: Duration::from_secs(4),
            typing_throttle: Duration::from_secs(2),
            typing_prune_interval: Duration::from_millis(500),
            event_buffer: 256,
        }
    }
}

/// Errors returned by [`SyncCore`] operations other than mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// No confirmed ticket with that id is held.
    #[error("unknown ticket: {0}")]
    UnknownTicket(TicketId),

    /// The backing service failed the call.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Side effects collected under the lock and performed after it.
#[derive(Default)]
struct Changes {
    events: Vec<SyncEvent>,
    closed_selection: Option<TicketId>,
}

impl Changes {
    fn push(&mut self, event: SyncEvent) {
        self.events.push(event);
    }

    fn close_selection(&mut self, ticket_id: TicketId) {
        self.closed_selection = Some(ticket_id);
        self.events.push(SyncEvent::SelectionClosed { ticket_id });
    }
}

struct CoreState {
    records: RecordStore,
    ledger: MutationLedger,
    unread: UnreadCounters,
    presence: PresenceTracker,
    typing: TypingTracker,
    running: bool,
}

impl CoreState {
    fn confirm(&mut self, local_id: LocalId, changes: &mut Changes) {
        if self
            .ledger
            .settle(local_id, Ok(()), SettledBy::Event)
            .is_some()
        {
            tracing::debug!(%local_id, "mutation confirmed by event");
            changes.push(SyncEvent::MutationConfirmed { local_id });
        }
    }

    /// Clients only count messages on tickets they can see.
    fn counts_ticket(&self, ticket: &TicketId) -> bool {
        matches!(self.records.view(), ViewFilter::All) || self.records.has_ticket(ticket)
    }

    /// Counts messages held back until `ticket_id` was known.
    fn admit_held(&mut self, me: &UserId, ticket_id: TicketId, changes: &mut Changes) {
        if self.records.has_ticket(&ticket_id)
            && self.unread.admit(&ticket_id, me, self.records.selected())
        {
            changes.push(SyncEvent::UnreadChanged {
                ticket_id,
                count: self.unread.count(&ticket_id),
            });
        }
    }

    /// After a ticket snapshot: admit held messages of known tickets and
    /// drop the rest.
    fn settle_held(&mut self, me: &UserId, changes: &mut Changes) {
        for ticket_id in self.unread.held_tickets() {
            self.admit_held(me, ticket_id, changes);
        }
        let records = &self.records;
        self.unread
            .discard_held(|ticket| records.has_ticket(ticket));
    }

    fn apply_ticket_event(&mut self, me: &UserId, event: &ChangeEvent, changes: &mut Changes) {
        let outcome = self.records.apply_inbound(event);
        if outcome.changed() {
            changes.push(SyncEvent::TicketsChanged);
        }
        match outcome {
            ApplyOutcome::Promoted { local_id, .. }
            | ApplyOutcome::PatchConfirmed { local_id, .. } => self.confirm(local_id, changes),
            ApplyOutcome::Deleted {
                id: RecordId::Ticket(ticket_id),
                closed_selection,
            } => {
                if self.unread.forget_ticket(&ticket_id) {
                    changes.push(SyncEvent::UnreadChanged {
                        ticket_id,
                        count: 0,
                    });
                }
                self.typing.clear_ticket(&ticket_id);
                if closed_selection {
                    changes.close_selection(ticket_id);
                }
            }
            _ => {}
        }
        if let ChangeEvent::Insert(Record::Ticket(ticket))
        | ChangeEvent::Update(Record::Ticket(ticket)) = event
        {
            self.admit_held(me, ticket.id, changes);
        }
    }

    fn apply_message_event(
        &mut self,
        ticket: TicketId,
        event: &ChangeEvent,
        changes: &mut Changes,
    ) {
        if self.records.selected() != Some(ticket) {
            tracing::debug!(ticket = %ticket, "message event for unselected ticket dropped");
            return;
        }
        let outcome = self.records.apply_inbound(event);
        if outcome.changed() {
            changes.push(SyncEvent::MessagesChanged { ticket_id: ticket });
        }
        if let ApplyOutcome::Promoted { local_id, .. } = outcome {
            self.confirm(local_id, changes);
        }
    }

    fn apply_unread_event(&mut self, me: &UserId, event: &ChangeEvent, changes: &mut Changes) {
        let (message, changed) = match event {
            ChangeEvent::Insert(Record::Message(m)) => {
                if !self.counts_ticket(&m.ticket_id) {
                    if self.unread.hold(m, me) {
                        tracing::debug!(
                            ticket = %m.ticket_id,
                            "unread message held until its ticket is known"
                        );
                    }
                    return;
                }
                (m, self.unread.record_inbound(m, me, self.records.selected()))
            }
            ChangeEvent::Update(Record::Message(m)) => (m, self.unread.apply_read_receipt(m)),
            ChangeEvent::Delete(Record::Message(m)) => {
                (m, self.unread.remove_message(&m.ticket_id, &m.id))
            }
            _ => return,
        };
        if changed {
            changes.push(SyncEvent::UnreadChanged {
                ticket_id: message.ticket_id,
                count: self.unread.count(&message.ticket_id),
            });
        }
    }

    fn rebuild_unread(&mut self, me: &UserId, messages: &[ChatMessage], changes: &mut Changes) {
        let before = self.unread.counts();
        let (visible, unknown): (Vec<&ChatMessage>, Vec<&ChatMessage>) = messages
            .iter()
            .partition(|m| self.counts_ticket(&m.ticket_id));
        self.unread.rebuild(visible, me, self.records.selected());
        for message in unknown {
            self.unread.hold(message, me);
        }
        let after = self.unread.counts();
        let touched: HashSet<TicketId> = before.keys().chain(after.keys()).copied().collect();
        for ticket_id in touched {
            let count = after.get(&ticket_id).copied().unwrap_or(0);
            if before.get(&ticket_id).copied().unwrap_or(0) != count {
                changes.push(SyncEvent::UnreadChanged { ticket_id, count });
            }
        }
    }

    fn check_target(&self, mutation: &Mutation) -> Result<(), MutationError> {
        let ticket_id = match mutation {
            Mutation::SendMessage { ticket_id, .. } | Mutation::PatchTicket { ticket_id, .. } => {
                ticket_id
            }
            Mutation::CreateTicket(_) => return Ok(()),
        };
        let Some(ticket) = self.records.ticket(ticket_id) else {
            return Err(MutationError::Validation(format!("unknown ticket {ticket_id}")));
        };
        if matches!(mutation, Mutation::SendMessage { .. }) && ticket.status == TicketStatus::Closed
        {
            return Err(MutationError::Validation(format!("ticket {ticket_id} is closed")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct Inner<B> {
    backend: Arc<B>,
    identity: Identity,
    config: SyncConfig,
    state: Mutex<CoreState>,
    supervisor: ConnectionSupervisor<B>,
    orchestrator: SubscriptionOrchestrator<B>,
    notifier: Notifier,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<ListenerId>>,
}

/// Realtime synchronization core for one authenticated session.
///
/// Cheap to clone; clones share the same state.
pub struct SyncCore<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for SyncCore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> SyncCore<B> {
    /// Creates a core for `identity` on `backend`. Nothing runs until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(backend: Arc<B>, identity: Identity, config: SyncConfig) -> Self {
        let view = ViewFilter::for_session(&identity.user_id, identity.role);
        let state = CoreState {
            records: RecordStore::new(view, millis(config.match_window)),
            ledger: MutationLedger::new(),
            unread: UnreadCounters::new(),
            presence: PresenceTracker::new(millis(config.presence_ttl)),
            typing: TypingTracker::new(config.typing_lease, config.typing_throttle),
            running: false,
        };
        let supervisor = ConnectionSupervisor::new(Arc::clone(&backend), config.supervisor.clone());
        let orchestrator =
            SubscriptionOrchestrator::new(Arc::clone(&backend), config.subscriptions.clone());
        Self {
            inner: Arc::new(Inner {
                backend,
                identity,
                config,
                state: Mutex::new(state),
                supervisor,
                orchestrator,
                notifier: Notifier::new(),
                tasks: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Starts connection supervision, the session-wide subscriptions and
    /// the housekeeping ticks. Calling it on a running core does nothing.
    pub fn start(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }

        let weak = Arc::downgrade(inner);
        let listener = inner.supervisor.add_listener(move |previous, next| {
            if let Some(inner) = weak.upgrade() {
                inner.on_status_change(previous, next);
            }
        });
        *inner.listener.lock() = Some(listener);
        inner.supervisor.start();

        let handler = inner.handler();
        let mut tasks = Vec::new();
        for topic in [
            TopicKey::TicketList,
            TopicKey::UnreadCounters,
            TopicKey::Presence,
        ] {
            tasks.push(inner.orchestrator.maintain(topic, Arc::clone(&handler)));
        }
        tasks.push(spawn_typing_prune(
            Arc::downgrade(inner),
            inner.config.typing_prune_interval,
        ));
        if inner.identity.role.is_staff() {
            tasks.push(spawn_heartbeat(
                Arc::downgrade(inner),
                inner.config.heartbeat_interval,
            ));
        }
        inner.tasks.lock().extend(tasks);
        tracing::info!(
            user = %inner.identity.user_id,
            role = %inner.identity.role,
            "sync core started"
        );
    }

    /// Stops everything started by [`start`](Self::start), closes every
    /// subscription and cancels pending mutations.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let cancelled = {
            let mut state = inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            let cancelled = state.ledger.cancel_all();
            for local_id in &cancelled {
                state.records.rollback(*local_id);
            }
            cancelled
        };
        if let Some(id) = inner.listener.lock().take() {
            inner.supervisor.remove_listener(id);
        }
        inner.supervisor.stop();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        inner.orchestrator.release_all().await;
        tracing::info!(cancelled = cancelled.len(), "sync core stopped");
    }

    /// Forwards a network or visibility change to the connection supervisor.
    pub fn signal(&self, signal: EnvironmentSignal) {
        self.inner.supervisor.signal(signal);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The authenticated user.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Visible tickets, most recently updated first.
    #[must_use]
    pub fn tickets(&self) -> Vec<TicketRecord> {
        self.inner.state.lock().records.tickets()
    }

    /// The confirmed ticket with `id`.
    #[must_use]
    pub fn ticket(&self, id: &TicketId) -> Option<Ticket> {
        self.inner.state.lock().records.ticket(id).cloned()
    }

    /// Messages of `ticket`, oldest first. Only the selected ticket's
    /// messages are kept up to date.
    #[must_use]
    pub fn messages(&self, ticket: &TicketId) -> Vec<MessageRecord> {
        self.inner.state.lock().records.messages(ticket)
    }

    /// The selected ticket.
    #[must_use]
    pub fn selected(&self) -> Option<TicketId> {
        self.inner.state.lock().records.selected()
    }

    /// Unread messages on `ticket`.
    #[must_use]
    pub fn unread_count(&self, ticket: &TicketId) -> usize {
        self.inner.state.lock().unread.count(ticket)
    }

    /// Unread messages over all tickets.
    #[must_use]
    pub fn total_unread(&self) -> usize {
        self.inner.state.lock().unread.total()
    }

    /// Online staff, sorted by name.
    #[must_use]
    pub fn online_staff(&self) -> Vec<PresenceEntry> {
        self.inner.state.lock().presence.online(RoleFilter::Staff)
    }

    /// Online flag for each of `users`.
    #[must_use]
    pub fn online_flags(&self, users: &[UserId]) -> std::collections::HashMap<UserId, bool> {
        self.inner.state.lock().presence.online_flags(users)
    }

    /// Names of users currently typing on `ticket`.
    #[must_use]
    pub fn typing_users(&self, ticket: &TicketId) -> Vec<String> {
        self.inner
            .state
            .lock()
            .typing
            .typing_users(ticket, Instant::now())
    }

    /// Current connection state.
    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        self.inner.supervisor.status()
    }

    /// Whether the client has been disconnected for longer than the grace
    /// period.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.inner
            .supervisor
            .status()
            .is_degraded(Timestamp::now(), self.inner.supervisor.degraded_grace())
    }

    /// Number of mutations not settled yet.
    #[must_use]
    pub fn pending_mutations(&self) -> usize {
        self.inner.state.lock().ledger.pending_count()
    }

    /// Number of writes parked for replay.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.inner.state.lock().ledger.outbox_len()
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Registers a callback for every [`SyncEvent`].
    pub fn on_change<F>(&self, listener: F) -> ChangeSubscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(listener)
    }

    /// Returns a channel receiving every [`SyncEvent`].
    #[must_use]
    pub fn events(&self) -> mpsc::Receiver<SyncEvent> {
        self.inner.notifier.channel(self.inner.config.event_buffer)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Posts `body` on `ticket`. The message shows up at once as pending.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Validation`] for a blank or oversized body
    /// and for unknown or closed tickets. Write failures are reported
    /// through the returned handle.
    pub fn send_message(
        &self,
        ticket: TicketId,
        body: impl Into<String>,
    ) -> Result<Submitted, MutationError> {
        self.submit(Mutation::SendMessage {
            ticket_id: ticket,
            body: body.into(),
        })
    }

    /// Opens a ticket. It shows up at once as pending.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Validation`] for a blank or oversized title.
    pub fn create_ticket(&self, draft: TicketDraft) -> Result<Submitted, MutationError> {
        self.submit(Mutation::CreateTicket(draft))
    }

    /// Changes fields of `ticket`. The change shows up at once.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Validation`] for empty patches and unknown
    /// tickets.
    pub fn mutate_ticket(
        &self,
        ticket: TicketId,
        patch: TicketPatch,
    ) -> Result<Submitted, MutationError> {
        self.submit(Mutation::PatchTicket {
            ticket_id: ticket,
            patch,
        })
    }

    /// Applies `mutation` optimistically and starts its write, or parks
    /// the write while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Validation`] if the mutation is refused
    /// before any local change.
    pub fn submit(&self, mutation: Mutation) -> Result<Submitted, MutationError> {
        let inner = &self.inner;
        let (local_id, write, submitted, event) = {
            let mut state = inner.state.lock();
            state.check_target(&mutation)?;
            let prepared = state.ledger.prepare(
                mutation,
                &inner.identity.user_id,
                &inner.identity.display_name,
                Timestamp::now(),
            )?;
            let event = match &prepared.optimistic {
                Optimistic::Message { message, .. } => SyncEvent::MessagesChanged {
                    ticket_id: message.ticket_id,
                },
                Optimistic::Ticket { .. } | Optimistic::Patch { .. } => SyncEvent::TicketsChanged,
            };
            if !state
                .records
                .apply_local_optimistic(prepared.optimistic.clone())
            {
                return Err(MutationError::Validation("target ticket not held".into()));
            }
            let submitted = state.ledger.register(&prepared);
            (prepared.local_id, prepared.write, submitted, event)
        };
        tracing::debug!(
            %local_id,
            correlation = %submitted.correlation_id,
            "mutation applied locally"
        );
        inner.notifier.emit(vec![event]);

        let weak = Arc::downgrade(inner);
        let safety = inner.config.mutations.safety_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(safety).await;
            if let Some(inner) = weak.upgrade() {
                inner.fail(local_id, MutationError::TimedOut, SettledBy::Timer);
            }
        });
        inner.state.lock().ledger.attach_timer(local_id, timer);

        if inner.supervisor.is_connected() {
            inner.spawn_write(local_id, write);
        } else {
            inner.state.lock().ledger.park(local_id);
        }
        Ok(submitted)
    }

    /// Selects `ticket` (or nothing), switching the per-ticket
    /// subscriptions and marking the new ticket read.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownTicket`] if no confirmed ticket with that
    /// id is held.
    pub fn select_ticket(&self, ticket: Option<TicketId>) -> Result<(), SyncError> {
        let inner = &self.inner;
        let (previous, events) = {
            let mut state = inner.state.lock();
            if let Some(t) = ticket
                && !state.records.has_ticket(&t)
            {
                return Err(SyncError::UnknownTicket(t));
            }
            let previous = state.records.set_selected(ticket);
            if previous == ticket {
                return Ok(());
            }
            let mut events = Vec::new();
            if let Some(p) = previous {
                state.records.forget_messages(&p);
                if state.typing.clear_ticket(&p) {
                    events.push(SyncEvent::TypingChanged { ticket_id: p });
                }
            }
            (previous, events)
        };

        if let Some(p) = previous {
            inner.release_ticket_topics(p);
        }
        inner.notifier.emit(events);

        if let Some(t) = ticket {
            tracing::debug!(ticket = %t, "ticket selected");
            let handler = inner.handler();
            inner
                .orchestrator
                .maintain(TopicKey::Messages(t), Arc::clone(&handler));
            inner.orchestrator.maintain(TopicKey::Typing(t), handler);
            let core = Arc::clone(inner);
            tokio::spawn(async move {
                let _ = core.mark_read(t).await;
            });
        }
        Ok(())
    }

    /// Clears the unread count of `ticket` and records the read.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownTicket`] for tickets not held and
    /// [`SyncError::Backend`] if the write fails, in which case the count
    /// is restored.
    pub async fn mark_read(&self, ticket: TicketId) -> Result<(), SyncError> {
        self.inner.mark_read(ticket).await
    }

    /// Tells other participants of `ticket` that the local user started or
    /// stopped typing. Start signals are throttled.
    pub fn notify_typing(&self, ticket: TicketId, is_typing: bool) {
        let inner = &self.inner;
        let send = {
            let mut state = inner.state.lock();
            if is_typing {
                state.typing.should_send(&ticket, Instant::now())
            } else {
                state.typing.reset_throttle(&ticket);
                true
            }
        };
        if !send {
            return;
        }
        let signal = TypingSignal {
            ticket_id: ticket,
            user_id: inner.identity.user_id.clone(),
            name: inner.identity.display_name.clone(),
            is_typing,
        };
        let backend = Arc::clone(&inner.backend);
        tokio::spawn(async move {
            if let Err(e) = backend
                .broadcast(&TopicKey::Typing(ticket), Broadcast::Typing(signal))
                .await
            {
                tracing::debug!(ticket = %ticket, error = %e, "typing signal not sent");
            }
        });
    }
}

impl<B: Backend> Inner<B> {
    fn handler(self: &Arc<Self>) -> Arc<dyn TopicHandler> {
        Arc::new(CoreHandler {
            core: Arc::downgrade(self),
        })
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn finish(&self, changes: Changes) {
        if let Some(ticket) = changes.closed_selection {
            tracing::info!(ticket = %ticket, "selected ticket went away");
            self.release_ticket_topics(ticket);
        }
        self.notifier.emit(changes.events);
    }

    fn release_ticket_topics(&self, ticket: TicketId) {
        for topic in [TopicKey::Messages(ticket), TopicKey::Typing(ticket)] {
            if let Some(handle) = self.orchestrator.detach(&topic) {
                let backend = Arc::clone(&self.backend);
                tokio::spawn(async move { backend.unsubscribe(handle).await });
            }
        }
    }

    fn on_status_change(self: &Arc<Self>, previous: ConnectionStatus, next: ConnectionStatus) {
        self.orchestrator.handle_status_change(previous, next);
        if next == ConnectionStatus::Connected {
            self.flush_outbox();
        }
        self.notifier.emit(vec![SyncEvent::ConnectionChanged {
            previous,
            current: next,
        }]);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn apply_event(&self, topic: &TopicKey, event: ChangeEvent) {
        let mut changes = Changes::default();
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            match topic {
                TopicKey::TicketList => {
                    state.apply_ticket_event(&self.identity.user_id, &event, &mut changes);
                }
                TopicKey::Messages(ticket) => {
                    state.apply_message_event(*ticket, &event, &mut changes);
                }
                TopicKey::UnreadCounters => {
                    state.apply_unread_event(&self.identity.user_id, &event, &mut changes);
                }
                TopicKey::Typing(ticket) => {
                    if let ChangeEvent::Broadcast(Broadcast::Typing(signal)) = &event
                        && signal.ticket_id == *ticket
                        && state
                            .typing
                            .apply(signal, &self.identity.user_id, Instant::now())
                    {
                        changes.push(SyncEvent::TypingChanged { ticket_id: *ticket });
                    }
                }
                TopicKey::Presence => {
                    if let ChangeEvent::Broadcast(Broadcast::PresenceSync(entries)) = event
                        && state.presence.apply_snapshot(entries, Timestamp::now())
                    {
                        changes.push(SyncEvent::PresenceChanged);
                    }
                }
            }
        }
        self.finish(changes);
    }

    fn spawn_resync(self: &Arc<Self>, topic: TopicKey) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.resync(topic).await });
    }

    /// Refetches everything a topic covers, retrying transient failures
    /// while the topic stays live.
    async fn resync(self: &Arc<Self>, topic: TopicKey) {
        loop {
            match self.resync_once(&topic).await {
                Ok(()) => {
                    tracing::debug!(topic = %topic, "resync complete");
                    return;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(topic = %topic, error = %e, "resync failed, will retry");
                    self.supervisor.report_transport_failure();
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "resync failed");
                    return;
                }
            }
            tokio::time::sleep(self.config.subscriptions.retry_delay).await;
            if !self.is_running() || !self.orchestrator.is_live(&topic) {
                return;
            }
        }
    }

    async fn resync_once(&self, topic: &TopicKey) -> Result<(), BackendError> {
        let me = &self.identity.user_id;
        let mut changes = Changes::default();
        match topic {
            TopicKey::TicketList => {
                let filter = self.state.lock().records.view().to_filter();
                let records = self.backend.fetch_list(Entity::Ticket, filter).await?;
                let tickets = records
                    .into_iter()
                    .filter_map(|r| match r {
                        Record::Ticket(t) => Some(t),
                        Record::Message(_) => None,
                    })
                    .collect();
                let mut state = self.state.lock();
                let outcome = state.records.replace_tickets(tickets);
                changes.push(SyncEvent::TicketsChanged);
                for local_id in outcome.promoted {
                    state.confirm(local_id, &mut changes);
                }
                if let Some(ticket) = outcome.closed_selection {
                    state.typing.clear_ticket(&ticket);
                    changes.close_selection(ticket);
                }
                state.settle_held(me, &mut changes);
            }
            TopicKey::Messages(ticket) => {
                let records = self
                    .backend
                    .fetch_list(Entity::Message, Filter::MessagesOf(*ticket))
                    .await?;
                let mut state = self.state.lock();
                if state.records.selected() != Some(*ticket) {
                    return Ok(());
                }
                let messages = messages_of(records);
                let outcome = state.records.replace_messages(*ticket, messages);
                changes.push(SyncEvent::MessagesChanged { ticket_id: *ticket });
                for local_id in outcome.promoted {
                    state.confirm(local_id, &mut changes);
                }
            }
            TopicKey::Typing(ticket) => {
                if self.state.lock().typing.clear_ticket(ticket) {
                    changes.push(SyncEvent::TypingChanged { ticket_id: *ticket });
                }
            }
            TopicKey::Presence => {
                // The snapshot itself arrives on the stream.
                if self.identity.role.is_staff() {
                    self.send_heartbeat().await?;
                }
            }
            TopicKey::UnreadCounters => {
                let requester = (!self.identity.role.is_staff()).then(|| me.clone());
                let records = self
                    .backend
                    .fetch_list(
                        Entity::Message,
                        Filter::Unread {
                            reader: me.clone(),
                            requester,
                        },
                    )
                    .await?;
                self.state
                    .lock()
                    .rebuild_unread(me, &messages_of(records), &mut changes);
            }
        }
        self.finish(changes);
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), BackendError> {
        let entry = PresenceEntry {
            user_id: self.identity.user_id.clone(),
            name: self.identity.display_name.clone(),
            role: self.identity.role,
            last_seen_at: Timestamp::now(),
        };
        self.backend
            .broadcast(&TopicKey::Presence, Broadcast::Heartbeat(entry))
            .await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn spawn_write(self: &Arc<Self>, local_id: LocalId, write: PendingWrite) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.perform_write(local_id, write).await });
        self.state.lock().ledger.attach_task(local_id, task);
    }

    async fn perform_write(self: &Arc<Self>, local_id: LocalId, write: PendingWrite) {
        let call = async {
            match write {
                PendingWrite::Insert(payload) => self.backend.insert(payload).await,
                PendingWrite::Update { id, patch } => self.backend.update(id, patch).await,
            }
        };
        let result = tokio::time::timeout(self.config.mutations.write_timeout, call)
            .await
            .unwrap_or(Err(BackendError::Timeout));
        match result {
            Ok(record) => self.confirm_write(local_id, &record),
            Err(e) if e.is_transient() => {
                tracing::warn!(%local_id, error = %e, "write failed, parking for replay");
                if self.state.lock().ledger.park(local_id) {
                    self.supervisor.report_transport_failure();
                    self.schedule_flush();
                }
            }
            Err(e) => self.fail(local_id, MutationError::Write(e), SettledBy::Write),
        }
    }

    fn confirm_write(&self, local_id: LocalId, record: &Record) {
        let mut changes = Changes::default();
        {
            let mut state = self.state.lock();
            let outcome = state.records.reconcile(local_id, record);
            if outcome != ReconcileOutcome::Ignored {
                changes.push(match record {
                    Record::Message(m) => SyncEvent::MessagesChanged {
                        ticket_id: m.ticket_id,
                    },
                    Record::Ticket(_) => SyncEvent::TicketsChanged,
                });
            }
            if state
                .ledger
                .settle(local_id, Ok(()), SettledBy::Write)
                .is_some()
            {
                changes.push(SyncEvent::MutationConfirmed { local_id });
            }
        }
        tracing::debug!(%local_id, id = %record.id(), "write confirmed");
        self.finish(changes);
    }

    fn fail(&self, local_id: LocalId, error: MutationError, by: SettledBy) {
        let mut changes = Changes::default();
        {
            let mut state = self.state.lock();
            let Some(restore) = state.ledger.settle(local_id, Err(error.clone()), by) else {
                return;
            };
            match state.records.rollback(local_id) {
                Some(RolledBack::Message(m)) => changes.push(SyncEvent::MessagesChanged {
                    ticket_id: m.ticket_id,
                }),
                Some(RolledBack::Ticket(_) | RolledBack::Patch { .. }) => {
                    changes.push(SyncEvent::TicketsChanged);
                }
                None => {}
            }
            changes.push(SyncEvent::MutationFailed {
                local_id,
                reason: error.to_string(),
                restore,
            });
        }
        tracing::warn!(%local_id, error = %error, "mutation rolled back");
        self.finish(changes);
    }

    /// Replays parked writes if connected.
    fn flush_outbox(self: &Arc<Self>) {
        if !self.supervisor.is_connected() {
            return;
        }
        let writes = self.state.lock().ledger.take_outbox();
        if writes.is_empty() {
            return;
        }
        tracing::info!(count = writes.len(), "replaying parked writes");
        for (local_id, write) in writes {
            self.spawn_write(local_id, write);
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.mutations.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_outbox();
            }
        });
    }

    async fn mark_read(&self, ticket: TicketId) -> Result<(), SyncError> {
        let taken = {
            let mut state = self.state.lock();
            if !state.records.has_ticket(&ticket) {
                return Err(SyncError::UnknownTicket(ticket));
            }
            state.unread.take(&ticket)
        };
        if !taken.is_empty() {
            self.notifier.emit(vec![SyncEvent::UnreadChanged {
                ticket_id: ticket,
                count: 0,
            }]);
        }

        let write = self.backend.update(
            RecordId::Ticket(ticket),
            Patch::MarkRead {
                reader: self.identity.user_id.clone(),
            },
        );
        let result = tokio::time::timeout(self.config.mutations.write_timeout, write)
            .await
            .unwrap_or(Err(BackendError::Timeout));
        match result {
            Ok(_) => {
                tracing::debug!(ticket = %ticket, "ticket marked read");
                Ok(())
            }
            Err(e) => {
                let count = {
                    let mut state = self.state.lock();
                    state.unread.restore(ticket, taken);
                    state.unread.count(&ticket)
                };
                tracing::warn!(ticket = %ticket, error = %e, "mark read failed, count restored");
                self.notifier.emit(vec![
                    SyncEvent::UnreadChanged {
                        ticket_id: ticket,
                        count,
                    },
                    SyncEvent::MarkReadFailed {
                        ticket_id: ticket,
                        reason: e.to_string(),
                    },
                ]);
                Err(e.into())
            }
        }
    }
}

fn messages_of(records: Vec<Record>) -> Vec<ChatMessage> {
    records
        .into_iter()
        .filter_map(|r| match r {
            Record::Message(m) => Some(m),
            Record::Ticket(_) => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Topic handler
// ---------------------------------------------------------------------------

struct CoreHandler<B> {
    core: Weak<Inner<B>>,
}

impl<B: Backend> CoreHandler<B> {
    fn dispatch(&self, topic: &TopicKey, event: ChangeEvent) {
        if let Some(core) = self.core.upgrade() {
            core.apply_event(topic, event);
        }
    }
}

impl<B: Backend> TopicHandler for CoreHandler<B> {
    fn on_insert(&self, topic: &TopicKey, record: Record) {
        self.dispatch(topic, ChangeEvent::Insert(record));
    }

    fn on_update(&self, topic: &TopicKey, record: Record) {
        self.dispatch(topic, ChangeEvent::Update(record));
    }

    fn on_delete(&self, topic: &TopicKey, record: Record) {
        self.dispatch(topic, ChangeEvent::Delete(record));
    }

    fn on_broadcast(&self, topic: &TopicKey, payload: Broadcast) {
        self.dispatch(topic, ChangeEvent::Broadcast(payload));
    }

    fn on_established(&self, topic: &TopicKey) {
        if let Some(core) = self.core.upgrade()
            && core.is_running()
        {
            core.spawn_resync(topic.clone());
        }
    }

    fn on_stream_closed(&self, topic: &TopicKey) {
        if let Some(core) = self.core.upgrade() {
            tracing::info!(topic = %topic, "subscription stream closed");
            core.supervisor.report_transport_failure();
            core.orchestrator.revive(topic.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

fn spawn_typing_prune<B: Backend>(core: Weak<Inner<B>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = core.upgrade() else {
                return;
            };
            let expired = inner.state.lock().typing.prune(Instant::now());
            inner.notifier.emit(
                expired
                    .into_iter()
                    .map(|ticket_id| SyncEvent::TypingChanged { ticket_id })
                    .collect(),
            );
        }
    })
}

fn spawn_heartbeat<B: Backend>(core: Weak<Inner<B>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first heartbeat goes out when the presence topic is established.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = core.upgrade() else {
                return;
            };
            if !inner.supervisor.is_connected() {
                continue;
            }
            if let Err(e) = inner.send_heartbeat().await {
                tracing::debug!(error = %e, "presence heartbeat not sent");
            }
        }
    })
}
