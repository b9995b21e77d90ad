//! In-memory record collections and the inbound/optimistic merge rules.
//!
//! [`RecordStore`] mirrors the tickets and messages visible to one session.
//! It is mutated from two directions:
//!
//! - inbound change events ([`RecordStore::apply_inbound`]) and resync
//!   snapshots ([`RecordStore::replace_tickets`],
//!   [`RecordStore::replace_messages`])
//! - local optimistic mutations ([`RecordStore::apply_local_optimistic`])
//!   which later get [`reconcile`](RecordStore::reconcile)d or
//!   [`rollback`](RecordStore::rollback)ed
//!
//! A pending record is matched to its confirmation by correlation id. The
//! content heuristic (same author, same body, same ticket, created within
//! the match window) is only used when the confirming record carries no
//! correlation id.
//!
//! Ticket versions follow last-write-wins on `updated_at`. Pending ticket
//! patches are layered on top of the latest server version, so an
//! unrelated update arriving while a patch is in flight rebases the patch
//! instead of clobbering it.

use std::collections::HashMap;

use ticketsync_proto::event::ChangeEvent;
use ticketsync_proto::ids::{CorrelationId, LocalId, MessageId, TicketId, Timestamp, UserId};
use ticketsync_proto::record::{ChatMessage, Filter, Record, RecordId, Role, Ticket, TicketPatch};

/// Identifier of a client mirror: server-issued once confirmed, local while pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey<T> {
    /// Confirmed by the server.
    Confirmed(T),
    /// Still waiting for confirmation.
    Pending(LocalId),
}

impl<T> RecordKey<T> {
    /// The local id, if the record is still pending.
    #[must_use]
    pub const fn local_id(&self) -> Option<LocalId> {
        match self {
            Self::Confirmed(_) => None,
            Self::Pending(id) => Some(*id),
        }
    }
}

/// Client mirror of a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRecord {
    /// Server or local key.
    pub key: RecordKey<TicketId>,
    /// Current view of the ticket, including pending patches.
    pub ticket: Ticket,
    /// `true` while a local creation or patch is unconfirmed.
    pub pending: bool,
}

/// Client mirror of a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Server or local key.
    pub key: RecordKey<MessageId>,
    /// The message.
    pub message: ChatMessage,
    /// `true` while the send is unconfirmed.
    pub pending: bool,
}

/// Which tickets a session gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewFilter {
    /// Staff see every ticket.
    All,
    /// Clients see only tickets they opened.
    RequestedBy(UserId),
}

impl ViewFilter {
    /// The filter for a session of `user` with `role`.
    #[must_use]
    pub fn for_session(user: &UserId, role: Role) -> Self {
        if role.is_staff() {
            Self::All
        } else {
            Self::RequestedBy(user.clone())
        }
    }

    /// Whether `ticket` belongs in this view.
    #[must_use]
    pub fn admits(&self, ticket: &Ticket) -> bool {
        match self {
            Self::All => true,
            Self::RequestedBy(user) => ticket.requester_id == *user,
        }
    }

    /// The fetch filter selecting this view's tickets.
    #[must_use]
    pub fn to_filter(&self) -> Filter {
        match self {
            Self::All => Filter::All,
            Self::RequestedBy(user) => Filter::RequestedBy(user.clone()),
        }
    }
}

/// A provisional record produced by a local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Optimistic {
    /// A message being sent.
    Message {
        /// Local key.
        local_id: LocalId,
        /// The provisional message (placeholder id, correlation id set).
        message: ChatMessage,
    },
    /// A ticket being created.
    Ticket {
        /// Local key.
        local_id: LocalId,
        /// The provisional ticket (placeholder id, correlation id set).
        ticket: Ticket,
    },
    /// A change to an existing ticket.
    Patch {
        /// Local key of the change.
        local_id: LocalId,
        /// Target ticket.
        ticket_id: TicketId,
        /// Correlation id the server will echo on the updated version.
        correlation_id: CorrelationId,
        /// The change.
        patch: TicketPatch,
    },
}

/// What [`RecordStore::apply_inbound`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new confirmed record was added.
    Inserted(RecordId),
    /// A pending local record was confirmed in place.
    Promoted {
        /// The pending record's local key.
        local_id: LocalId,
        /// Its server id.
        id: RecordId,
    },
    /// The record was already known.
    Duplicate,
    /// A record was replaced with a newer version.
    Updated(RecordId),
    /// The update confirmed a pending ticket patch.
    PatchConfirmed {
        /// The patch's local key.
        local_id: LocalId,
        /// The patched ticket.
        ticket_id: TicketId,
    },
    /// The event carried an older version than the one held.
    Stale,
    /// A record was removed.
    Deleted {
        /// The removed record.
        id: RecordId,
        /// `true` if it was the selected ticket.
        closed_selection: bool,
    },
    /// The event does not apply (unknown target, outside the view, broadcast).
    Ignored,
}

impl ApplyOutcome {
    /// Whether the visible collections changed.
    #[must_use]
    pub const fn changed(&self) -> bool {
        !matches!(self, Self::Duplicate | Self::Stale | Self::Ignored)
    }
}

/// What [`RecordStore::reconcile`] did with a write response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pending record was confirmed.
    Promoted,
    /// An inbound event had already confirmed it; nothing changed.
    AlreadyConfirmed,
    /// The pending record was gone; the confirmed record was added.
    Inserted,
    /// The record is outside the view and was not kept.
    Ignored,
}

/// A pending record removed by [`RecordStore::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolledBack {
    /// An unconfirmed message.
    Message(ChatMessage),
    /// An unconfirmed ticket.
    Ticket(Ticket),
    /// An unconfirmed patch; the ticket shows its server version again.
    Patch {
        /// The ticket.
        ticket_id: TicketId,
        /// The discarded change.
        patch: TicketPatch,
    },
}

/// Result of replacing a collection with a fetched snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncOutcome {
    /// Pending records the snapshot confirmed.
    pub promoted: Vec<LocalId>,
    /// Set if the selected ticket is no longer visible.
    pub closed_selection: Option<TicketId>,
}

#[derive(Debug, Clone)]
struct PendingPatch {
    local_id: LocalId,
    ticket_id: TicketId,
    correlation_id: CorrelationId,
    patch: TicketPatch,
}

/// Tickets and messages of one session.
#[derive(Debug)]
pub struct RecordStore {
    view: ViewFilter,
    match_window_ms: u64,
    tickets: Vec<TicketRecord>,
    messages: HashMap<TicketId, Vec<MessageRecord>>,
    /// Latest server version of every ticket with pending patches.
    bases: HashMap<TicketId, Ticket>,
    patches: Vec<PendingPatch>,
    selected: Option<TicketId>,
}

impl RecordStore {
    /// Creates an empty store for a session with `view`.
    #[must_use]
    pub fn new(view: ViewFilter, match_window_ms: u64) -> Self {
        Self {
            view,
            match_window_ms,
            tickets: Vec::new(),
            messages: HashMap::new(),
            bases: HashMap::new(),
            patches: Vec::new(),
            selected: None,
        }
    }

    /// The session's view filter.
    #[must_use]
    pub const fn view(&self) -> &ViewFilter {
        &self.view
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// All tickets, most recently updated first. Pending creations sort by
    /// their local creation time.
    #[must_use]
    pub fn tickets(&self) -> Vec<TicketRecord> {
        let mut out = self.tickets.clone();
        out.sort_by(|a, b| b.ticket.updated_at.cmp(&a.ticket.updated_at));
        out
    }

    /// Messages of `ticket`, oldest first. Pending messages sort after
    /// confirmed ones with the same timestamp.
    #[must_use]
    pub fn messages(&self, ticket: &TicketId) -> Vec<MessageRecord> {
        let mut out = self.messages.get(ticket).cloned().unwrap_or_default();
        out.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then_with(|| a.pending.cmp(&b.pending))
        });
        out
    }

    /// The confirmed ticket with `id`.
    #[must_use]
    pub fn ticket(&self, id: &TicketId) -> Option<&Ticket> {
        self.tickets
            .iter()
            .find(|r| r.key == RecordKey::Confirmed(*id))
            .map(|r| &r.ticket)
    }

    /// Whether a confirmed ticket with `id` is held.
    #[must_use]
    pub fn has_ticket(&self, id: &TicketId) -> bool {
        self.ticket(id).is_some()
    }

    /// The selected ticket.
    #[must_use]
    pub const fn selected(&self) -> Option<TicketId> {
        self.selected
    }

    /// Changes the selection, returning the previous one.
    pub const fn set_selected(&mut self, ticket: Option<TicketId>) -> Option<TicketId> {
        std::mem::replace(&mut self.selected, ticket)
    }

    /// Drops the cached messages of `ticket`, keeping pending ones.
    pub fn forget_messages(&mut self, ticket: &TicketId) {
        if let Some(list) = self.messages.get_mut(ticket) {
            list.retain(|m| m.pending);
            if list.is_empty() {
                self.messages.remove(ticket);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Applies one inbound change event.
    pub fn apply_inbound(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        match event {
            ChangeEvent::Insert(Record::Ticket(t)) => self.insert_ticket(t),
            ChangeEvent::Insert(Record::Message(m)) => self.insert_message(m),
            ChangeEvent::Update(Record::Ticket(t)) => self.update_ticket(t),
            ChangeEvent::Update(Record::Message(m)) => self.update_message(m),
            ChangeEvent::Delete(Record::Ticket(t)) => self.delete_ticket(&t.id),
            ChangeEvent::Delete(Record::Message(m)) => self.delete_message(m),
            ChangeEvent::Broadcast(_) => ApplyOutcome::Ignored,
        }
    }

    fn insert_ticket(&mut self, incoming: &Ticket) -> ApplyOutcome {
        if !self.view.admits(incoming) {
            tracing::debug!(ticket = %incoming.id, "ticket outside view ignored");
            return ApplyOutcome::Ignored;
        }
        if self.has_ticket(&incoming.id) {
            tracing::debug!(ticket = %incoming.id, "duplicate ticket insert dropped");
            return ApplyOutcome::Duplicate;
        }
        let id = RecordId::Ticket(incoming.id);
        if let Some(pos) = self.matching_pending_ticket(incoming) {
            let record = &mut self.tickets[pos];
            let local_id = record.key.local_id();
            record.key = RecordKey::Confirmed(incoming.id);
            record.ticket = incoming.clone();
            record.pending = false;
            if let Some(local_id) = local_id {
                return ApplyOutcome::Promoted { local_id, id };
            }
        }
        self.tickets.push(TicketRecord {
            key: RecordKey::Confirmed(incoming.id),
            ticket: incoming.clone(),
            pending: false,
        });
        ApplyOutcome::Inserted(id)
    }

    fn matching_pending_ticket(&self, incoming: &Ticket) -> Option<usize> {
        self.tickets.iter().position(|r| {
            matches!(r.key, RecordKey::Pending(_))
                && match incoming.last_correlation_id {
                    Some(cid) => r.ticket.last_correlation_id == Some(cid),
                    None => {
                        r.ticket.requester_id == incoming.requester_id
                            && r.ticket.title == incoming.title
                            && within(
                                r.ticket.created_at,
                                incoming.created_at,
                                self.match_window_ms,
                            )
                    }
                }
        })
    }

    fn insert_message(&mut self, incoming: &ChatMessage) -> ApplyOutcome {
        let window = self.match_window_ms;
        let list = self.messages.entry(incoming.ticket_id).or_default();
        if list
            .iter()
            .any(|r| r.key == RecordKey::Confirmed(incoming.id))
        {
            tracing::debug!(message = %incoming.id, "duplicate message insert dropped");
            return ApplyOutcome::Duplicate;
        }
        let id = RecordId::Message(incoming.id);
        let pending = list.iter().position(|r| {
            matches!(r.key, RecordKey::Pending(_))
                && match incoming.correlation_id {
                    Some(cid) => r.message.correlation_id == Some(cid),
                    None => {
                        r.message.author_id == incoming.author_id
                            && r.message.body == incoming.body
                            && within(r.message.created_at, incoming.created_at, window)
                    }
                }
        });
        if let Some(pos) = pending {
            let record = &mut list[pos];
            let local_id = record.key.local_id();
            record.key = RecordKey::Confirmed(incoming.id);
            record.message = incoming.clone();
            record.pending = false;
            if let Some(local_id) = local_id {
                return ApplyOutcome::Promoted { local_id, id };
            }
        }
        list.push(MessageRecord {
            key: RecordKey::Confirmed(incoming.id),
            message: incoming.clone(),
            pending: false,
        });
        ApplyOutcome::Inserted(id)
    }

    fn update_ticket(&mut self, incoming: &Ticket) -> ApplyOutcome {
        let Some(held) = self.server_version(&incoming.id) else {
            tracing::debug!(ticket = %incoming.id, "update for unknown ticket ignored");
            return ApplyOutcome::Ignored;
        };
        let confirmed_patch = incoming.last_correlation_id.and_then(|cid| {
            self.patches
                .iter()
                .position(|p| p.ticket_id == incoming.id && p.correlation_id == cid)
        });
        if incoming.updated_at <= held.updated_at && confirmed_patch.is_none() {
            tracing::debug!(ticket = %incoming.id, "stale ticket update dropped");
            return ApplyOutcome::Stale;
        }

        let confirmed = confirmed_patch.map(|pos| self.patches.remove(pos).local_id);
        self.set_server_version(incoming.clone());
        match confirmed {
            Some(local_id) => ApplyOutcome::PatchConfirmed {
                local_id,
                ticket_id: incoming.id,
            },
            None => ApplyOutcome::Updated(RecordId::Ticket(incoming.id)),
        }
    }

    fn update_message(&mut self, incoming: &ChatMessage) -> ApplyOutcome {
        let Some(record) = self
            .messages
            .get_mut(&incoming.ticket_id)
            .and_then(|list| {
                list.iter_mut()
                    .find(|r| r.key == RecordKey::Confirmed(incoming.id))
            })
        else {
            tracing::debug!(message = %incoming.id, "update for unknown message ignored");
            return ApplyOutcome::Ignored;
        };
        let mut next = incoming.clone();
        // A read receipt never regresses.
        if next.read_at.is_none() {
            next.read_at = record.message.read_at;
        }
        if record.message == next {
            return ApplyOutcome::Duplicate;
        }
        record.message = next;
        ApplyOutcome::Updated(RecordId::Message(incoming.id))
    }

    fn delete_ticket(&mut self, id: &TicketId) -> ApplyOutcome {
        let before = self.tickets.len();
        self.tickets.retain(|r| r.key != RecordKey::Confirmed(*id));
        if self.tickets.len() == before {
            tracing::debug!(ticket = %id, "delete for unknown ticket ignored");
            return ApplyOutcome::Ignored;
        }
        self.messages.remove(id);
        self.bases.remove(id);
        self.patches.retain(|p| p.ticket_id != *id);
        let closed_selection = self.selected == Some(*id);
        if closed_selection {
            self.selected = None;
        }
        ApplyOutcome::Deleted {
            id: RecordId::Ticket(*id),
            closed_selection,
        }
    }

    fn delete_message(&mut self, incoming: &ChatMessage) -> ApplyOutcome {
        let Some(list) = self.messages.get_mut(&incoming.ticket_id) else {
            return ApplyOutcome::Ignored;
        };
        let before = list.len();
        list.retain(|r| r.key != RecordKey::Confirmed(incoming.id));
        if list.len() == before {
            tracing::debug!(message = %incoming.id, "delete for unknown message ignored");
            return ApplyOutcome::Ignored;
        }
        ApplyOutcome::Deleted {
            id: RecordId::Message(incoming.id),
            closed_selection: false,
        }
    }

    // -----------------------------------------------------------------------
    // Optimistic
    // -----------------------------------------------------------------------

    /// Adds a provisional record. Returns `false` if a patch targets a
    /// ticket that is not held.
    pub fn apply_local_optimistic(&mut self, optimistic: Optimistic) -> bool {
        match optimistic {
            Optimistic::Message { local_id, message } => {
                self.messages
                    .entry(message.ticket_id)
                    .or_default()
                    .push(MessageRecord {
                        key: RecordKey::Pending(local_id),
                        message,
                        pending: true,
                    });
                true
            }
            Optimistic::Ticket { local_id, ticket } => {
                self.tickets.push(TicketRecord {
                    key: RecordKey::Pending(local_id),
                    ticket,
                    pending: true,
                });
                true
            }
            Optimistic::Patch {
                local_id,
                ticket_id,
                correlation_id,
                patch,
            } => {
                let Some(base) = self.server_version(&ticket_id) else {
                    return false;
                };
                self.bases.entry(ticket_id).or_insert(base);
                self.patches.push(PendingPatch {
                    local_id,
                    ticket_id,
                    correlation_id,
                    patch,
                });
                self.recompute(&ticket_id);
                true
            }
        }
    }

    /// Confirms the pending record `local_id` with the write response.
    ///
    /// Works whichever arrives first: if an inbound event already confirmed
    /// the record this is a no-op, and a pending record that is already gone
    /// (e.g. rolled back on timeout) is re-added as confirmed.
    pub fn reconcile(&mut self, local_id: LocalId, server: &Record) -> ReconcileOutcome {
        match server {
            Record::Message(m) => {
                let list = self.messages.entry(m.ticket_id).or_default();
                let confirmed = list.iter().any(|r| r.key == RecordKey::Confirmed(m.id));
                let pending = list
                    .iter()
                    .position(|r| r.key == RecordKey::Pending(local_id));
                match (confirmed, pending) {
                    (true, Some(pos)) => {
                        list.remove(pos);
                        ReconcileOutcome::AlreadyConfirmed
                    }
                    (true, None) => ReconcileOutcome::AlreadyConfirmed,
                    (false, Some(pos)) => {
                        let record = &mut list[pos];
                        record.key = RecordKey::Confirmed(m.id);
                        record.message = m.clone();
                        record.pending = false;
                        ReconcileOutcome::Promoted
                    }
                    (false, None) => {
                        list.push(MessageRecord {
                            key: RecordKey::Confirmed(m.id),
                            message: m.clone(),
                            pending: false,
                        });
                        ReconcileOutcome::Inserted
                    }
                }
            }
            Record::Ticket(t) => {
                if let Some(pos) = self.patches.iter().position(|p| p.local_id == local_id) {
                    self.patches.remove(pos);
                    let newer = self
                        .server_version(&t.id)
                        .is_none_or(|held| t.updated_at >= held.updated_at);
                    if newer {
                        self.set_server_version(t.clone());
                    } else {
                        self.recompute(&t.id);
                    }
                    return ReconcileOutcome::Promoted;
                }
                let confirmed = self.has_ticket(&t.id);
                let pending = self
                    .tickets
                    .iter()
                    .position(|r| r.key == RecordKey::Pending(local_id));
                match (confirmed, pending) {
                    (true, Some(pos)) => {
                        self.tickets.remove(pos);
                        ReconcileOutcome::AlreadyConfirmed
                    }
                    (true, None) => {
                        // A patch response after the patch was settled another way.
                        if self
                            .server_version(&t.id)
                            .is_some_and(|held| t.updated_at > held.updated_at)
                        {
                            self.set_server_version(t.clone());
                        }
                        ReconcileOutcome::AlreadyConfirmed
                    }
                    (false, Some(pos)) => {
                        let record = &mut self.tickets[pos];
                        record.key = RecordKey::Confirmed(t.id);
                        record.ticket = t.clone();
                        record.pending = false;
                        ReconcileOutcome::Promoted
                    }
                    (false, None) => {
                        if !self.view.admits(t) {
                            return ReconcileOutcome::Ignored;
                        }
                        self.tickets.push(TicketRecord {
                            key: RecordKey::Confirmed(t.id),
                            ticket: t.clone(),
                            pending: false,
                        });
                        ReconcileOutcome::Inserted
                    }
                }
            }
        }
    }

    /// Removes the pending record `local_id`, or discards the pending patch
    /// `local_id` and shows the ticket's server version (plus any other
    /// pending patches) again.
    ///
    /// Returns `None` if nothing with that key is pending any more.
    pub fn rollback(&mut self, local_id: LocalId) -> Option<RolledBack> {
        if let Some(pos) = self.patches.iter().position(|p| p.local_id == local_id) {
            let patch = self.patches.remove(pos);
            self.recompute(&patch.ticket_id);
            return Some(RolledBack::Patch {
                ticket_id: patch.ticket_id,
                patch: patch.patch,
            });
        }
        if let Some(pos) = self
            .tickets
            .iter()
            .position(|r| r.key == RecordKey::Pending(local_id))
        {
            return Some(RolledBack::Ticket(self.tickets.remove(pos).ticket));
        }
        for list in self.messages.values_mut() {
            if let Some(pos) = list
                .iter()
                .position(|r| r.key == RecordKey::Pending(local_id))
            {
                return Some(RolledBack::Message(list.remove(pos).message));
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Resync
    // -----------------------------------------------------------------------

    /// Replaces all confirmed tickets with `snapshot`, keeping pending
    /// creations that the snapshot does not confirm and re-layering pending
    /// patches on the fetched versions.
    pub fn replace_tickets(&mut self, snapshot: Vec<Ticket>) -> ResyncOutcome {
        let mut outcome = ResyncOutcome::default();
        let snapshot: Vec<Ticket> = snapshot
            .into_iter()
            .filter(|t| self.view.admits(t))
            .collect();

        let mut next: Vec<TicketRecord> = Vec::with_capacity(snapshot.len());
        for record in self.tickets.drain(..) {
            if let RecordKey::Pending(local_id) = record.key {
                let confirmed = record.ticket.last_correlation_id.is_some_and(|cid| {
                    snapshot.iter().any(|t| t.last_correlation_id == Some(cid))
                });
                if confirmed {
                    outcome.promoted.push(local_id);
                } else {
                    next.push(record);
                }
            }
        }
        for ticket in &snapshot {
            next.push(TicketRecord {
                key: RecordKey::Confirmed(ticket.id),
                ticket: ticket.clone(),
                pending: false,
            });
        }
        self.tickets = next;

        // Patches whose echo is in the snapshot are confirmed.
        let patches = std::mem::take(&mut self.patches);
        for patch in patches {
            match snapshot.iter().find(|t| t.id == patch.ticket_id) {
                Some(t) if t.last_correlation_id == Some(patch.correlation_id) => {
                    outcome.promoted.push(patch.local_id);
                }
                Some(_) => self.patches.push(patch),
                None => {}
            }
        }
        self.bases.clear();
        let patched: Vec<TicketId> = self.patches.iter().map(|p| p.ticket_id).collect();
        for ticket_id in patched {
            if let Some(base) = snapshot.iter().find(|t| t.id == ticket_id) {
                self.bases.entry(ticket_id).or_insert_with(|| base.clone());
            }
            self.recompute(&ticket_id);
        }

        self.messages.retain(|id, list| {
            snapshot.iter().any(|t| t.id == *id) || list.iter().any(|m| m.pending)
        });
        if let Some(selected) = self.selected
            && !snapshot.iter().any(|t| t.id == selected)
        {
            self.selected = None;
            self.messages.remove(&selected);
            outcome.closed_selection = Some(selected);
        }
        outcome
    }

    /// Replaces the confirmed messages of `ticket` with `snapshot`, keeping
    /// pending sends that the snapshot does not confirm.
    pub fn replace_messages(
        &mut self,
        ticket: TicketId,
        snapshot: Vec<ChatMessage>,
    ) -> ResyncOutcome {
        let mut outcome = ResyncOutcome::default();
        let window = self.match_window_ms;
        let previous = self.messages.remove(&ticket).unwrap_or_default();
        let mut next: Vec<MessageRecord> = snapshot
            .iter()
            .filter(|m| m.ticket_id == ticket)
            .map(|m| MessageRecord {
                key: RecordKey::Confirmed(m.id),
                message: m.clone(),
                pending: false,
            })
            .collect();
        for record in previous {
            let RecordKey::Pending(local_id) = record.key else {
                continue;
            };
            let confirmed = snapshot.iter().any(|m| match m.correlation_id {
                Some(cid) => record.message.correlation_id == Some(cid),
                None => {
                    m.author_id == record.message.author_id
                        && m.body == record.message.body
                        && within(record.message.created_at, m.created_at, window)
                }
            });
            if confirmed {
                outcome.promoted.push(local_id);
            } else {
                next.push(record);
            }
        }
        self.messages.insert(ticket, next);
        outcome
    }

    // -----------------------------------------------------------------------
    // Patch layering
    // -----------------------------------------------------------------------

    fn server_version(&self, id: &TicketId) -> Option<Ticket> {
        self.bases
            .get(id)
            .cloned()
            .or_else(|| self.ticket(id).cloned())
    }

    fn set_server_version(&mut self, ticket: Ticket) {
        let id = ticket.id;
        if self.patches.iter().any(|p| p.ticket_id == id) {
            self.bases.insert(id, ticket);
            self.recompute(&id);
        } else {
            self.bases.remove(&id);
            if let Some(record) = self
                .tickets
                .iter_mut()
                .find(|r| r.key == RecordKey::Confirmed(id))
            {
                record.ticket = ticket;
                record.pending = false;
            }
        }
    }

    /// Rebuilds the visible ticket from its server version plus pending patches.
    fn recompute(&mut self, id: &TicketId) {
        let Some(base) = self.bases.get(id).cloned() else {
            return;
        };
        let mut view = base.clone();
        let mut pending = false;
        for patch in self.patches.iter().filter(|p| p.ticket_id == *id) {
            patch.patch.apply_to(&mut view);
            pending = true;
        }
        if !pending {
            self.bases.remove(id);
            view = base;
        }
        if let Some(record) = self
            .tickets
            .iter_mut()
            .find(|r| r.key == RecordKey::Confirmed(*id))
        {
            record.ticket = view;
            record.pending = pending;
        }
    }
}

const fn within(a: Timestamp, b: Timestamp, window_ms: u64) -> bool {
    a.millis_since(b) <= window_ms && b.millis_since(a) <= window_ms
}
