//! In-memory reference store with the semantics of the data collaborator.
//!
//! [`MemoryStore`] implements list/fetch/insert/update/delete over tickets
//! and messages and reports, for every write, the [`Effect`]s (topic +
//! change event) a realtime layer has to publish. It performs no I/O and
//! holds no locks; callers wrap it in whatever synchronization they use.
//!
//! Inserts are idempotent by correlation id: replaying an insert whose
//! correlation id was already seen returns the original record and
//! publishes nothing.

use std::collections::HashMap;

use crate::event::ChangeEvent;
use crate::hub::HubFailure;
use crate::ids::{CorrelationId, MessageId, TicketId, Timestamp, UserId};
use crate::record::{
    ChatMessage, Entity, Filter, MAX_MESSAGE_BODY, MAX_TICKET_TITLE, NewMessage, NewRecord,
    NewTicket, Patch, Record, RecordId, Ticket, TicketStatus,
};
use crate::topic::TopicKey;

/// Errors reported by [`MemoryStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The write is not acceptable.
    #[error("{0}")]
    Rejected(String),
}

impl From<StoreError> for HubFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Rejected(reason) => Self::Rejected(reason),
        }
    }
}

/// A change event that must be published on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effect {
    /// Destination topic.
    pub topic: TopicKey,
    /// The event.
    pub event: ChangeEvent,
}

fn effects_for(event: &ChangeEvent, record: &Record) -> Vec<Effect> {
    TopicKey::for_record(record)
        .into_iter()
        .map(|topic| Effect {
            topic,
            event: event.clone(),
        })
        .collect()
}

/// Tickets and messages held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tickets: Vec<Ticket>,
    messages: Vec<ChatMessage>,
    inserted: HashMap<CorrelationId, RecordId>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All tickets, in creation order.
    #[must_use]
    pub fn tickets(&self) -> &[Ticket] {
        &self.tickets
    }

    /// All messages, in creation order.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn ticket(&self, id: &TicketId) -> Result<&Ticket, StoreError> {
        self.tickets
            .iter()
            .find(|t| t.id == *id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))
    }

    fn message(&self, id: &MessageId) -> Result<&ChatMessage, StoreError> {
        self.messages
            .iter()
            .find(|m| m.id == *id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    /// Lists records of `entity` matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Rejected` for filters that make no sense for the
    /// entity (e.g. `MessagesOf` on tickets).
    pub fn fetch_list(&self, entity: Entity, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        match (entity, filter) {
            (Entity::Ticket, Filter::All) => {
                Ok(self.tickets.iter().cloned().map(Record::Ticket).collect())
            }
            (Entity::Ticket, Filter::RequestedBy(user)) => Ok(self
                .tickets
                .iter()
                .filter(|t| t.requester_id == *user)
                .cloned()
                .map(Record::Ticket)
                .collect()),
            (Entity::Message, Filter::All) => {
                Ok(self.messages.iter().cloned().map(Record::Message).collect())
            }
            (Entity::Message, Filter::MessagesOf(ticket)) => Ok(self
                .messages
                .iter()
                .filter(|m| m.ticket_id == *ticket)
                .cloned()
                .map(Record::Message)
                .collect()),
            (Entity::Message, Filter::Unread { reader, requester }) => Ok(self
                .messages
                .iter()
                .filter(|m| m.author_id != *reader && m.read_at.is_none())
                .filter(|m| {
                    requester.as_ref().is_none_or(|req| {
                        self.tickets
                            .iter()
                            .any(|t| t.id == m.ticket_id && t.requester_id == *req)
                    })
                })
                .cloned()
                .map(Record::Message)
                .collect()),
            (entity, filter) => Err(StoreError::Rejected(format!(
                "filter {filter:?} does not apply to {entity:?}"
            ))),
        }
    }

    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record has that id.
    pub fn fetch_one(&self, id: &RecordId) -> Result<Record, StoreError> {
        match id {
            RecordId::Ticket(tid) => self.ticket(tid).cloned().map(Record::Ticket),
            RecordId::Message(mid) => self.message(mid).cloned().map(Record::Message),
        }
    }

    /// Creates a record, returning it with the events to publish.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Rejected` for invalid payloads or messages posted
    /// to a closed ticket, and `StoreError::NotFound` for messages posted to
    /// an unknown ticket.
    pub fn insert(
        &mut self,
        payload: NewRecord,
        now: Timestamp,
    ) -> Result<(Record, Vec<Effect>), StoreError> {
        let correlation_id = payload.correlation_id();
        if let Some(existing) = self.inserted.get(&correlation_id) {
            // Replayed write: answer with the original, publish nothing.
            return self.fetch_one(existing).map(|record| (record, Vec::new()));
        }

        let record = match payload {
            NewRecord::Ticket(new) => Record::Ticket(self.insert_ticket(new, now)?),
            NewRecord::Message(new) => Record::Message(self.insert_message(new, now)?),
        };
        self.inserted.insert(correlation_id, record.id());
        let effects = effects_for(&ChangeEvent::Insert(record.clone()), &record);
        Ok((record, effects))
    }

    fn insert_ticket(&mut self, new: NewTicket, now: Timestamp) -> Result<Ticket, StoreError> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(StoreError::Rejected("ticket title is empty".into()));
        }
        if title.chars().count() > MAX_TICKET_TITLE {
            return Err(StoreError::Rejected(format!(
                "ticket title longer than {MAX_TICKET_TITLE} characters"
            )));
        }
        let ticket = Ticket {
            id: TicketId::new(),
            title: title.to_string(),
            description: new.description,
            status: TicketStatus::Open,
            priority: new.priority,
            category: new.category,
            requester_id: new.requester_id,
            assignee_id: None,
            created_at: now,
            updated_at: now,
            last_correlation_id: Some(new.correlation_id),
        };
        self.tickets.push(ticket.clone());
        Ok(ticket)
    }

    fn insert_message(
        &mut self,
        new: NewMessage,
        now: Timestamp,
    ) -> Result<ChatMessage, StoreError> {
        if new.body.trim().is_empty() {
            return Err(StoreError::Rejected("message body is empty".into()));
        }
        if new.body.len() > MAX_MESSAGE_BODY {
            return Err(StoreError::Rejected(format!(
                "message body larger than {MAX_MESSAGE_BODY} bytes"
            )));
        }
        if self.ticket(&new.ticket_id)?.status == TicketStatus::Closed {
            return Err(StoreError::Rejected("ticket is closed".into()));
        }
        let message = ChatMessage {
            id: MessageId::new(),
            ticket_id: new.ticket_id,
            author_id: new.author_id,
            author_name: new.author_name,
            body: new.body,
            created_at: now,
            read_at: None,
            correlation_id: Some(new.correlation_id),
        };
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Applies a patch, returning the new version with the events to publish.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for unknown targets and
    /// `StoreError::Rejected` for empty patches or patches on messages.
    pub fn update(
        &mut self,
        id: &RecordId,
        patch: Patch,
        now: Timestamp,
    ) -> Result<(Record, Vec<Effect>), StoreError> {
        let RecordId::Ticket(ticket_id) = id else {
            return Err(StoreError::Rejected("messages cannot be edited".into()));
        };
        match patch {
            Patch::Ticket {
                patch,
                correlation_id,
            } => {
                if patch.is_empty() {
                    return Err(StoreError::Rejected("empty ticket patch".into()));
                }
                if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
                    return Err(StoreError::Rejected("ticket title is empty".into()));
                }
                let ticket = self
                    .tickets
                    .iter_mut()
                    .find(|t| t.id == *ticket_id)
                    .ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))?;
                patch.apply_to(ticket);
                // Versions must strictly increase even within one millisecond.
                ticket.updated_at =
                    Timestamp::from_millis(now.as_millis().max(ticket.updated_at.as_millis() + 1));
                ticket.last_correlation_id = Some(correlation_id);
                let record = Record::Ticket(ticket.clone());
                let effects = effects_for(&ChangeEvent::Update(record.clone()), &record);
                Ok((record, effects))
            }
            Patch::MarkRead { reader } => self.mark_read(ticket_id, &reader, now),
        }
    }

    fn mark_read(
        &mut self,
        ticket_id: &TicketId,
        reader: &UserId,
        now: Timestamp,
    ) -> Result<(Record, Vec<Effect>), StoreError> {
        let ticket = Record::Ticket(self.ticket(ticket_id)?.clone());
        let mut effects = Vec::new();
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.ticket_id == *ticket_id && m.author_id != *reader && m.read_at.is_none())
        {
            message.read_at = Some(now);
            let record = Record::Message(message.clone());
            effects.extend(effects_for(&ChangeEvent::Update(record.clone()), &record));
        }
        Ok((ticket, effects))
    }

    /// Removes a record, returning the events to publish.
    ///
    /// Deleting a ticket also drops its messages; only the ticket deletion
    /// is published.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record has that id.
    pub fn delete(&mut self, id: &RecordId) -> Result<Vec<Effect>, StoreError> {
        let record = self.fetch_one(id)?;
        match id {
            RecordId::Ticket(tid) => {
                self.tickets.retain(|t| t.id != *tid);
                self.messages.retain(|m| m.ticket_id != *tid);
            }
            RecordId::Message(mid) => self.messages.retain(|m| m.id != *mid),
        }
        Ok(effects_for(&ChangeEvent::Delete(record.clone()), &record))
    }
}
