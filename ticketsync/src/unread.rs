//! Per-ticket unread counters.
//!
//! Counters are sets of message ids, so a message delivered twice (or
//! seen both in a resync and on the live stream) is counted once.
//!
//! A message can arrive before its ticket does. Such messages are held
//! per ticket and counted once the ticket is admitted.

use std::collections::{HashMap, HashSet};

use ticketsync_proto::ids::{MessageId, TicketId, UserId};
use ticketsync_proto::record::ChatMessage;

/// Unread message ids by ticket.
#[derive(Debug, Default)]
pub struct UnreadCounters {
    unread: HashMap<TicketId, HashSet<MessageId>>,
    held: HashMap<TicketId, HashMap<MessageId, ChatMessage>>,
}

impl UnreadCounters {
    /// Creates empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an inbound message as unread unless it is the local user's
    /// own, already read, or on the ticket currently open.
    ///
    /// Returns `true` if the count of its ticket went up.
    pub fn record_inbound(
        &mut self,
        message: &ChatMessage,
        me: &UserId,
        active: Option<TicketId>,
    ) -> bool {
        if message.author_id == *me
            || message.read_at.is_some()
            || active == Some(message.ticket_id)
        {
            return false;
        }
        self.unread
            .entry(message.ticket_id)
            .or_default()
            .insert(message.id)
    }

    /// Handles a message update: a read receipt removes the message.
    /// Returns `true` if the count of its ticket went down.
    pub fn apply_read_receipt(&mut self, message: &ChatMessage) -> bool {
        if message.read_at.is_none() {
            return false;
        }
        self.remove_message(&message.ticket_id, &message.id)
    }

    /// Removes one message, held or counted. Returns `true` if it was
    /// counted.
    pub fn remove_message(&mut self, ticket: &TicketId, message: &MessageId) -> bool {
        if let Some(held) = self.held.get_mut(ticket) {
            held.remove(message);
            if held.is_empty() {
                self.held.remove(ticket);
            }
        }
        let Some(set) = self.unread.get_mut(ticket) else {
            return false;
        };
        let removed = set.remove(message);
        if set.is_empty() {
            self.unread.remove(ticket);
        }
        removed
    }

    /// Unread count of `ticket`.
    #[must_use]
    pub fn count(&self, ticket: &TicketId) -> usize {
        self.unread.get(ticket).map_or(0, HashSet::len)
    }

    /// Unread count over all tickets.
    #[must_use]
    pub fn total(&self) -> usize {
        self.unread.values().map(HashSet::len).sum()
    }

    /// Non-zero counts by ticket.
    #[must_use]
    pub fn counts(&self) -> HashMap<TicketId, usize> {
        self.unread
            .iter()
            .map(|(ticket, set)| (*ticket, set.len()))
            .collect()
    }

    /// Clears `ticket` and returns what was there, so it can be restored if
    /// the read write fails.
    pub fn take(&mut self, ticket: &TicketId) -> HashSet<MessageId> {
        self.unread.remove(ticket).unwrap_or_default()
    }

    /// Puts previously taken ids back, merged with anything that arrived since.
    pub fn restore(&mut self, ticket: TicketId, ids: HashSet<MessageId>) {
        if ids.is_empty() {
            return;
        }
        self.unread.entry(ticket).or_default().extend(ids);
    }

    /// Rebuilds every counter from a fetched list of unread messages.
    pub fn rebuild<'a>(
        &mut self,
        messages: impl IntoIterator<Item = &'a ChatMessage>,
        me: &UserId,
        active: Option<TicketId>,
    ) {
        self.unread.clear();
        self.held.clear();
        for message in messages {
            self.record_inbound(message, me, active);
        }
    }

    /// Drops the counter of a ticket that went away.
    pub fn forget_ticket(&mut self, ticket: &TicketId) -> bool {
        self.held.remove(ticket);
        self.unread.remove(ticket).is_some()
    }

    /// Keeps an inbound message whose ticket is not known yet. Messages that
    /// would never count are not kept.
    ///
    /// Returns `true` if the message was held.
    pub fn hold(&mut self, message: &ChatMessage, me: &UserId) -> bool {
        if message.author_id == *me || message.read_at.is_some() {
            return false;
        }
        self.held
            .entry(message.ticket_id)
            .or_default()
            .insert(message.id, message.clone());
        true
    }

    /// Counts the messages held for `ticket`. Returns `true` if its count
    /// went up.
    pub fn admit(&mut self, ticket: &TicketId, me: &UserId, active: Option<TicketId>) -> bool {
        let Some(held) = self.held.remove(ticket) else {
            return false;
        };
        let mut counted = false;
        for message in held.values() {
            counted |= self.record_inbound(message, me, active);
        }
        counted
    }

    /// Tickets with held messages.
    #[must_use]
    pub fn held_tickets(&self) -> Vec<TicketId> {
        self.held.keys().copied().collect()
    }

    /// Drops held messages of every ticket `keep` rejects.
    pub fn discard_held(&mut self, mut keep: impl FnMut(&TicketId) -> bool) {
        self.held.retain(|ticket, _| keep(ticket));
    }
}
