//! Topic keys naming the realtime channels a client can subscribe to.

use serde::{Deserialize, Serialize};

use crate::ids::TicketId;
use crate::record::{ChatMessage, Record};

/// Stable key of a realtime topic.
///
/// The string form (`ticket-list`, `ticket:{id}`, `typing:{id}`, `presence`,
/// `unread-counters`) is what gets logged and is parseable back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TopicKey {
    /// Insert/update/delete events for tickets.
    TicketList,
    /// Message events for one ticket.
    Messages(TicketId),
    /// Typing broadcasts for one ticket.
    Typing(TicketId),
    /// Presence snapshots of online staff.
    Presence,
    /// Message events across every ticket, used for unread counts.
    UnreadCounters,
}

impl TopicKey {
    /// The ticket this topic is scoped to, if any.
    #[must_use]
    pub const fn ticket(&self) -> Option<&TicketId> {
        match self {
            Self::Messages(id) | Self::Typing(id) => Some(id),
            _ => None,
        }
    }

    /// Topics on which a change to `record` is published.
    #[must_use]
    pub fn for_record(record: &Record) -> Vec<Self> {
        match record {
            Record::Ticket(_) => vec![Self::TicketList],
            Record::Message(ChatMessage { ticket_id, .. }) => {
                vec![Self::Messages(*ticket_id), Self::UnreadCounters]
            }
        }
    }
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TicketList => write!(f, "ticket-list"),
            Self::Messages(id) => write!(f, "ticket:{id}"),
            Self::Typing(id) => write!(f, "typing:{id}"),
            Self::Presence => write!(f, "presence"),
            Self::UnreadCounters => write!(f, "unread-counters"),
        }
    }
}

/// Error returned when a string is not a valid topic key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid topic key: {0}")]
pub struct TopicParseError(pub String);

impl std::str::FromStr for TopicKey {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TopicParseError(s.to_string());
        match s {
            "ticket-list" => Ok(Self::TicketList),
            "presence" => Ok(Self::Presence),
            "unread-counters" => Ok(Self::UnreadCounters),
            _ => {
                let (kind, id) = s.split_once(':').ok_or_else(invalid)?;
                let id: TicketId = id.parse().map_err(|_| invalid())?;
                match kind {
                    "ticket" => Ok(Self::Messages(id)),
                    "typing" => Ok(Self::Typing(id)),
                    _ => Err(invalid()),
                }
            }
        }
    }
}
