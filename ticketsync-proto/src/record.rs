//! Ticket and chat message entities, write payloads, and query filters.

use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, MessageId, TicketId, Timestamp, UserId};

/// Maximum allowed chat message body size in bytes (16 KB).
pub const MAX_MESSAGE_BODY: usize = 16 * 1024;

/// Maximum allowed ticket title length in characters.
pub const MAX_TICKET_TITLE: usize = 200;

/// Role of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// A client of the firm who opens tickets.
    Client,
    /// A lawyer or support analyst working tickets.
    Agent,
    /// A team lead who can reassign tickets.
    Supervisor,
    /// Full administrative access.
    Admin,
}

impl Role {
    /// Whether this role has the staff capability (presence, all tickets).
    #[must_use]
    pub const fn is_staff(self) -> bool {
        !matches!(self, Self::Client)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Agent => write!(f, "agent"),
            Self::Supervisor => write!(f, "supervisor"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "agent" | "lawyer" | "analyst" => Ok(Self::Agent),
            "supervisor" => Ok(Self::Supervisor),
            "admin" => Ok(Self::Admin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Lifecycle state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    /// Newly opened, nobody working on it yet.
    Open,
    /// An agent is working on it.
    InProgress,
    /// Waiting for the client to answer.
    WaitingOnClient,
    /// Solution delivered, awaiting closure.
    Resolved,
    /// Closed; no further messages are accepted.
    Closed,
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in-progress"),
            Self::WaitingOnClient => write!(f, "waiting-on-client"),
            Self::Resolved => write!(f, "resolved"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in-progress" => Ok(Self::InProgress),
            "waiting-on-client" => Ok(Self::WaitingOnClient),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

/// Urgency of a ticket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Can wait.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Should be handled today.
    High,
    /// Deadline-bound; handle immediately.
    Urgent,
}

/// A support ticket as stored by the backing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Server-issued identifier.
    pub id: TicketId,
    /// Short summary.
    pub title: String,
    /// Longer description of the legal question.
    pub description: String,
    /// Current lifecycle state.
    pub status: TicketStatus,
    /// Urgency.
    pub priority: Priority,
    /// Practice area (labour, family, ...), if categorized.
    pub category: Option<String>,
    /// The client who opened the ticket.
    pub requester_id: UserId,
    /// The staff member working the ticket, if assigned.
    pub assignee_id: Option<UserId>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the last write; used for last-write-wins.
    pub updated_at: Timestamp,
    /// Correlation id of the write that produced this version.
    pub last_correlation_id: Option<CorrelationId>,
}

/// A chat message posted on a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-issued identifier.
    pub id: MessageId,
    /// The ticket this message belongs to.
    pub ticket_id: TicketId,
    /// Who wrote it.
    pub author_id: UserId,
    /// Author display name at the time of writing.
    pub author_name: String,
    /// Message text.
    pub body: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// When the counterpart read the message, if they have.
    pub read_at: Option<Timestamp>,
    /// Correlation id of the insert that created this message.
    pub correlation_id: Option<CorrelationId>,
}

/// Payload for creating a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTicket {
    /// Short summary.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Urgency.
    pub priority: Priority,
    /// Practice area.
    pub category: Option<String>,
    /// The client opening the ticket.
    pub requester_id: UserId,
    /// Client-generated correlation id.
    pub correlation_id: CorrelationId,
}

/// Payload for posting a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Target ticket.
    pub ticket_id: TicketId,
    /// Author.
    pub author_id: UserId,
    /// Author display name.
    pub author_name: String,
    /// Message text.
    pub body: String,
    /// Client-generated correlation id.
    pub correlation_id: CorrelationId,
}

/// Payload of an insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewRecord {
    /// Create a ticket.
    Ticket(NewTicket),
    /// Post a message.
    Message(NewMessage),
}

impl NewRecord {
    /// Correlation id carried by this payload.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        match self {
            Self::Ticket(t) => t.correlation_id,
            Self::Message(m) => m.correlation_id,
        }
    }
}

/// Partial update of a ticket's mutable fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPatch {
    /// New title.
    pub title: Option<String>,
    /// New status.
    pub status: Option<TicketStatus>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New assignee (`Some(None)` unassigns).
    pub assignee_id: Option<Option<UserId>>,
    /// New category (`Some(None)` clears).
    pub category: Option<Option<String>>,
}

impl TicketPatch {
    /// Returns `true` if the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.assignee_id.is_none()
            && self.category.is_none()
    }

    /// Applies the set fields of this patch onto `ticket`.
    pub fn apply_to(&self, ticket: &mut Ticket) {
        if let Some(title) = &self.title {
            ticket.title.clone_from(title);
        }
        if let Some(status) = self.status {
            ticket.status = status;
        }
        if let Some(priority) = self.priority {
            ticket.priority = priority;
        }
        if let Some(assignee) = &self.assignee_id {
            ticket.assignee_id.clone_from(assignee);
        }
        if let Some(category) = &self.category {
            ticket.category.clone_from(category);
        }
    }
}

/// Payload of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Patch {
    /// Change ticket fields.
    Ticket {
        /// The field changes.
        patch: TicketPatch,
        /// Client-generated correlation id, echoed on the resulting version.
        correlation_id: CorrelationId,
    },
    /// Mark every message on the ticket not written by `reader` as read.
    MarkRead {
        /// The user who read the ticket.
        reader: UserId,
    },
}

/// Kind of stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Entity {
    /// Tickets.
    Ticket,
    /// Chat messages.
    Message,
}

/// Identifier of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordId {
    /// A ticket.
    Ticket(TicketId),
    /// A message.
    Message(MessageId),
}

impl RecordId {
    /// The entity kind this id refers to.
    #[must_use]
    pub const fn entity(&self) -> Entity {
        match self {
            Self::Ticket(_) => Entity::Ticket,
            Self::Message(_) => Entity::Message,
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticket(id) => write!(f, "ticket/{id}"),
            Self::Message(id) => write!(f, "message/{id}"),
        }
    }
}

/// A stored record of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// A ticket.
    Ticket(Ticket),
    /// A message.
    Message(ChatMessage),
}

impl Record {
    /// Identifier of this record.
    #[must_use]
    pub const fn id(&self) -> RecordId {
        match self {
            Self::Ticket(t) => RecordId::Ticket(t.id),
            Self::Message(m) => RecordId::Message(m.id),
        }
    }
}

/// Selection criteria for `fetch_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Every record of the entity.
    All,
    /// Tickets opened by this user.
    RequestedBy(UserId),
    /// Messages posted on this ticket, oldest first.
    MessagesOf(TicketId),
    /// Messages not written by `reader` and not read yet, optionally limited
    /// to tickets opened by `requester`.
    Unread {
        /// The user whose unread messages are requested.
        reader: UserId,
        /// Restrict to tickets opened by this user.
        requester: Option<UserId>,
    },
}
