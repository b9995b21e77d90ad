//! Typing indicator signal broadcast on a ticket's typing topic.

use serde::{Deserialize, Serialize};

use crate::ids::{TicketId, UserId};

/// A typing indicator sent between participants of a ticket chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    /// The ticket whose chat is being typed into.
    pub ticket_id: TicketId,
    /// Who is typing.
    pub user_id: UserId,
    /// Display name to show in the indicator.
    pub name: String,
    /// `true` while typing, `false` on an explicit stop.
    pub is_typing: bool,
}
