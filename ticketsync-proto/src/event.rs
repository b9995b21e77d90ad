//! Change events delivered on subscribed topics.

use serde::{Deserialize, Serialize};

use crate::presence::PresenceEntry;
use crate::record::Record;
use crate::typing::TypingSignal;

/// Ephemeral payload published on a topic without touching storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Broadcast {
    /// Someone started or stopped typing.
    Typing(TypingSignal),
    /// A staff member announcing they are online.
    Heartbeat(PresenceEntry),
    /// Full snapshot of online users. Always replaces, never patches.
    PresenceSync(Vec<PresenceEntry>),
}

/// One event on a topic stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// A record was created.
    Insert(Record),
    /// A record changed; carries the full new version.
    Update(Record),
    /// A record was removed; carries its last version.
    Delete(Record),
    /// An ephemeral broadcast.
    Broadcast(Broadcast),
}

impl ChangeEvent {
    /// Short label for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::Broadcast(_) => "broadcast",
        }
    }
}
