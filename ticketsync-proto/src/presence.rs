//! Presence entries and the server-side board that aggregates heartbeats.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{Timestamp, UserId};
use crate::record::Role;

/// One online user as reported in a presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// The user.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Role of the user.
    pub role: Role,
    /// Time of the user's most recent heartbeat.
    pub last_seen_at: Timestamp,
}

/// Aggregates heartbeats into full snapshots.
///
/// Held by whoever plays the server role. Entries are keyed by user; a
/// newer heartbeat replaces the older one. Entries older than the TTL are
/// left out of snapshots.
#[derive(Debug, Default)]
pub struct PresenceBoard {
    entries: HashMap<UserId, PresenceEntry>,
}

impl PresenceBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heartbeat. Returns `true` if the user was not present before.
    pub fn heartbeat(&mut self, entry: PresenceEntry) -> bool {
        match self.entries.get_mut(&entry.user_id) {
            Some(existing) => {
                if entry.last_seen_at >= existing.last_seen_at {
                    *existing = entry;
                }
                false
            }
            None => {
                self.entries.insert(entry.user_id.clone(), entry);
                true
            }
        }
    }

    /// Removes a user. Returns `true` if they were present.
    pub fn leave(&mut self, user: &UserId) -> bool {
        self.entries.remove(user).is_some()
    }

    /// Full snapshot of users seen within `ttl_ms` of `now`, sorted by name.
    #[must_use]
    pub fn snapshot(&self, now: Timestamp, ttl_ms: u64) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .entries
            .values()
            .filter(|e| now.millis_since(e.last_seen_at) <= ttl_ms)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.user_id.cmp(&b.user_id)));
        entries
    }
}
