//! Online staff tracking from presence snapshots.
//!
//! The tracker never patches its entry set: every snapshot replaces it
//! wholesale. Only staff entries are kept, and entries whose last heartbeat
//! is older than the TTL at snapshot time are dropped.

use std::collections::HashMap;

use ticketsync_proto::ids::{Timestamp, UserId};
use ticketsync_proto::presence::PresenceEntry;
use ticketsync_proto::record::Role;

/// Selects which online users to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    /// Every tracked user.
    Any,
    /// Users with the staff capability.
    Staff,
    /// Users with exactly this role.
    Role(Role),
}

impl RoleFilter {
    fn matches(self, role: Role) -> bool {
        match self {
            Self::Any => true,
            Self::Staff => role.is_staff(),
            Self::Role(r) => r == role,
        }
    }
}

/// Current set of online staff.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    ttl_ms: u64,
    entries: Vec<PresenceEntry>,
}

impl PresenceTracker {
    /// Creates an empty tracker that drops entries older than `ttl_ms`.
    #[must_use]
    pub const fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: Vec::new(),
        }
    }

    /// Replaces the entry set with `snapshot`. Returns `true` if the set of
    /// online users changed.
    pub fn apply_snapshot(&mut self, snapshot: Vec<PresenceEntry>, now: Timestamp) -> bool {
        let mut by_user: HashMap<UserId, PresenceEntry> = HashMap::new();
        for entry in snapshot {
            if !entry.role.is_staff() || now.millis_since(entry.last_seen_at) > self.ttl_ms {
                continue;
            }
            match by_user.get(&entry.user_id) {
                Some(existing) if existing.last_seen_at >= entry.last_seen_at => {}
                _ => {
                    by_user.insert(entry.user_id.clone(), entry);
                }
            }
        }
        let mut next: Vec<PresenceEntry> = by_user.into_values().collect();
        next.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.user_id.cmp(&b.user_id)));

        let changed = next.len() != self.entries.len()
            || next
                .iter()
                .zip(&self.entries)
                .any(|(a, b)| a.user_id != b.user_id || a.name != b.name || a.role != b.role);
        self.entries = next;
        changed
    }

    /// Online users matching `filter`, sorted by name.
    #[must_use]
    pub fn online(&self, filter: RoleFilter) -> Vec<PresenceEntry> {
        self.entries
            .iter()
            .filter(|e| filter.matches(e.role))
            .cloned()
            .collect()
    }

    /// Whether `user` is online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.entries.iter().any(|e| e.user_id == *user)
    }

    /// Online flag for each of `users`.
    #[must_use]
    pub fn online_flags(&self, users: &[UserId]) -> HashMap<UserId, bool> {
        users
            .iter()
            .map(|u| (u.clone(), self.is_online(u)))
            .collect()
    }

    /// Forgets everyone.
    pub fn clear(&mut self) -> bool {
        let had = !self.entries.is_empty();
        self.entries.clear();
        had
    }
}
