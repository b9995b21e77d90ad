//! Lease-based typing indicators.
//!
//! A typing signal grants its sender a lease on the ticket. The lease is
//! renewed by every further signal and revoked by an explicit stop; if
//! neither arrives it simply expires. Outbound signals are throttled per
//! ticket.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use ticketsync_proto::ids::{TicketId, UserId};
use ticketsync_proto::typing::TypingSignal;

#[derive(Debug, Clone)]
struct Lease {
    name: String,
    expires_at: Instant,
}

/// Who is typing on which ticket.
#[derive(Debug)]
pub struct TypingTracker {
    lease: Duration,
    throttle: Duration,
    leases: HashMap<TicketId, HashMap<UserId, Lease>>,
    last_sent: HashMap<TicketId, Instant>,
}

impl TypingTracker {
    /// Creates a tracker granting leases of `lease` and sending at most one
    /// outbound signal per `throttle` per ticket.
    #[must_use]
    pub fn new(lease: Duration, throttle: Duration) -> Self {
        Self {
            lease,
            throttle,
            leases: HashMap::new(),
            last_sent: HashMap::new(),
        }
    }

    /// Applies an inbound signal. The local user's own signals are ignored.
    /// Returns `true` if the visible typing list may have changed.
    pub fn apply(&mut self, signal: &TypingSignal, me: &UserId, now: Instant) -> bool {
        if signal.user_id == *me {
            return false;
        }
        if signal.is_typing {
            let leases = self.leases.entry(signal.ticket_id).or_default();
            let fresh = leases
                .get(&signal.user_id)
                .is_none_or(|l| l.expires_at <= now);
            leases.insert(
                signal.user_id.clone(),
                Lease {
                    name: signal.name.clone(),
                    expires_at: now + self.lease,
                },
            );
            fresh
        } else {
            let Some(leases) = self.leases.get_mut(&signal.ticket_id) else {
                return false;
            };
            let removed = leases.remove(&signal.user_id).is_some();
            if leases.is_empty() {
                self.leases.remove(&signal.ticket_id);
            }
            removed
        }
    }

    /// Names of users with an unexpired lease on `ticket`, sorted.
    #[must_use]
    pub fn typing_users(&self, ticket: &TicketId, now: Instant) -> Vec<String> {
        let mut names: Vec<String> = self
            .leases
            .get(ticket)
            .map(|leases| {
                leases
                    .values()
                    .filter(|l| l.expires_at > now)
                    .map(|l| l.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Drops expired leases and returns the tickets that lost one.
    pub fn prune(&mut self, now: Instant) -> Vec<TicketId> {
        let mut changed = Vec::new();
        self.leases.retain(|ticket, leases| {
            let before = leases.len();
            leases.retain(|_, l| l.expires_at > now);
            if leases.len() != before {
                changed.push(*ticket);
            }
            !leases.is_empty()
        });
        changed
    }

    /// Forgets everything about `ticket`. Returns `true` if anyone was typing.
    pub fn clear_ticket(&mut self, ticket: &TicketId) -> bool {
        self.last_sent.remove(ticket);
        self.leases.remove(ticket).is_some_and(|l| !l.is_empty())
    }

    /// Whether an outbound typing signal for `ticket` may be sent now.
    /// Records the send when it returns `true`.
    pub fn should_send(&mut self, ticket: &TicketId, now: Instant) -> bool {
        match self.last_sent.get(ticket) {
            Some(last) if now.duration_since(*last) < self.throttle => false,
            _ => {
                self.last_sent.insert(*ticket, now);
                true
            }
        }
    }

    /// Resets the throttle for `ticket`, so the next start is sent at once.
    pub fn reset_throttle(&mut self, ticket: &TicketId) {
        self.last_sent.remove(ticket);
    }
}
