//! Change notification for UI layers.
//!
//! Observers register either a callback ([`Notifier::subscribe`]) or a
//! channel ([`Notifier::channel`]). Events are delivered after the core has
//! released its state lock, so an observer may call back into the core.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ticketsync_proto::ids::{LocalId, TicketId};

use crate::connection::ConnectionStatus;
use crate::optimistic::RestoreInput;

/// Something observable changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The ticket list changed.
    TicketsChanged,
    /// Messages of a ticket changed.
    MessagesChanged {
        /// The ticket.
        ticket_id: TicketId,
    },
    /// An unread counter changed.
    UnreadChanged {
        /// The ticket.
        ticket_id: TicketId,
        /// Its new count.
        count: usize,
    },
    /// The set of online staff changed.
    PresenceChanged,
    /// Who is typing on a ticket changed.
    TypingChanged {
        /// The ticket.
        ticket_id: TicketId,
    },
    /// The connection status changed.
    ConnectionChanged {
        /// Status before.
        previous: ConnectionStatus,
        /// Status now.
        current: ConnectionStatus,
    },
    /// The selected ticket disappeared; the selection was cleared.
    SelectionClosed {
        /// The ticket that was selected.
        ticket_id: TicketId,
    },
    /// A local mutation was confirmed by the server.
    MutationConfirmed {
        /// The mutation's local key.
        local_id: LocalId,
    },
    /// A local mutation failed and was rolled back.
    MutationFailed {
        /// The mutation's local key.
        local_id: LocalId,
        /// Why it failed.
        reason: String,
        /// Input to hand back to the user (compose text, draft, patch).
        restore: RestoreInput,
    },
    /// Marking a ticket read failed; its counter was restored.
    MarkReadFailed {
        /// The ticket.
        ticket_id: TicketId,
        /// Why it failed.
        reason: String,
    },
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
    channels: Vec<mpsc::Sender<SyncEvent>>,
}

/// Fan-out of [`SyncEvent`]s to registered observers.
#[derive(Clone, Default)]
pub struct Notifier {
    observers: Arc<Mutex<Observers>>,
}

impl Notifier {
    /// Creates a notifier with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback.
    pub fn subscribe<F>(&self, listener: F) -> ChangeSubscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut observers = self.observers.lock();
        observers.next_id += 1;
        let id = observers.next_id;
        observers.listeners.push((id, Arc::new(listener)));
        ChangeSubscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Registers a channel observer with room for `buffer` events. Events
    /// that do not fit are dropped for that observer.
    pub fn channel(&self, buffer: usize) -> mpsc::Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.observers.lock().channels.push(tx);
        rx
    }

    /// Delivers `events` in order to every observer.
    pub fn emit(&self, events: Vec<SyncEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = {
            let mut observers = self.observers.lock();
            observers.channels.retain(|tx| !tx.is_closed());
            for event in &events {
                for tx in &observers.channels {
                    if tx.try_send(event.clone()).is_err() {
                        tracing::debug!(?event, "observer channel full, event dropped");
                    }
                }
            }
            observers
                .listeners
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect()
        };
        for event in &events {
            for listener in &listeners {
                listener(event);
            }
        }
    }
}

/// Registration returned by [`Notifier::subscribe`].
#[derive(Debug)]
pub struct ChangeSubscription {
    id: u64,
    observers: Weak<Mutex<Observers>>,
}

impl ChangeSubscription {
    /// Stops delivery to this callback.
    pub fn unsubscribe(self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("listeners", &self.listeners.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}
