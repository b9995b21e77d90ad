//! Bookkeeping for optimistic mutations.
//!
//! The [`MutationLedger`] validates a [`Mutation`], turns it into a
//! provisional record plus the write that will confirm it, and tracks the
//! mutation until it settles. A mutation settles exactly once, by whichever
//! comes first: the write response, a confirming inbound event, or the
//! safety timer. Writes that cannot be sent right now are parked in an
//! outbox and replayed later with the same correlation id.
//!
//! The ledger owns no tasks of its own; the core spawns the write and the
//! timer and hands their handles over so the loser of the race can be
//! aborted.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use ticketsync_proto::ids::{CorrelationId, LocalId, MessageId, TicketId, Timestamp, UserId};
use ticketsync_proto::record::{
    ChatMessage, MAX_MESSAGE_BODY, MAX_TICKET_TITLE, NewMessage, NewRecord, NewTicket, Patch,
    Priority, RecordId, Ticket, TicketPatch, TicketStatus,
};

use crate::backend::BackendError;
use crate::merge::Optimistic;

/// Timeouts applied to every mutation.
#[derive(Debug, Clone, Copy)]
pub struct MutationConfig {
    /// Bound on a single write call.
    pub write_timeout: Duration,
    /// A mutation still pending after this long is rolled back.
    pub safety_timeout: Duration,
    /// Delay before replaying writes parked after a transient failure.
    pub retry_delay: Duration,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            safety_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Input for a new ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketDraft {
    /// Short summary. Must not be blank.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Urgency.
    pub priority: Priority,
    /// Practice area.
    pub category: Option<String>,
}

impl TicketDraft {
    /// A draft with just a title, normal priority and no category.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: Priority::Normal,
            category: None,
        }
    }
}

/// A user-initiated change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Post a chat message.
    SendMessage {
        /// Target ticket.
        ticket_id: TicketId,
        /// Message text.
        body: String,
    },
    /// Open a ticket.
    CreateTicket(TicketDraft),
    /// Change ticket fields.
    PatchTicket {
        /// Target ticket.
        ticket_id: TicketId,
        /// The change.
        patch: TicketPatch,
    },
}

/// Why a mutation did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    /// The input was refused before any local change.
    #[error("invalid mutation: {0}")]
    Validation(String),

    /// The backing service refused or could not perform the write.
    #[error("write failed: {0}")]
    Write(#[from] BackendError),

    /// No confirmation arrived before the safety timeout.
    #[error("no confirmation before the safety timeout")]
    TimedOut,

    /// The core stopped before the mutation settled.
    #[error("mutation cancelled")]
    Cancelled,
}

/// What to hand back to the user after a failed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreInput {
    /// The text of an unsent message, for the compose box.
    ComposeText {
        /// The ticket it was meant for.
        ticket_id: TicketId,
        /// The text.
        body: String,
    },
    /// The draft of a ticket that was not created.
    TicketDraft(TicketDraft),
    /// A change that was not applied.
    Patch {
        /// The ticket.
        ticket_id: TicketId,
        /// The change.
        patch: TicketPatch,
    },
}

/// A failed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationFailure {
    /// The cause.
    pub error: MutationError,
    /// The user's input.
    pub restore: RestoreInput,
}

/// The external write that confirms a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    /// Create a record.
    Insert(NewRecord),
    /// Patch a record.
    Update {
        /// Target.
        id: RecordId,
        /// The change.
        patch: Patch,
    },
}

/// A validated mutation, ready to be applied locally and written.
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Local key of the provisional record.
    pub local_id: LocalId,
    /// Correlation id carried by the write.
    pub correlation_id: CorrelationId,
    /// The provisional record.
    pub optimistic: Optimistic,
    /// The write.
    pub write: PendingWrite,
    /// Input to restore on failure.
    pub restore: RestoreInput,
}

/// Handle returned to the caller of a mutation.
#[derive(Debug)]
pub struct Submitted {
    /// Local key of the provisional record.
    pub local_id: LocalId,
    /// Correlation id carried by the write.
    pub correlation_id: CorrelationId,
    restore: RestoreInput,
    outcome: oneshot::Receiver<Result<(), MutationFailure>>,
}

impl Submitted {
    /// Waits until the mutation is confirmed or rolled back.
    ///
    /// # Errors
    ///
    /// Returns the failure, with the input to restore, if the mutation was
    /// rolled back or cancelled.
    pub async fn settled(self) -> Result<(), MutationFailure> {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(MutationFailure {
                error: MutationError::Cancelled,
                restore: self.restore,
            }),
        }
    }
}

/// Who settled a mutation. Handles owned by the settler are left running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledBy {
    /// The write response.
    Write,
    /// The safety timer.
    Timer,
    /// An inbound event or resync.
    Event,
}

struct Entry {
    correlation_id: CorrelationId,
    write: PendingWrite,
    restore: RestoreInput,
    outcome: Option<oneshot::Sender<Result<(), MutationFailure>>>,
    timer: Option<JoinHandle<()>>,
    task: Option<JoinHandle<()>>,
    parked: bool,
}

impl Entry {
    fn abort(&mut self, by: SettledBy) {
        if by != SettledBy::Timer
            && let Some(timer) = self.timer.take()
        {
            timer.abort();
        }
        if by != SettledBy::Write
            && let Some(task) = self.task.take()
        {
            task.abort();
        }
    }
}

/// Pending mutations and the outbox.
#[derive(Default)]
pub struct MutationLedger {
    next_local: u64,
    entries: HashMap<LocalId, Entry>,
    outbox: VecDeque<LocalId>,
}

impl std::fmt::Debug for MutationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationLedger")
            .field("pending", &self.entries.len())
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl MutationLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `mutation` and builds its provisional record and write.
    ///
    /// Nothing is tracked until [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Validation`] for blank or oversized input
    /// and for patches that change nothing.
    pub fn prepare(
        &mut self,
        mutation: Mutation,
        author: &UserId,
        author_name: &str,
        now: Timestamp,
    ) -> Result<Prepared, MutationError> {
        validate(&mutation)?;
        self.next_local += 1;
        let local_id = LocalId::from_raw(self.next_local);
        let correlation_id = CorrelationId::new();

        let prepared = match mutation {
            Mutation::SendMessage { ticket_id, body } => Prepared {
                local_id,
                correlation_id,
                optimistic: Optimistic::Message {
                    local_id,
                    message: ChatMessage {
                        id: MessageId::from_uuid(Uuid::nil()),
                        ticket_id,
                        author_id: author.clone(),
                        author_name: author_name.to_string(),
                        body: body.clone(),
                        created_at: now,
                        read_at: None,
                        correlation_id: Some(correlation_id),
                    },
                },
                write: PendingWrite::Insert(NewRecord::Message(NewMessage {
                    ticket_id,
                    author_id: author.clone(),
                    author_name: author_name.to_string(),
                    body: body.clone(),
                    correlation_id,
                })),
                restore: RestoreInput::ComposeText { ticket_id, body },
            },
            Mutation::CreateTicket(draft) => Prepared {
                local_id,
                correlation_id,
                optimistic: Optimistic::Ticket {
                    local_id,
                    ticket: Ticket {
                        id: TicketId::from_uuid(Uuid::nil()),
                        title: draft.title.clone(),
                        description: draft.description.clone(),
                        status: TicketStatus::Open,
                        priority: draft.priority,
                        category: draft.category.clone(),
                        requester_id: author.clone(),
                        assignee_id: None,
                        created_at: now,
                        updated_at: now,
                        last_correlation_id: Some(correlation_id),
                    },
                },
                write: PendingWrite::Insert(NewRecord::Ticket(NewTicket {
                    title: draft.title.clone(),
                    description: draft.description.clone(),
                    priority: draft.priority,
                    category: draft.category.clone(),
                    requester_id: author.clone(),
                    correlation_id,
                })),
                restore: RestoreInput::TicketDraft(draft),
            },
            Mutation::PatchTicket { ticket_id, patch } => Prepared {
                local_id,
                correlation_id,
                optimistic: Optimistic::Patch {
                    local_id,
                    ticket_id,
                    correlation_id,
                    patch: patch.clone(),
                },
                write: PendingWrite::Update {
                    id: RecordId::Ticket(ticket_id),
                    patch: Patch::Ticket {
                        patch: patch.clone(),
                        correlation_id,
                    },
                },
                restore: RestoreInput::Patch { ticket_id, patch },
            },
        };
        Ok(prepared)
    }

    /// Starts tracking a prepared mutation.
    pub fn register(&mut self, prepared: &Prepared) -> Submitted {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            prepared.local_id,
            Entry {
                correlation_id: prepared.correlation_id,
                write: prepared.write.clone(),
                restore: prepared.restore.clone(),
                outcome: Some(tx),
                timer: None,
                task: None,
                parked: false,
            },
        );
        Submitted {
            local_id: prepared.local_id,
            correlation_id: prepared.correlation_id,
            restore: prepared.restore.clone(),
            outcome: rx,
        }
    }

    /// Hands over the safety timer. Aborted at once if the mutation already
    /// settled.
    pub fn attach_timer(&mut self, local_id: LocalId, timer: JoinHandle<()>) {
        match self.entries.get_mut(&local_id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Hands over the write task. Aborted at once if the mutation already
    /// settled.
    pub fn attach_task(&mut self, local_id: LocalId, task: JoinHandle<()>) {
        match self.entries.get_mut(&local_id) {
            Some(entry) => entry.task = Some(task),
            None => task.abort(),
        }
    }

    /// Parks the write of `local_id` in the outbox. Returns `false` if the
    /// mutation is not pending or already parked.
    pub fn park(&mut self, local_id: LocalId) -> bool {
        let Some(entry) = self.entries.get_mut(&local_id) else {
            return false;
        };
        if entry.parked {
            return false;
        }
        entry.parked = true;
        entry.task = None;
        self.outbox.push_back(local_id);
        tracing::info!(%local_id, outbox_len = self.outbox.len(), "write parked for replay");
        true
    }

    /// Drains the outbox, oldest first, skipping mutations that settled
    /// while parked.
    pub fn take_outbox(&mut self) -> Vec<(LocalId, PendingWrite)> {
        let mut out = Vec::with_capacity(self.outbox.len());
        while let Some(local_id) = self.outbox.pop_front() {
            if let Some(entry) = self.entries.get_mut(&local_id) {
                entry.parked = false;
                out.push((local_id, entry.write.clone()));
            }
        }
        out
    }

    /// Settles `local_id` with `result` and stops the handles not owned by
    /// `by`. Returns the input to restore, or `None` if the mutation had
    /// already settled.
    pub fn settle(
        &mut self,
        local_id: LocalId,
        result: Result<(), MutationError>,
        by: SettledBy,
    ) -> Option<RestoreInput> {
        let mut entry = self.entries.remove(&local_id)?;
        entry.abort(by);
        if entry.parked {
            self.outbox.retain(|id| *id != local_id);
        }
        let restore = entry.restore;
        if let Some(tx) = entry.outcome.take() {
            let outcome = result.map_err(|error| MutationFailure {
                error,
                restore: restore.clone(),
            });
            let _ = tx.send(outcome);
        }
        Some(restore)
    }

    /// Drops every pending mutation; their handles resolve as cancelled.
    /// Returns their local keys.
    pub fn cancel_all(&mut self) -> Vec<LocalId> {
        self.outbox.clear();
        self.entries
            .drain()
            .map(|(local_id, mut entry)| {
                entry.abort(SettledBy::Event);
                local_id
            })
            .collect()
    }

    /// Whether `local_id` is still pending.
    #[must_use]
    pub fn is_pending(&self, local_id: LocalId) -> bool {
        self.entries.contains_key(&local_id)
    }

    /// Correlation id of a pending mutation.
    #[must_use]
    pub fn correlation_id(&self, local_id: LocalId) -> Option<CorrelationId> {
        self.entries.get(&local_id).map(|e| e.correlation_id)
    }

    /// Number of pending mutations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of parked writes.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }
}

fn validate(mutation: &Mutation) -> Result<(), MutationError> {
    match mutation {
        Mutation::SendMessage { body, .. } => {
            if body.trim().is_empty() {
                return Err(MutationError::Validation("message body is empty".into()));
            }
            if body.len() > MAX_MESSAGE_BODY {
                return Err(MutationError::Validation(format!(
                    "message body is {} bytes (max {MAX_MESSAGE_BODY})",
                    body.len()
                )));
            }
        }
        Mutation::CreateTicket(draft) => validate_title(&draft.title)?,
        Mutation::PatchTicket { patch, .. } => {
            if patch.is_empty() {
                return Err(MutationError::Validation("patch changes nothing".into()));
            }
            if let Some(title) = &patch.title {
                validate_title(title)?;
            }
        }
    }
    Ok(())
}

fn validate_title(title: &str) -> Result<(), MutationError> {
    if title.trim().is_empty() {
        return Err(MutationError::Validation("ticket title is empty".into()));
    }
    if title.chars().count() > MAX_TICKET_TITLE {
        return Err(MutationError::Validation(format!(
            "ticket title is longer than {MAX_TICKET_TITLE} characters"
        )));
    }
    Ok(())
}
