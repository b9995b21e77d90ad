// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for optimistic mutations and their reconciliation.
//!
//! Every test runs one or more [`SyncCore`]s against a shared
//! [`LoopbackServer`]. A local change must show up at once as pending, end
//! up as exactly one confirmed record, and roll back cleanly when the
//! server refuses it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use ticketsync::backend::DataApi;
use ticketsync::backend::loopback::{LoopbackBackend, LoopbackServer};
use ticketsync::connection::{ConnectionStatus, SupervisorConfig};
use ticketsync::optimistic::{MutationConfig, MutationError, RestoreInput, TicketDraft};
use ticketsync::subscription::SubscriptionConfig;
use ticketsync::{Identity, SyncConfig, SyncCore, SyncEvent};
use ticketsync_proto::ids::{CorrelationId, TicketId, UserId};
use ticketsync_proto::record::{
    Filter, NewMessage, NewRecord, NewTicket, Priority, Record, RecordId, Role, Ticket,
    TicketPatch, TicketStatus,
};
use ticketsync_proto::topic::TopicKey;

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> SyncConfig {
    SyncConfig {
        supervisor: SupervisorConfig {
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(100),
            refresh_timeout: Duration::from_millis(300),
            retry_delay: Duration::from_millis(50),
            degraded_grace: Duration::from_millis(200),
        },
        subscriptions: SubscriptionConfig {
            open_timeout: Duration::from_millis(300),
            max_open_attempts: 3,
            cooldown: Duration::from_millis(200),
            retry_delay: Duration::from_millis(50),
        },
        mutations: MutationConfig {
            write_timeout: Duration::from_millis(500),
            safety_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(100),
        },
        heartbeat_interval: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

fn identity(user: &str, role: Role) -> Identity {
    Identity {
        user_id: UserId::new(user),
        display_name: user.to_uppercase(),
        role,
    }
}

fn boot(
    server: &LoopbackServer,
    user: &str,
    role: Role,
) -> (SyncCore<LoopbackBackend>, LoopbackBackend) {
    boot_with(server, user, role, fast_config())
}

fn boot_with(
    server: &LoopbackServer,
    user: &str,
    role: Role,
    config: SyncConfig,
) -> (SyncCore<LoopbackBackend>, LoopbackBackend) {
    let link = server.connect(UserId::new(user));
    let core = SyncCore::new(Arc::new(link.clone()), identity(user, role), config);
    core.start();
    (core, link)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Waits until `core` is connected and its ticket list has been fetched.
async fn ready(core: &SyncCore<LoopbackBackend>, link: &LoopbackBackend) {
    wait_until("connected", || {
        core.connection().status == ConnectionStatus::Connected
    })
    .await;
    wait_until("ticket list subscribed", || {
        link.live_subscriptions(&TopicKey::TicketList) == 1
    })
    .await;
    wait_until("ticket list fetched", || {
        link.fetches()
            .iter()
            .any(|(_, f)| matches!(f, Filter::All | Filter::RequestedBy(_)))
    })
    .await;
}

/// Selects `ticket` and waits for its message topic to be live and fetched.
async fn open(core: &SyncCore<LoopbackBackend>, link: &LoopbackBackend, ticket: TicketId) {
    core.select_ticket(Some(ticket)).unwrap();
    wait_until("message topic subscribed", || {
        link.live_subscriptions(&TopicKey::Messages(ticket)) == 1
    })
    .await;
    wait_until("messages fetched", || {
        link.fetch_count(&Filter::MessagesOf(ticket)) >= 1
    })
    .await;
}

async fn seed_ticket(link: &LoopbackBackend, title: &str) -> Ticket {
    let record = link
        .insert(NewRecord::Ticket(NewTicket {
            title: title.into(),
            description: String::new(),
            priority: Priority::Normal,
            category: None,
            requester_id: link.user().clone(),
            correlation_id: CorrelationId::new(),
        }))
        .await
        .unwrap();
    match record {
        Record::Ticket(t) => t,
        Record::Message(_) => panic!("expected a ticket"),
    }
}

async fn post(link: &LoopbackBackend, ticket: TicketId, body: &str) {
    link.insert(NewRecord::Message(NewMessage {
        ticket_id: ticket,
        author_id: link.user().clone(),
        author_name: link.user().to_string(),
        body: body.into(),
        correlation_id: CorrelationId::new(),
    }))
    .await
    .unwrap();
}

fn collect_events(core: &SyncCore<LoopbackBackend>) -> Arc<Mutex<Vec<SyncEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    // Kept for the whole test; dropping the subscription does not unregister.
    let _subscription = core.on_change(move |event| sink.lock().push(event.clone()));
    seen
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn sent_message_is_confirmed_exactly_once() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Unpaid wages").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    open(&agent, &link, ticket.id).await;

    let submitted = agent

        .send_message(ticket.id, "We will review it today")

        .unwrap();
    let shown = agent.messages(&ticket.id);
    assert_eq!(shown.len(), 1);
    assert!(shown[0].pending);
    assert_eq!(shown[0].key.local_id(), Some(submitted.local_id));
    assert_eq!(shown[0].message.author_name, "AGENT-1");

    submitted.settled().await.unwrap();
    wait_until("message confirmed", || {
        agent.messages(&ticket.id).iter().all(|m| !m.pending)
    })
    .await;

    // Let the realtime echo of the insert arrive as well.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let shown = agent.messages(&ticket.id);
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].message.body, "We will review it today");
    assert_eq!(server.messages().len(), 1);
    assert_eq!(agent.pending_mutations(), 0);

    agent.stop().await;
}

#[tokio::test]
async fn duplicate_delivery_is_applied_once() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Custody hearing").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    open(&agent, &link, ticket.id).await;

    server.set_duplicate_delivery(true);
    post(&client_link, ticket.id, "Is the hearing on Monday?").await;
    post(&client_link, ticket.id, "I can bring the documents").await;

    wait_until("both messages shown", || {
        agent.messages(&ticket.id).len() >= 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bodies: Vec<String> = agent
        .messages(&ticket.id)
        .into_iter()
        .map(|m| m.message.body)
        .collect();
    assert_eq!(
        bodies,
        vec!["Is the hearing on Monday?", "I can bring the documents"]
    );

    agent.stop().await;
}

#[tokio::test]
async fn rejected_message_rolls_back_and_returns_text() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Eviction notice").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    open(&agent, &link, ticket.id).await;
    let seen = collect_events(&agent);

    link.reject_next_writes(1);
    let submitted = agent
        .send_message(ticket.id, "Please send the notice")
        .unwrap();
    let local_id = submitted.local_id;
    assert_eq!(agent.messages(&ticket.id).len(), 1);

    let failure = submitted.settled().await.unwrap_err();
    assert!(matches!(failure.error, MutationError::Write(_)));
    assert_eq!(
        failure.restore,
        RestoreInput::ComposeText {
            ticket_id: ticket.id,
            body: "Please send the notice".into(),
        }
    );
    assert!(agent.messages(&ticket.id).is_empty());
    assert!(server.messages().is_empty());
    assert!(seen.lock().iter().any(
        |e| matches!(e, SyncEvent::MutationFailed { local_id: id, .. } if *id == local_id)
    ));

    agent.stop().await;
}

#[tokio::test]
async fn created_ticket_takes_the_server_identity() {
    let server = LoopbackServer::new();
    let (client, link) = boot(&server, "client-1", Role::Client);
    ready(&client, &link).await;

    let submitted = client
        .create_ticket(TicketDraft::titled("Employment contract review"))
        .unwrap();
    let tickets = client.tickets();
    assert_eq!(tickets.len(), 1);
    assert!(tickets[0].pending);

    submitted.settled().await.unwrap();
    wait_until("ticket confirmed", || {
        client.tickets().iter().all(|t| !t.pending)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = server.tickets();
    assert_eq!(stored.len(), 1);
    let tickets = client.tickets();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].ticket.id, stored[0].id);
    assert_eq!(tickets[0].ticket.requester_id, UserId::new("client-1"));
    assert!(client.ticket(&stored[0].id).is_some());

    client.stop().await;
}

#[tokio::test]
async fn status_change_is_visible_to_other_sessions() {
    let server = LoopbackServer::new();
    let (client, client_link) = boot(&server, "client-1", Role::Client);
    let (agent, agent_link) = boot(&server, "agent-1", Role::Agent);
    ready(&client, &client_link).await;
    ready(&agent, &agent_link).await;

    client
        .create_ticket(TicketDraft::titled("Divorce settlement"))
        .unwrap()
        .settled()
        .await
        .unwrap();
    let id = server.tickets()[0].id;
    wait_until("agent sees ticket", || agent.ticket(&id).is_some()).await;

    let patch = TicketPatch {
        status: Some(TicketStatus::InProgress),
        ..TicketPatch::default()
    };
    let submitted = agent.mutate_ticket(id, patch).unwrap();
    let shown = agent.tickets();
    assert_eq!(shown[0].ticket.status, TicketStatus::InProgress);
    assert!(shown[0].pending);

    submitted.settled().await.unwrap();
    assert_eq!(agent.ticket(&id).unwrap().status, TicketStatus::InProgress);
    wait_until("client sees status", || {
        client
            .ticket(&id)
            .is_some_and(|t| t.status == TicketStatus::InProgress)
    })
    .await;

    agent.stop().await;
    client.stop().await;
}

#[tokio::test]
async fn lost_write_response_is_replayed_without_duplicate() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Tenancy deposit").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    open(&agent, &link, ticket.id).await;

    link.lose_next_responses(1);
    let submitted = agent
        .send_message(ticket.id, "Deposit claim drafted")
        .unwrap();
    submitted.settled().await.unwrap();

    wait_until("outbox drained", || agent.outbox_len() == 0).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(server.messages().len(), 1);
    let shown = agent.messages(&ticket.id);
    assert_eq!(shown.len(), 1);
    assert!(!shown[0].pending);

    agent.stop().await;
}

#[tokio::test]
async fn stop_cancels_pending_mutations() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Inheritance dispute").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    open(&agent, &link, ticket.id).await;

    link.delay_responses(Some(Duration::from_secs(2)));
    let submitted = agent.send_message(ticket.id, "Checking the will").unwrap();
    agent.stop().await;

    let failure = submitted.settled().await.unwrap_err();
    assert_eq!(failure.error, MutationError::Cancelled);
    assert!(agent.messages(&ticket.id).is_empty());
}

#[tokio::test]
async fn unconfirmed_message_times_out_and_rolls_back() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Unpaid invoice").await;

    let mut config = fast_config();
    config.mutations.safety_timeout = Duration::from_millis(600);
    let (agent, link) = boot_with(&server, "agent-1", Role::Agent, config);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    open(&agent, &link, ticket.id).await;
    let seen = collect_events(&agent);

    link.set_online(false);
    let started = Instant::now();
    let submitted = agent
        .send_message(ticket.id, "Sending the invoice copy")
        .unwrap();
    let local_id = submitted.local_id;
    assert_eq!(agent.messages(&ticket.id).len(), 1);

    let failure = submitted.settled().await.unwrap_err();
    assert_eq!(failure.error, MutationError::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(agent.messages(&ticket.id).is_empty());
    assert_eq!(agent.pending_mutations(), 0);

    let restored = seen.lock().iter().find_map(|e| match e {
        SyncEvent::MutationFailed {
            local_id: id,
            restore,
            ..
        } if *id == local_id => Some(restore.clone()),
        _ => None,
    });
    assert_eq!(
        restored,
        Some(RestoreInput::ComposeText {
            ticket_id: ticket.id,
            body: "Sending the invoice copy".into(),
        })
    );

    // The parked write must not resurface once the link comes back.
    link.set_online(true);
    wait_until("reconnected", || {
        agent.connection().status == ConnectionStatus::Connected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.messages().is_empty());
    assert!(agent.messages(&ticket.id).is_empty());

    agent.stop().await;
}

#[tokio::test]
async fn deleting_the_selected_ticket_closes_it() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Withdrawn complaint").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    open(&agent, &link, ticket.id).await;
    wait_until("typing topic subscribed", || {
        link.live_subscriptions(&TopicKey::Typing(ticket.id)) == 1
    })
    .await;
    let seen = collect_events(&agent);

    client_link
        .delete(RecordId::Ticket(ticket.id))
        .await
        .unwrap();

    let closed = SyncEvent::SelectionClosed {
        ticket_id: ticket.id,
    };
    wait_until("selection closed", || seen.lock().contains(&closed)).await;
    assert_eq!(agent.selected(), None);
    assert!(agent.ticket(&ticket.id).is_none());
    wait_until("ticket topics released", || {
        link.live_subscriptions(&TopicKey::Messages(ticket.id)) == 0
            && link.live_subscriptions(&TopicKey::Typing(ticket.id)) == 0
    })
    .await;

    agent.stop().await;
}
