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

//! Integration tests for connection loss and recovery.
//!
//! A [`LoopbackBackend`] link is taken offline and brought back while other
//! sessions keep writing. After every recovery the core must refetch what
//! it missed, hold exactly one live subscription per desired topic, and
//! replay parked writes once.
//!
//! ## Disconnect simulation
//!
//! `set_online(false)` closes every subscription stream of the link and
//! fails every call with `Unavailable`. The supervisor notices through the
//! closed streams or its next probe, and reconnects through
//! `refresh_credentials` once the link is back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use ticketsync::backend::DataApi;
use ticketsync::backend::loopback::{LoopbackBackend, LoopbackServer};
use ticketsync::connection::{ConnectionStatus, EnvironmentSignal, SupervisorConfig};
use ticketsync::optimistic::MutationConfig;
use ticketsync::subscription::SubscriptionConfig;
use ticketsync::{Identity, SyncConfig, SyncCore};
use ticketsync_proto::ids::{CorrelationId, TicketId, UserId};
use ticketsync_proto::record::{
    Filter, NewMessage, NewRecord, NewTicket, Priority, Record, Role, Ticket,
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

fn boot(
    server: &LoopbackServer,
    user: &str,
    role: Role,
) -> (SyncCore<LoopbackBackend>, LoopbackBackend) {
    let link = server.connect(UserId::new(user));
    let identity = Identity {
        user_id: UserId::new(user),
        display_name: user.to_uppercase(),
        role,
    };
    let core = SyncCore::new(Arc::new(link.clone()), identity, fast_config());
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

fn is_connected(core: &SyncCore<LoopbackBackend>) -> bool {
    core.connection().status == ConnectionStatus::Connected
}

async fn ready(core: &SyncCore<LoopbackBackend>, link: &LoopbackBackend) {
    wait_until("connected", || is_connected(core)).await;
    wait_until("ticket list subscribed", || {
        link.live_subscriptions(&TopicKey::TicketList) == 1
    })
    .await;
    wait_until("ticket list fetched", || {
        link.fetch_count(&Filter::All) >= 1
    })
    .await;
}

/// Takes `link` offline and waits for the core to notice.
async fn go_offline(core: &SyncCore<LoopbackBackend>, link: &LoopbackBackend) {
    link.set_online(false);
    wait_until("disconnect noticed", || !is_connected(core)).await;
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

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn reconnect_refetches_missed_tickets() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    let fetches_before = link.fetch_count(&Filter::All);

    go_offline(&agent, &link).await;
    let missed = seed_ticket(&client_link, "Filed while the agent was away").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(agent.ticket(&missed.id).is_none());

    link.set_online(true);
    wait_until("reconnected", || is_connected(&agent)).await;
    wait_until("missed ticket fetched", || {
        agent.ticket(&missed.id).is_some()
    })
    .await;

    assert!(link.fetch_count(&Filter::All) > fetches_before);
    wait_until("one live ticket list subscription", || {
        link.live_subscriptions(&TopicKey::TicketList) == 1
    })
    .await;
    assert_eq!(link.live_subscriptions(&TopicKey::UnreadCounters), 1);

    agent.stop().await;
}

#[tokio::test]
async fn selected_ticket_messages_are_refetched_after_reconnect() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Overtime claim").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    agent.select_ticket(Some(ticket.id)).unwrap();
    wait_until("message topic subscribed", || {
        link.live_subscriptions(&TopicKey::Messages(ticket.id)) == 1
    })
    .await;

    go_offline(&agent, &link).await;
    post(&client_link, ticket.id, "Here are my timesheets").await;

    link.set_online(true);
    wait_until("missed message fetched", || {
        agent
            .messages(&ticket.id)
            .iter()
            .any(|m| m.message.body == "Here are my timesheets")
    })
    .await;
    wait_until("one live message subscription", || {
        link.live_subscriptions(&TopicKey::Messages(ticket.id)) == 1
    })
    .await;

    // Live again: a new message arrives through the stream.
    post(&client_link, ticket.id, "And the payslips").await;
    wait_until("live message", || agent.messages(&ticket.id).len() == 2).await;

    agent.stop().await;
}

#[tokio::test]
async fn message_sent_offline_is_replayed_once() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Visa appeal").await;

    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("ticket loaded", || agent.ticket(&ticket.id).is_some()).await;
    agent.select_ticket(Some(ticket.id)).unwrap();
    wait_until("message topic subscribed", || {
        link.live_subscriptions(&TopicKey::Messages(ticket.id)) == 1
    })
    .await;

    go_offline(&agent, &link).await;
    let submitted = agent.send_message(ticket.id, "hi").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let shown = agent.messages(&ticket.id);
    assert_eq!(shown.len(), 1);
    assert!(shown[0].pending);
    assert_eq!(agent.outbox_len(), 1);
    assert!(server.messages().is_empty());

    link.set_online(true);
    submitted.settled().await.unwrap();
    wait_until("message confirmed", || {
        agent.messages(&ticket.id).iter().all(|m| !m.pending)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.messages().len(), 1);
    assert_eq!(agent.messages(&ticket.id).len(), 1);
    assert_eq!(agent.outbox_len(), 0);

    agent.stop().await;
}

#[tokio::test]
async fn reconnect_attempts_never_overlap() {
    let server = LoopbackServer::new();
    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;

    link.delay_refresh(Some(Duration::from_millis(150)));
    go_offline(&agent, &link).await;
    wait_until("several attempts", || link.refresh_calls() >= 2).await;

    link.set_online(true);
    wait_until("reconnected", || is_connected(&agent)).await;
    assert_eq!(link.refresh_peak(), 1);

    agent.stop().await;
}

#[tokio::test]
async fn failing_refresh_keeps_retrying_until_it_succeeds() {
    let server = LoopbackServer::new();
    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;

    link.fail_refresh(true);
    go_offline(&agent, &link).await;
    link.set_online(true);
    let calls = link.refresh_calls();
    wait_until("retries", || link.refresh_calls() >= calls + 2).await;
    assert!(!is_connected(&agent));

    link.fail_refresh(false);
    wait_until("reconnected", || is_connected(&agent)).await;

    agent.stop().await;
}

#[tokio::test]
async fn long_disconnect_is_reported_as_degraded() {
    let server = LoopbackServer::new();
    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    assert!(!agent.is_degraded());

    go_offline(&agent, &link).await;
    wait_until("degraded", || agent.is_degraded()).await;
    assert!(agent.connection().disconnected_since.is_some());

    link.set_online(true);
    wait_until("reconnected", || is_connected(&agent)).await;
    assert!(!agent.is_degraded());
    assert!(agent.connection().disconnected_since.is_none());

    agent.stop().await;
}

#[tokio::test]
async fn environment_signals_drive_the_connection() {
    let server = LoopbackServer::new();
    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;

    agent.signal(EnvironmentSignal::Offline);
    assert_eq!(agent.connection().status, ConnectionStatus::Disconnected);

    agent.signal(EnvironmentSignal::Online);
    wait_until("reconnected", || is_connected(&agent)).await;
    wait_until("topics reopened", || {
        link.live_subscriptions(&TopicKey::TicketList) == 1
            && link.live_subscriptions(&TopicKey::Presence) == 1
    })
    .await;

    agent.stop().await;
}

#[tokio::test]
async fn failing_subscribes_recover_after_cooldown() {
    let server = LoopbackServer::new();
    let link = server.connect(UserId::new("agent-1"));
    link.fail_next_subscribes(5);
    let identity = Identity {
        user_id: UserId::new("agent-1"),
        display_name: "AGENT-1".into(),
        role: Role::Agent,
    };
    let agent = SyncCore::new(Arc::new(link.clone()), identity, fast_config());
    agent.start();

    wait_until("topics eventually live", || {
        link.live_subscriptions(&TopicKey::TicketList) == 1
            && link.live_subscriptions(&TopicKey::UnreadCounters) == 1
            && link.live_subscriptions(&TopicKey::Presence) == 1
    })
    .await;
    // Three session topics, five refused opens, then one success each.
    assert!(link.subscribe_calls() >= 8);

    agent.stop().await;
}

#[tokio::test]
async fn stop_releases_every_subscription() {
    let server = LoopbackServer::new();
    let (agent, link) = boot(&server, "agent-1", Role::Agent);
    ready(&agent, &link).await;
    wait_until("presence subscribed", || {
        link.live_subscriptions(&TopicKey::Presence) == 1
    })
    .await;

    agent.stop().await;
    assert_eq!(link.live_subscriptions(&TopicKey::TicketList), 0);
    assert_eq!(link.live_subscriptions(&TopicKey::UnreadCounters), 0);
    assert_eq!(link.live_subscriptions(&TopicKey::Presence), 0);
}
