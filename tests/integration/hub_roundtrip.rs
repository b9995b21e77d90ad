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

//! End-to-end tests: sync cores over [`HubBackend`] against an in-process
//! `ticketsync-hub`.
//!
//! Each test binds a hub on an ephemeral port, then runs a client and an
//! agent session through the real WebSocket transport. Dropping every hub
//! connection exercises the same reconnect path a network failure would.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use ticketsync::backend::hub::{HubBackend, HubConfig};
use ticketsync::connection::{ConnectionStatus, SupervisorConfig};
use ticketsync::optimistic::{MutationConfig, TicketDraft};
use ticketsync::subscription::SubscriptionConfig;
use ticketsync::{Identity, SyncConfig, SyncCore};
use ticketsync_hub::hub::{HubState, start_server_with_state};
use ticketsync_proto::ids::{TicketId, UserId};
use ticketsync_proto::record::Role;
use ticketsync_proto::topic::TopicKey;

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> SyncConfig {
    SyncConfig {
        supervisor: SupervisorConfig {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(500),
            refresh_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(100),
            degraded_grace: Duration::from_millis(300),
        },
        subscriptions: SubscriptionConfig {
            open_timeout: Duration::from_secs(1),
            max_open_attempts: 3,
            cooldown: Duration::from_millis(300),
            retry_delay: Duration::from_millis(100),
        },
        mutations: MutationConfig {
            write_timeout: Duration::from_secs(1),
            safety_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(200),
        },
        heartbeat_interval: Duration::from_millis(300),
        ..SyncConfig::default()
    }
}

async fn start_hub(state: Arc<HubState>) -> String {
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state).await.unwrap();
    format!("ws://{addr}/ws")
}

fn session(url: &str, user: &str, role: Role, token: Option<&str>) -> SyncCore<HubBackend> {
    let backend = HubBackend::new(HubConfig {
        url: url.to_string(),
        user_id: UserId::new(user),
        token: token.map(str::to_string),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..HubConfig::default()
    });
    let identity = Identity {
        user_id: UserId::new(user),
        display_name: user.to_uppercase(),
        role,
    };
    let core = SyncCore::new(Arc::new(backend), identity, fast_config());
    core.start();
    core
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_subscribers(state: &HubState, topic: &TopicKey, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if state.subscriber_count(topic).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {count} subscribers on {topic}");
}

fn is_connected(core: &SyncCore<HubBackend>) -> bool {
    core.connection().status == ConnectionStatus::Connected
}

/// Starts a client and an agent, has the client open a ticket and the agent
/// select it.
async fn desk(state: &Arc<HubState>) -> (SyncCore<HubBackend>, SyncCore<HubBackend>, TicketId) {
    let url = start_hub(Arc::clone(state)).await;
    let client = session(&url, "client-1", Role::Client, None);
    let agent = session(&url, "agent-1", Role::Agent, None);
    wait_until("both connected", || {
        is_connected(&client) && is_connected(&agent)
    })
    .await;
    wait_for_subscribers(state, &TopicKey::TicketList, 2).await;
    wait_for_subscribers(state, &TopicKey::UnreadCounters, 2).await;

    client
        .create_ticket(TicketDraft::titled("Unfair dismissal"))
        .unwrap()
        .settled()
        .await
        .unwrap();
    let id = client.tickets()[0].ticket.id;
    wait_until("agent sees ticket", || agent.ticket(&id).is_some()).await;

    agent.select_ticket(Some(id)).unwrap();
    wait_for_subscribers(state, &TopicKey::Messages(id), 1).await;
    (client, agent, id)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn client_and_agent_talk_through_the_hub() {
    let state = Arc::new(HubState::new());
    let (client, agent, id) = desk(&state).await;

    agent
        .send_message(id, "We have your file")
        .unwrap()
        .settled()
        .await
        .unwrap();
    wait_until("client counts it unread", || client.unread_count(&id) == 1).await;
    assert_eq!(agent.messages(&id).len(), 1);
    assert!(!agent.messages(&id)[0].pending);

    client.select_ticket(Some(id)).unwrap();
    wait_until("client sees the message", || {
        client
            .messages(&id)
            .iter()
            .any(|m| m.message.body == "We have your file")
    })
    .await;
    wait_until("client read it", || client.unread_count(&id) == 0).await;

    wait_until("agent listed as online", || {
        client
            .online_staff()
            .iter()
            .any(|e| e.user_id == UserId::new("agent-1"))
    })
    .await;

    client.stop().await;
    agent.stop().await;
}

#[tokio::test]
async fn sessions_recover_after_the_hub_drops_them() {
    let state = Arc::new(HubState::new());
    let (client, agent, id) = desk(&state).await;

    state.close_all_connections().await;
    let submitted = client.send_message(id, "Are you still there?").unwrap();
    submitted.settled().await.unwrap();

    wait_until("agent receives it", || {
        agent
            .messages(&id)
            .iter()
            .any(|m| m.message.body == "Are you still there?")
    })
    .await;
    wait_until("both reconnected", || {
        is_connected(&client) && is_connected(&agent)
    })
    .await;
    wait_for_subscribers(&state, &TopicKey::Messages(id), 1).await;

    // Live again: a reply travels over the new sockets.
    agent
        .send_message(id, "Yes, reviewing now")
        .unwrap()
        .settled()
        .await
        .unwrap();
    wait_until("client counts the reply", || client.unread_count(&id) >= 1).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let bodies: Vec<String> = agent
        .messages(&id)
        .into_iter()
        .map(|m| m.message.body)
        .collect();
    assert_eq!(bodies, vec!["Are you still there?", "Yes, reviewing now"]);

    client.stop().await;
    agent.stop().await;
}

#[tokio::test]
async fn refused_session_never_connects() {
    let hub_config = ticketsync_hub::config::HubConfig {
        access_token: Some("desk".into()),
        ..ticketsync_hub::config::HubConfig::default()
    };
    let state = Arc::new(HubState::with_config(&hub_config));
    let url = start_hub(Arc::clone(&state)).await;

    let intruder = session(&url, "client-9", Role::Client, Some("guess"));
    let member = session(&url, "client-1", Role::Client, Some("desk"));

    wait_until("member connected", || is_connected(&member)).await;
    wait_until("intruder degraded", || intruder.is_degraded()).await;
    assert!(!is_connected(&intruder));
    assert_eq!(state.connection_count().await, 1);

    intruder.stop().await;
    member.stop().await;
}
