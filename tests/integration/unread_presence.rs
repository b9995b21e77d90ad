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

//! Integration tests for unread counters, staff presence and typing.
//!
//! Several sessions share one [`LoopbackServer`]: clients who open tickets
//! and staff who answer them. Counters, the online staff list and typing
//! indicators must agree across sessions once the events have propagated.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use ticketsync::backend::DataApi;
use ticketsync::backend::loopback::{LoopbackBackend, LoopbackServer};
use ticketsync::connection::{ConnectionStatus, SupervisorConfig};
use ticketsync::optimistic::MutationConfig;
use ticketsync::subscription::SubscriptionConfig;
use ticketsync::{Identity, SyncConfig, SyncCore, SyncError, SyncEvent};
use ticketsync_proto::event::ChangeEvent;
use ticketsync_proto::ids::{CorrelationId, MessageId, TicketId, Timestamp, UserId};
use ticketsync_proto::record::{
    ChatMessage, Filter, NewMessage, NewRecord, NewTicket, Priority, Record, Role, Ticket,
    TicketStatus,
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
        typing_lease: Duration::from_millis(300),
        typing_throttle: Duration::from_millis(50),
        typing_prune_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

struct Session {
    core: SyncCore<LoopbackBackend>,
    link: LoopbackBackend,
}

impl Session {
    /// Starts a core for `user` and waits until its session-wide state
    /// has been fetched.
    async fn start(server: &LoopbackServer, user: &str, role: Role) -> Self {
        let link = server.connect(UserId::new(user));
        let identity = Identity {
            user_id: UserId::new(user),
            display_name: user.to_uppercase(),
            role,
        };
        let core = SyncCore::new(Arc::new(link.clone()), identity, fast_config());
        core.start();

        let me = UserId::new(user);
        let (list, unread) = if role.is_staff() {
            (
                Filter::All,
                Filter::Unread {
                    reader: me,
                    requester: None,
                },
            )
        } else {
            (
                Filter::RequestedBy(me.clone()),
                Filter::Unread {
                    reader: me.clone(),
                    requester: Some(me),
                },
            )
        };
        wait_until("connected", || {
            core.connection().status == ConnectionStatus::Connected
        })
        .await;
        wait_until("session state fetched", || {
            link.fetch_count(&list) >= 1 && link.fetch_count(&unread) >= 1
        })
        .await;
        wait_until("unread topic subscribed", || {
            link.live_subscriptions(&TopicKey::UnreadCounters) == 1
        })
        .await;
        // Let the fetched snapshots land before anything new is written.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self { core, link }
    }

    async fn open(&self, ticket: TicketId) {
        wait_until("ticket loaded", || self.core.ticket(&ticket).is_some()).await;
        self.core.select_ticket(Some(ticket)).unwrap();
        wait_until("ticket topics subscribed", || {
            self.link.live_subscriptions(&TopicKey::Messages(ticket)) == 1
                && self.link.live_subscriptions(&TopicKey::Typing(ticket)) == 1
        })
        .await;
    }

    async fn stop(&self) {
        self.core.stop().await;
    }
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

fn ticket_for(requester: &str, title: &str) -> Ticket {
    let now = Timestamp::now();
    Ticket {
        id: TicketId::new(),
        title: title.into(),
        description: String::new(),
        status: TicketStatus::Open,
        priority: Priority::Normal,
        category: None,
        requester_id: UserId::new(requester),
        assignee_id: None,
        created_at: now,
        updated_at: now,
        last_correlation_id: None,
    }
}

fn message_on(ticket: TicketId, author: &str, body: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(),
        ticket_id: ticket,
        author_id: UserId::new(author),
        author_name: author.to_uppercase(),
        body: body.into(),
        created_at: Timestamp::now(),
        read_at: None,
        correlation_id: None,
    }
}

fn staff_names(core: &SyncCore<LoopbackBackend>) -> Vec<String> {
    core.online_staff().into_iter().map(|e| e.name).collect()
}

// =============================================================================
// Unread counters
// =============================================================================

#[tokio::test]
async fn open_ticket_is_not_counted_unread() {
    let server = LoopbackServer::new();
    let ticket = seed_ticket(&server.connect(UserId::new("client-1")), "Wrongful dismissal").await;

    let reading = Session::start(&server, "agent-1", Role::Agent).await;
    let client = Session::start(&server, "client-1", Role::Client).await;
    let elsewhere = Session::start(&server, "agent-2", Role::Agent).await;
    reading.open(ticket.id).await;

    client
        .core
        .send_message(ticket.id, "hello")
        .unwrap()
        .settled()
        .await
        .unwrap();

    wait_until("counted on the other agent", || {
        elsewhere.core.unread_count(&ticket.id) == 1
    })
    .await;
    wait_until("shown on the open ticket", || {
        reading
            .core
            .messages(&ticket.id)
            .iter()
            .any(|m| m.message.body == "hello")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(reading.core.unread_count(&ticket.id), 0);
    assert_eq!(client.core.unread_count(&ticket.id), 0);
    assert_eq!(elsewhere.core.unread_count(&ticket.id), 1);
    assert_eq!(elsewhere.core.total_unread(), 1);

    reading.stop().await;
    client.stop().await;
    elsewhere.stop().await;
}

#[tokio::test]
async fn mark_read_clears_and_persists() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Landlord repairs").await;

    let agent = Session::start(&server, "agent-1", Role::Agent).await;
    for body in ["The heating is broken", "It has been three weeks", "Photos attached"] {
        post(&client_link, ticket.id, body).await;
    }
    wait_until("three unread", || agent.core.unread_count(&ticket.id) == 3).await;
    assert_eq!(agent.core.total_unread(), 3);

    agent.core.mark_read(ticket.id).await.unwrap();
    assert_eq!(agent.core.unread_count(&ticket.id), 0);
    agent.stop().await;

    // A fresh session for the same user starts from the server's read state.
    let again = Session::start(&server, "agent-1", Role::Agent).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(again.core.unread_count(&ticket.id), 0);
    again.stop().await;
}

#[tokio::test]
async fn failed_mark_read_restores_the_count() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Debt collection letter").await;

    let agent = Session::start(&server, "agent-1", Role::Agent).await;
    post(&client_link, ticket.id, "They call every day").await;
    post(&client_link, ticket.id, "Is that legal?").await;
    wait_until("two unread", || agent.core.unread_count(&ticket.id) == 2).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = agent.core.on_change(move |e| sink.lock().push(e.clone()));

    agent.link.reject_next_writes(1);
    let result = agent.core.mark_read(ticket.id).await;
    assert!(matches!(result, Err(SyncError::Backend(_))));
    assert_eq!(agent.core.unread_count(&ticket.id), 2);

    let seen = seen.lock();
    assert!(seen.contains(&SyncEvent::UnreadChanged {
        ticket_id: ticket.id,
        count: 0
    }));
    assert!(seen.contains(&SyncEvent::UnreadChanged {
        ticket_id: ticket.id,
        count: 2
    }));
    assert!(seen.iter().any(|e| matches!(
        e,
        SyncEvent::MarkReadFailed { ticket_id, .. } if *ticket_id == ticket.id
    )));
    drop(seen);

    agent.stop().await;
}

#[tokio::test]
async fn clients_count_only_their_own_tickets() {
    let server = LoopbackServer::new();
    let agent_link = server.connect(UserId::new("agent-1"));
    let other_client = server.connect(UserId::new("client-2"));
    let mine = seed_ticket(&server.connect(UserId::new("client-1")), "My lease").await;
    let theirs = seed_ticket(&other_client, "Their lease").await;

    let client = Session::start(&server, "client-1", Role::Client).await;
    post(&agent_link, theirs.id, "Reply to someone else").await;
    post(&agent_link, mine.id, "Reply to you").await;

    wait_until("own ticket counted", || {
        client.core.unread_count(&mine.id) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.core.unread_count(&theirs.id), 0);
    assert_eq!(client.core.total_unread(), 1);
    assert!(client.core.ticket(&theirs.id).is_none());

    client.stop().await;
}

#[tokio::test]
async fn message_arriving_before_its_ticket_is_counted() {
    let server = LoopbackServer::new();
    let client = Session::start(&server, "client-1", Role::Client).await;
    let ticket = ticket_for("client-1", "Unpaid overtime");
    let reply = message_on(ticket.id, "agent-1", "We can help with that");

    server.inject(
        &TopicKey::UnreadCounters,
        &ChangeEvent::Insert(Record::Message(reply.clone())),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.core.unread_count(&ticket.id), 0);

    server.inject(
        &TopicKey::TicketList,
        &ChangeEvent::Insert(Record::Ticket(ticket.clone())),
    );
    wait_until("ticket listed", || client.core.ticket(&ticket.id).is_some()).await;
    wait_until("early message counted", || {
        client.core.unread_count(&ticket.id) == 1
    })
    .await;

    // Seeing the same message again on the live stream does not add to it.
    server.inject(
        &TopicKey::UnreadCounters,
        &ChangeEvent::Insert(Record::Message(reply)),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.core.unread_count(&ticket.id), 1);

    client.stop().await;
}

#[tokio::test]
async fn early_message_for_a_foreign_ticket_stays_uncounted() {
    let server = LoopbackServer::new();
    let client = Session::start(&server, "client-1", Role::Client).await;
    let theirs = ticket_for("client-2", "Someone else's claim");

    server.inject(
        &TopicKey::UnreadCounters,
        &ChangeEvent::Insert(Record::Message(message_on(theirs.id, "agent-1", "Hello"))),
    );
    server.inject(
        &TopicKey::TicketList,
        &ChangeEvent::Insert(Record::Ticket(theirs.clone())),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(client.core.ticket(&theirs.id).is_none());
    assert_eq!(client.core.unread_count(&theirs.id), 0);
    assert_eq!(client.core.total_unread(), 0);

    client.stop().await;
}

#[tokio::test]
async fn selecting_a_ticket_marks_it_read() {
    let server = LoopbackServer::new();
    let client_link = server.connect(UserId::new("client-1"));
    let ticket = seed_ticket(&client_link, "Small claims court").await;

    let agent = Session::start(&server, "agent-1", Role::Agent).await;
    post(&client_link, ticket.id, "When is the deadline?").await;
    wait_until("one unread", || agent.core.unread_count(&ticket.id) == 1).await;

    agent.open(ticket.id).await;
    wait_until("cleared", || agent.core.unread_count(&ticket.id) == 0).await;
    wait_until("stored as read", || {
        server.messages().iter().all(|m| m.read_at.is_some())
    })
    .await;

    agent.stop().await;
}

// =============================================================================
// Presence
// =============================================================================

#[tokio::test]
async fn online_staff_follow_connectivity() {
    let server = LoopbackServer::new();
    let agent = Session::start(&server, "agent-1", Role::Agent).await;
    let lead = Session::start(&server, "lead-1", Role::Supervisor).await;
    let client = Session::start(&server, "client-1", Role::Client).await;

    wait_until("both staff online", || {
        staff_names(&client.core) == vec!["AGENT-1", "LEAD-1"]
    })
    .await;
    let flags = client
        .core
        .online_flags(&[UserId::new("agent-1"), UserId::new("client-1")]);
    assert!(flags[&UserId::new("agent-1")]);
    assert!(!flags[&UserId::new("client-1")]);

    agent.link.set_online(false);
    wait_until("agent gone", || staff_names(&client.core) == vec!["LEAD-1"]).await;

    agent.link.set_online(true);
    wait_until("agent back", || {
        staff_names(&client.core) == vec!["AGENT-1", "LEAD-1"]
    })
    .await;
    assert_eq!(staff_names(&lead.core), vec!["AGENT-1", "LEAD-1"]);

    agent.stop().await;
    lead.stop().await;
    client.stop().await;
}

// =============================================================================
// Typing
// =============================================================================

#[tokio::test]
async fn typing_indicator_expires_without_refresh() {
    let server = LoopbackServer::new();
    let ticket = seed_ticket(&server.connect(UserId::new("client-1")), "Parking fine").await;
    let agent = Session::start(&server, "agent-1", Role::Agent).await;
    let client = Session::start(&server, "client-1", Role::Client).await;
    agent.open(ticket.id).await;
    client.open(ticket.id).await;

    client.core.notify_typing(ticket.id, true);
    wait_until("typing shown", || {
        agent.core.typing_users(&ticket.id) == vec!["CLIENT-1"]
    })
    .await;
    assert!(client.core.typing_users(&ticket.id).is_empty());

    wait_until("lease expired", || {
        agent.core.typing_users(&ticket.id).is_empty()
    })
    .await;

    agent.stop().await;
    client.stop().await;
}

#[tokio::test]
async fn typing_stop_clears_at_once() {
    let server = LoopbackServer::new();
    let ticket = seed_ticket(&server.connect(UserId::new("client-1")), "Noise complaint").await;
    let agent = Session::start(&server, "agent-1", Role::Agent).await;
    let client = Session::start(&server, "client-1", Role::Client).await;
    agent.open(ticket.id).await;
    client.open(ticket.id).await;

    agent.core.notify_typing(ticket.id, true);
    wait_until("typing shown", || {
        client.core.typing_users(&ticket.id) == vec!["AGENT-1"]
    })
    .await;
    agent.core.notify_typing(ticket.id, false);
    let deadline = Instant::now() + Duration::from_millis(200);
    wait_until("typing cleared", || {
        client.core.typing_users(&ticket.id).is_empty()
    })
    .await;
    assert!(Instant::now() < deadline);

    agent.stop().await;
    client.stop().await;
}
