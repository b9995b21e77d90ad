//! Property-based tests for the hub wire protocol and topic keys.
//!
//! Uses proptest to verify:
//! 1. Any `HubFrame` carrying ticket/message records survives encode → decode.
//! 2. Random bytes never cause a panic in `hub::decode` (returns `Err` gracefully).
//! 3. Every `TopicKey` parses back from its display form.
//! 4. Replaying an insert against `MemoryStore` never duplicates a record.

use proptest::prelude::*;
use ticketsync_proto::event::{Broadcast, ChangeEvent};
use ticketsync_proto::hub::{self, HubFailure, HubFrame, HubOp, HubReply};
use ticketsync_proto::ids::{CorrelationId, MessageId, TicketId, Timestamp, UserId};
use ticketsync_proto::presence::PresenceEntry;
use ticketsync_proto::record::{
    ChatMessage, NewMessage, NewRecord, NewTicket, Priority, Record, Role, Ticket, TicketStatus,
};
use ticketsync_proto::store::MemoryStore;
use ticketsync_proto::topic::TopicKey;
use ticketsync_proto::typing::TypingSignal;
use uuid::Uuid;

// --- Strategies for protocol types ---

fn arb_ticket_id() -> impl Strategy<Value = TicketId> {
    any::<u128>().prop_map(|n| TicketId::from_uuid(Uuid::from_u128(n)))
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
}

fn arb_correlation_id() -> impl Strategy<Value = CorrelationId> {
    any::<u128>().prop_map(|n| CorrelationId::from_uuid(Uuid::from_u128(n)))
}

fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-z0-9-]{1,24}".prop_map(UserId::new)
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

fn arb_role() -> impl Strategy<Value = Role> {
    prop_oneof![
        Just(Role::Client),
        Just(Role::Agent),
        Just(Role::Supervisor),
        Just(Role::Admin),
    ]
}

fn arb_status() -> impl Strategy<Value = TicketStatus> {
    prop_oneof![
        Just(TicketStatus::Open),
        Just(TicketStatus::InProgress),
        Just(TicketStatus::WaitingOnClient),
        Just(TicketStatus::Resolved),
        Just(TicketStatus::Closed),
    ]
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Urgent),
    ]
}

fn arb_ticket() -> impl Strategy<Value = Ticket> {
    (
        arb_ticket_id(),
        ".{0,64}",
        ".{0,256}",
        arb_status(),
        arb_priority(),
        proptest::option::of("[a-z]{1,16}"),
        arb_user_id(),
        proptest::option::of(arb_user_id()),
        arb_timestamp(),
        proptest::option::of(arb_correlation_id()),
    )
        .prop_map(
            |(id, title, description, status, priority, category, requester, assignee, ts, cid)| {
                Ticket {
                    id,
                    title,
                    description,
                    status,
                    priority,
                    category,
                    requester_id: requester,
                    assignee_id: assignee,
                    created_at: ts,
                    updated_at: ts,
                    last_correlation_id: cid,
                }
            },
        )
}

fn arb_message() -> impl Strategy<Value = ChatMessage> {
    (
        arb_message_id(),
        arb_ticket_id(),
        arb_user_id(),
        ".{0,32}",
        ".{0,512}",
        arb_timestamp(),
        proptest::option::of(arb_timestamp()),
        proptest::option::of(arb_correlation_id()),
    )
        .prop_map(
            |(id, ticket_id, author_id, author_name, body, created_at, read_at, cid)| ChatMessage {
                id,
                ticket_id,
                author_id,
                author_name,
                body,
                created_at,
                read_at,
                correlation_id: cid,
            },
        )
}

fn arb_record() -> impl Strategy<Value = Record> {
    prop_oneof![
        arb_ticket().prop_map(Record::Ticket),
        arb_message().prop_map(Record::Message),
    ]
}

fn arb_presence_entry() -> impl Strategy<Value = PresenceEntry> {
    (arb_user_id(), ".{0,32}", arb_role(), arb_timestamp()).prop_map(
        |(user_id, name, role, last_seen_at)| PresenceEntry {
            user_id,
            name,
            role,
            last_seen_at,
        },
    )
}

fn arb_broadcast() -> impl Strategy<Value = Broadcast> {
    prop_oneof![
        (arb_ticket_id(), arb_user_id(), ".{0,32}", any::<bool>()).prop_map(
            |(ticket_id, user_id, name, is_typing)| Broadcast::Typing(TypingSignal {
                ticket_id,
                user_id,
                name,
                is_typing,
            })
        ),
        arb_presence_entry().prop_map(Broadcast::Heartbeat),
        prop::collection::vec(arb_presence_entry(), 0..8).prop_map(Broadcast::PresenceSync),
    ]
}

fn arb_event() -> impl Strategy<Value = ChangeEvent> {
    prop_oneof![
        arb_record().prop_map(ChangeEvent::Insert),
        arb_record().prop_map(ChangeEvent::Update),
        arb_record().prop_map(ChangeEvent::Delete),
        arb_broadcast().prop_map(ChangeEvent::Broadcast),
    ]
}

fn arb_topic() -> impl Strategy<Value = TopicKey> {
    prop_oneof![
        Just(TopicKey::TicketList),
        arb_ticket_id().prop_map(TopicKey::Messages),
        arb_ticket_id().prop_map(TopicKey::Typing),
        Just(TopicKey::Presence),
        Just(TopicKey::UnreadCounters),
    ]
}

fn arb_frame() -> impl Strategy<Value = HubFrame> {
    prop_oneof![
        (arb_user_id(), proptest::option::of(".{0,32}"))
            .prop_map(|(user_id, token)| HubFrame::Authenticate { user_id, token }),
        (any::<u64>(), arb_record()).prop_map(|(request_id, record)| HubFrame::Response {
            request_id,
            result: Ok(HubReply::Record(record)),
        }),
        (any::<u64>(), prop::collection::vec(arb_record(), 0..6)).prop_map(
            |(request_id, records)| HubFrame::Response {
                request_id,
                result: Ok(HubReply::Records(records)),
            }
        ),
        (any::<u64>(), ".{0,64}").prop_map(|(request_id, reason)| HubFrame::Response {
            request_id,
            result: Err(HubFailure::Rejected(reason)),
        }),
        (any::<u64>(), arb_topic())
            .prop_map(|(sub_id, topic)| HubFrame::Subscribe { sub_id, topic }),
        (any::<u64>(), arb_event()).prop_map(|(sub_id, event)| HubFrame::Event { sub_id, event }),
        (arb_topic(), arb_broadcast())
            .prop_map(|(topic, payload)| HubFrame::Publish { topic, payload }),
        (any::<u64>(), arb_ticket_id()).prop_map(|(request_id, id)| HubFrame::Request {
            request_id,
            op: HubOp::FetchOne(ticketsync_proto::record::RecordId::Ticket(id)),
        }),
        any::<u64>().prop_map(|nonce| HubFrame::Ping { nonce }),
    ]
}

// --- Property tests ---

proptest! {
    #[test]
    fn hub_frame_round_trip(frame in arb_frame()) {
        let bytes = hub::encode(&frame)?;
        let decoded = hub::decode(&bytes)?;
        prop_assert_eq!(frame, decoded);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = hub::decode(&bytes);
    }

    #[test]
    fn topic_key_parses_its_display_form(topic in arb_topic()) {
        let parsed: TopicKey = topic.to_string().parse()?;
        prop_assert_eq!(topic, parsed);
    }

    #[test]
    fn replayed_inserts_never_duplicate(
        bodies in prop::collection::vec("[a-z]{1,16}", 1..12),
        replays in 1usize..4,
    ) {
        let mut store = MemoryStore::new();
        let (ticket, _) = store
            .insert(
                NewRecord::Ticket(NewTicket {
                    title: "Contract review".into(),
                    description: String::new(),
                    priority: Priority::Normal,
                    category: None,
                    requester_id: UserId::new("client-1"),
                    correlation_id: CorrelationId::new(),
                }),
                Timestamp::from_millis(1),
            )?;
        let Record::Ticket(ticket) = ticket else {
            return Err(TestCaseError::fail("expected a ticket"));
        };
        let payloads: Vec<NewRecord> = bodies
            .iter()
            .map(|body| NewRecord::Message(NewMessage {
                ticket_id: ticket.id,
                author_id: UserId::new("client-1"),
                author_name: "Client".into(),
                body: body.clone(),
                correlation_id: CorrelationId::new(),
            }))
            .collect();
        for _ in 0..replays {
            for payload in &payloads {
                store.insert(payload.clone(), Timestamp::from_millis(2))?;
            }
        }
        prop_assert_eq!(store.messages().len(), bodies.len());
    }
}
