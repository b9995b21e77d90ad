//! Hub wire protocol.
//!
//! Defines the [`HubFrame`] enum that is postcard-encoded and sent over
//! WebSocket binary frames between a client and the development hub.
//!
//! A connection starts with `Authenticate` → `Authenticated`. After that the
//! client issues data requests (`Request` → `Response`, matched by
//! `request_id`), opens topic subscriptions (`Subscribe` → `Subscribed`,
//! then a stream of `Event`s tagged with the same `sub_id`), publishes
//! ephemeral broadcasts, and probes liveness with `Ping` → `Pong`.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::event::{Broadcast, ChangeEvent};
use crate::ids::UserId;
use crate::record::{Entity, Filter, NewRecord, Patch, Record, RecordId};
use crate::topic::TopicKey;

/// A data operation carried by [`HubFrame::Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubOp {
    /// List records matching a filter.
    FetchList {
        /// Entity to list.
        entity: Entity,
        /// Selection criteria.
        filter: Filter,
    },
    /// Fetch one record by id.
    FetchOne(RecordId),
    /// Create a record.
    Insert(NewRecord),
    /// Change a record.
    Update {
        /// Target record.
        id: RecordId,
        /// The change.
        patch: Patch,
    },
    /// Remove a record.
    Delete(RecordId),
}

/// Successful result of a [`HubOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubReply {
    /// Result of `FetchList`.
    Records(Vec<Record>),
    /// Result of `FetchOne`, `Insert`, `Update`.
    Record(Record),
    /// Result of `Delete`.
    Deleted,
}

/// Failed result of a [`HubOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum HubFailure {
    /// The target record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The write was refused (validation, closed ticket, ...).
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Frames exchanged between hub clients and the hub server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubFrame {
    /// Client identifies itself. Must be the first frame on a connection.
    Authenticate {
        /// The authenticated user.
        user_id: UserId,
        /// Session token, if the deployment requires one.
        token: Option<String>,
    },
    /// Server accepts the session.
    Authenticated {
        /// The user the session belongs to (echoed back).
        user_id: UserId,
    },
    /// Client issues a data operation.
    Request {
        /// Client-chosen id echoed on the response.
        request_id: u64,
        /// The operation.
        op: HubOp,
    },
    /// Server answers a request.
    Response {
        /// Id of the request being answered.
        request_id: u64,
        /// Outcome.
        result: Result<HubReply, HubFailure>,
    },
    /// Client opens a topic subscription.
    Subscribe {
        /// Client-chosen subscription id.
        sub_id: u64,
        /// Topic to follow.
        topic: TopicKey,
    },
    /// Server confirms a subscription is live.
    Subscribed {
        /// The confirmed subscription.
        sub_id: u64,
    },
    /// Client closes a subscription.
    Unsubscribe {
        /// The subscription to close.
        sub_id: u64,
    },
    /// Server delivers an event for a subscription.
    Event {
        /// Subscription the event belongs to.
        sub_id: u64,
        /// The event.
        event: ChangeEvent,
    },
    /// Client publishes an ephemeral broadcast on a topic.
    Publish {
        /// Target topic.
        topic: TopicKey,
        /// Payload.
        payload: Broadcast,
    },
    /// Liveness probe.
    Ping {
        /// Echoed back in the `Pong`.
        nonce: u64,
    },
    /// Answer to a `Ping`.
    Pong {
        /// Nonce from the `Ping`.
        nonce: u64,
    },
    /// Server reports a connection-level error.
    Error {
        /// Human-readable description.
        reason: String,
    },
}

/// Encodes a [`HubFrame`] into bytes using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &HubFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a [`HubFrame`] from bytes.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid frame.
pub fn decode(bytes: &[u8]) -> Result<HubFrame, CodecError> {
    codec::decode(bytes)
}
