//! Backend abstraction for `Ticketsync`.
//!
//! The synchronization core talks to its backing service through two traits:
//! - [`DataApi`]: request/response access to tickets and messages
//! - [`RealtimeTransport`]: topic subscriptions, broadcasts, liveness probes
//!   and credential refresh
//!
//! Concrete implementations:
//! - [`loopback::LoopbackBackend`]: in-process backend with fault injection for tests
//! - [`hub::HubBackend`]: WebSocket client for the `ticketsync-hub` server

pub mod hub;
pub mod loopback;

use std::fmt;

use tokio::sync::mpsc;

use ticketsync_proto::event::{Broadcast, ChangeEvent};
use ticketsync_proto::record::{Entity, Filter, NewRecord, Patch, Record, RecordId};
use ticketsync_proto::topic::TopicKey;

/// Errors that can occur while talking to the backing service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The service cannot be reached right now.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete in time.
    #[error("backend operation timed out")]
    Timeout,

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service refused the write.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The service answered with something that makes no sense.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Connectivity failures are transient; refusals are permanent.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Opaque handle identifying one open subscription on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Wraps a transport-specific id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the transport-specific id.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// A freshly opened subscription: its handle plus the ordered event stream.
///
/// The stream ends when the transport drops the subscription (connection
/// loss, server-side close) or after [`RealtimeTransport::unsubscribe`].
#[derive(Debug)]
pub struct Subscribed {
    /// Handle to pass to [`RealtimeTransport::unsubscribe`].
    pub handle: SubscriptionHandle,
    /// Events for the topic, in delivery order.
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Request/response access to stored records.
pub trait DataApi: Send + Sync {
    /// List records of `entity` matching `filter`.
    fn fetch_list(
        &self,
        entity: Entity,
        filter: Filter,
    ) -> impl std::future::Future<Output = Result<Vec<Record>, BackendError>> + Send;

    /// Fetch one record, or [`BackendError::NotFound`].
    fn fetch_one(
        &self,
        id: RecordId,
    ) -> impl std::future::Future<Output = Result<Record, BackendError>> + Send;

    /// Create a record and return the authoritative version.
    ///
    /// Inserts carry a correlation id; replaying an insert with the same
    /// correlation id returns the original record instead of a duplicate.
    fn insert(
        &self,
        payload: NewRecord,
    ) -> impl std::future::Future<Output = Result<Record, BackendError>> + Send;

    /// Apply `patch` to a record and return the new version.
    fn update(
        &self,
        id: RecordId,
        patch: Patch,
    ) -> impl std::future::Future<Output = Result<Record, BackendError>> + Send;

    /// Remove a record.
    fn delete(
        &self,
        id: RecordId,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

/// Publish/subscribe access to change events.
///
/// Delivery is at-most-once per subscription and in order within a topic.
/// Events published while a subscription is down are not replayed; callers
/// resynchronize by fetching after every (re-)subscription.
pub trait RealtimeTransport: Send + Sync {
    /// Open a subscription to `topic`.
    fn subscribe(
        &self,
        topic: &TopicKey,
    ) -> impl std::future::Future<Output = Result<Subscribed, BackendError>> + Send;

    /// Close a subscription. Closing an unknown handle is a no-op.
    fn unsubscribe(
        &self,
        handle: SubscriptionHandle,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Publish an ephemeral payload on `topic`.
    fn broadcast(
        &self,
        topic: &TopicKey,
        payload: Broadcast,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Lightweight reachability check.
    fn probe(&self) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Re-establish the session and underlying connection.
    fn refresh_credentials(
        &self,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

/// A complete backend: data access plus realtime transport.
pub trait Backend: DataApi + RealtimeTransport + 'static {}

impl<T: DataApi + RealtimeTransport + 'static> Backend for T {}
