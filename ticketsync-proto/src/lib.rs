//! Shared data model and wire protocol for `Ticketsync`.
//!
//! Everything that crosses the boundary between the synchronization core and
//! its backing service lives here: identifiers, the ticket/message entities,
//! topic keys, change events, presence and typing payloads, the hub frame
//! protocol, and the in-memory reference store used by both the loopback
//! backend and the development hub.

pub mod codec;
pub mod event;
pub mod hub;
pub mod ids;
pub mod presence;
pub mod record;
pub mod store;
pub mod topic;
pub mod typing;
