//! `Ticketsync` development hub library.
//!
//! Exposes the hub server for use in tests and embedding. The hub keeps
//! tickets and messages in memory, answers data requests, and fans change
//! events and broadcasts out to topic subscribers.

pub mod config;
pub mod hub;
