//! `Ticketsync`: realtime synchronization core for a legal-support ticket desk.

pub mod backend;
pub mod config;
pub mod connection;
pub mod core;
pub mod merge;
pub mod notify;
pub mod optimistic;
pub mod presence;
pub mod subscription;
pub mod typing;
pub mod unread;

pub use crate::core::{Identity, SyncConfig, SyncCore, SyncError};
pub use crate::notify::{ChangeSubscription, SyncEvent};
