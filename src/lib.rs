//! chatsync - identity/profile synchronization over a message broker.
//!
//! The auth service announces registrations on the `auth.events` topic
//! exchange; the user service consumes them from a durable queue with manual
//! acknowledgment and projects them idempotently into local storage.

pub mod bus;
pub mod config;
pub mod events;
pub mod services;
pub mod storage;
pub mod utils;
