//! Service-side integrations of the event bus.
//!
//! - `auth`: announces registrations after they commit
//! - `user`: projects announced identities into local storage

pub mod auth;
pub mod user;

pub use auth::AuthEvents;
pub use user::{ProjectionError, ProjectionHandler, UserProjector};
