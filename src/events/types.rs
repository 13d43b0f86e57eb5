//! Event types and topology names shared by the auth and user services.
//!
//! These names must match on both sides for the services to interoperate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic exchange carrying facts owned by the auth service.
pub const AUTH_EVENTS_EXCHANGE: &str = "auth.events";
/// A new identity was registered.
pub const AUTH_USER_REGISTERED: &str = "auth.user.registered";
/// Durable queue the user service consumes auth facts from.
pub const AUTH_EVENTS_QUEUE: &str = "auth-service.auth-events";

/// Topic exchange carrying facts owned by the user service.
pub const USER_EVENTS_EXCHANGE: &str = "user.events";
/// A profile was created (or refreshed) from an identity.
pub const USER_CREATED: &str = "user.created";

/// Payload of `auth.user.registered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(with = "super::iso8601")]
    pub created_at: DateTime<Utc>,
}

/// Payload of `user.created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(with = "super::iso8601")]
    pub created_at: DateTime<Utc>,
}
