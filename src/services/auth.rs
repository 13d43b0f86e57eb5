//! Auth-side announcer.
//!
//! Registration commits first; the announcement is a best-effort side
//! effect that never fails it.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::{ConnectionManager, EventPublisher, PublishOutcome, Role, Topology};
use crate::config::MessagingConfig;
use crate::events::{EventMetadata, UserRegistered, AUTH_USER_REGISTERED};

/// Publishes identity facts on `auth.events`.
#[derive(Clone)]
pub struct AuthEvents {
    publisher: EventPublisher,
}

impl AuthEvents {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }

    /// Build from configuration. An unusable URL disables messaging.
    pub fn from_config(config: &MessagingConfig) -> Self {
        let manager =
            ConnectionManager::for_url(Role::Publisher, config.broker_url(), Topology::auth_publisher());
        Self::new(EventPublisher::new(Arc::new(manager)))
    }

    /// Connect ahead of the first registration.
    pub async fn warm_up(&self) -> bool {
        self.publisher.warm_up().await
    }

    /// Close the publisher's channel, flushing queued frames.
    pub async fn close(&self) -> crate::bus::Result<()> {
        self.publisher.close().await
    }

    /// Announce a committed registration.
    pub async fn user_registered(
        &self,
        user: &UserRegistered,
        correlation_id: Option<&str>,
    ) -> PublishOutcome {
        let mut metadata = EventMetadata::versioned();
        if let Some(id) = correlation_id {
            metadata = metadata.with_correlation_id(id);
        }

        let outcome = self
            .publisher
            .publish_with_metadata(AUTH_USER_REGISTERED, user, metadata)
            .await;

        match outcome {
            PublishOutcome::Published => info!(identity = %user.id, "Announced registration"),
            other => warn!(identity = %user.id, outcome = ?other, "Registration not announced"),
        }
        outcome
    }
}
