//! Fire-and-forget event publisher.
//!
//! Publishing never fails the caller. The business operation that produced
//! the fact has already committed; a fact that cannot be published is logged
//! and dropped.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use super::{ConnectionManager, MessageProperties};
use crate::events::{DomainEvent, EventMetadata};

/// What happened to a publish request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the channel's send path.
    Published,
    /// Messaging is disabled or no channel could be established.
    Skipped,
    /// Encoding or sending failed.
    Dropped,
}

/// Publishes facts to one exchange through a shared [`ConnectionManager`].
#[derive(Clone)]
pub struct EventPublisher {
    manager: Arc<ConnectionManager>,
}

impl EventPublisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn exchange(&self) -> &str {
        &self.manager.topology().exchange
    }

    /// Connect and declare the exchange ahead of the first publish.
    ///
    /// Returns whether a channel is ready. Failures are logged, not raised.
    pub async fn warm_up(&self) -> bool {
        match self.manager.ensure_ready().await {
            Ok(channel) => channel.is_some(),
            Err(e) => {
                warn!(exchange = %self.exchange(), error = %e, "Publisher warm-up failed");
                false
            }
        }
    }

    /// Close the underlying channel. The next publish reconnects.
    pub async fn close(&self) -> super::Result<()> {
        self.manager.close().await
    }

    /// Publish `payload` as a fact of type `event_type`, stamped now.
    pub async fn publish<P>(&self, event_type: &str, payload: P) -> PublishOutcome
    where
        P: Serialize + Send + Sync,
    {
        self.publish_event(&DomainEvent::new(event_type, payload))
            .await
    }

    /// Like [`publish`](Self::publish), with tracing metadata attached.
    pub async fn publish_with_metadata<P>(
        &self,
        event_type: &str,
        payload: P,
        metadata: EventMetadata,
    ) -> PublishOutcome
    where
        P: Serialize + Send + Sync,
    {
        self.publish_event(&DomainEvent::new(event_type, payload).with_metadata(metadata))
            .await
    }

    /// Publish a prebuilt envelope. The routing key is its `type`.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(exchange = %self.exchange(), routing_key = %event.event_type)
    )]
    pub async fn publish_event<P>(&self, event: &DomainEvent<P>) -> PublishOutcome
    where
        P: Serialize + Send + Sync,
    {
        let channel = match self.manager.ensure_ready().await {
            Ok(Some(channel)) => channel,
            Ok(None) => return PublishOutcome::Skipped,
            Err(e) => {
                warn!(error = %e, "Broker unavailable, event not published");
                return PublishOutcome::Skipped;
            }
        };

        let body = match event.encode() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode event, dropping");
                return PublishOutcome::Dropped;
            }
        };

        let properties = MessageProperties::persistent_json(event.event_type.as_str())
            .with_timestamp(event.occurred_at.timestamp().max(0) as u64);

        match channel
            .publish(self.exchange(), &event.event_type, body, properties)
            .await
        {
            Ok(()) => {
                debug!("Published event");
                PublishOutcome::Published
            }
            Err(e) => {
                error!(error = %e, "Failed to publish event, dropping");
                PublishOutcome::Dropped
            }
        }
    }
}
