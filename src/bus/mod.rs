//! Broker integration.
//!
//! This module contains:
//! - `Connector` / `BrokerChannel` traits: the transport seam
//! - `EventHandler` trait: for processing inbound facts
//! - `ConnectionManager`, `Topology`, `EventPublisher`, `EventConsumer`
//! - Implementations: AMQP (RabbitMQ), in-process channel broker

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::events::{CodecError, InboundEvent};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod publisher;
pub mod sequencer;
pub mod topology;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use channel::{BrokerStats, ChannelBroker};
pub use connection::{resolve_transport, ConnectionManager, ExitProcess, FatalHandler, Role};
pub use consumer::{ConsumerSettings, EventConsumer, Sequencing, SubscriptionState};
pub use publisher::{EventPublisher, PublishOutcome};
pub use topology::{DeadLetter, QueueBinding, Topology};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Messaging is disabled: no broker URL configured")]
    Disabled,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgment failed: {0}")]
    Acknowledge(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Channel is closed")]
    Closed,

    #[error("Unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Failure reported by an [`EventHandler`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retrying cannot help (malformed payload, schema mismatch).
    #[error("{0}")]
    Permanent(String),

    /// The same fact may succeed later (storage outage, timeout).
    #[error("{0}")]
    Transient(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Broker-side message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Ask the broker to write the message to durable storage.
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Event type, mirrored from the envelope.
    pub kind: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
}

impl MessageProperties {
    /// Persistent JSON message of the given event type.
    pub fn persistent_json(kind: impl Into<String>) -> Self {
        Self {
            content_type: Some(crate::events::CONTENT_TYPE.to_string()),
            persistent: true,
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            kind: Some(kind.into()),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, seconds: u64) -> Self {
        self.timestamp = Some(seconds);
        self
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer under manual acknowledgment.
pub struct Delivery {
    pub data: Vec<u8>,
    pub routing_key: String,
    /// Set when the broker delivered this message before without a settlement.
    pub redelivered: bool,
    pub properties: MessageProperties,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        data: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: MessageProperties,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            data,
            routing_key: routing_key.into(),
            redelivered,
            properties,
            acker,
        }
    }

    /// Remove the message from the queue permanently.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message. Without `requeue` the broker discards it, or
    /// routes it to the queue's dead-letter exchange when one is declared.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Stream of deliveries for one subscription. Ends when the subscription is
/// cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// An active consumer registration.
pub struct Subscription {
    /// Tag identifying the registration; used to cancel it.
    pub tag: String,
    pub deliveries: DeliveryStream,
}

/// Invoked when an established connection fails at the transport level.
pub type ErrorHook = Arc<dyn Fn(BusError) + Send + Sync>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection and a single channel on it.
    ///
    /// `on_error` fires for transport errors after the connection is up. A
    /// clean close does not fire it; it is observed through
    /// [`BrokerChannel::is_open`].
    async fn connect(&self, url: &str, on_error: ErrorHook) -> Result<Arc<dyn BrokerChannel>>;
}

/// One connection plus one channel, owned by a single role in one process.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// False once the channel or its connection has closed.
    fn is_open(&self) -> bool;

    /// Declare a durable topic exchange. Idempotent.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a durable queue. Idempotent for identical arguments.
    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel. Zero means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Hand a message to the local send path. Success means it was enqueued,
    /// not that the broker confirmed it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start a manual-acknowledgment consumer on `queue`.
    async fn consume(&self, queue: &str, tag: &str) -> Result<Subscription>;

    async fn cancel(&self, tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Select a transport from the URL scheme.
///
/// - `amqp://`, `amqps://`: RabbitMQ (requires the `amqp` feature)
/// - `memory://`: a fresh in-process broker
pub fn connector_for(url: &str) -> Result<Arc<dyn Connector>> {
    let scheme = url.split("://").next().unwrap_or_default();
    match scheme {
        "amqp" | "amqps" => {
            #[cfg(feature = "amqp")]
            {
                Ok(Arc::new(AmqpConnector::new()))
            }
            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::UnsupportedScheme(format!(
                    "{} (rebuild with --features amqp)",
                    scheme
                )))
            }
        }
        "memory" => Ok(Arc::new(ChannelBroker::new())),
        other => Err(BusError::UnsupportedScheme(other.to_string())),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for processing facts from a subscription.
pub trait EventHandler: Send + Sync {
    /// Apply one fact. Invocations for different messages may overlap.
    fn handle(&self, event: Arc<InboundEvent>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;

    /// Identity the fact is about, used to sequence facts per entity.
    ///
    /// Defaults to the payload's `id` field.
    fn identity(&self, event: &InboundEvent) -> Option<String> {
        event.payload_str("id").map(str::to_owned)
    }
}
