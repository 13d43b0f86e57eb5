//! Messaging and consumer configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{ConsumerSettings, DeadLetter, Sequencing, Topology};
use crate::events::{AUTH_EVENTS_EXCHANGE, AUTH_EVENTS_QUEUE, AUTH_USER_REGISTERED};

/// Broker connection configuration.
///
/// Without a URL every bus component reports itself disabled and publishing
/// becomes a logged no-op.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Broker URL. `amqp://`/`amqps://` for RabbitMQ, `memory://` for the
    /// in-process broker.
    pub url: Option<String>,
}

impl MessagingConfig {
    /// The configured URL, treating an empty string as absent.
    pub fn broker_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Event consumer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Durable queue the consumer reads.
    pub queue: String,
    /// Exchange the queue is bound to.
    pub exchange: String,
    /// Exact routing keys bound to the queue.
    pub routing_keys: Vec<String>,
    /// Prefix of the broker consumer tag.
    pub consumer_tag: String,
    /// Unacknowledged deliveries in flight. 0 = unlimited.
    pub prefetch: u16,
    pub sequencing: Sequencing,
    /// Seconds `stop()` waits for running handlers.
    pub drain_timeout_secs: u64,
    /// Retries for transient handler failures. 0 = discard on first failure.
    pub handler_retries: usize,
    /// Dead-letter route for rejected messages. Absent = discard.
    pub dead_letter: Option<DeadLetter>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: AUTH_EVENTS_QUEUE.to_string(),
            exchange: AUTH_EVENTS_EXCHANGE.to_string(),
            routing_keys: vec![AUTH_USER_REGISTERED.to_string()],
            consumer_tag: crate::bus::consumer::DEFAULT_CONSUMER_TAG.to_string(),
            prefetch: 64,
            sequencing: Sequencing::PerIdentity,
            drain_timeout_secs: 10,
            handler_retries: 0,
            dead_letter: None,
        }
    }
}

impl ConsumerConfig {
    pub fn topology(&self) -> Topology {
        Topology::consumer(&self.exchange, &self.queue, self.routing_keys.iter().cloned())
            .with_dead_letter(self.dead_letter.clone())
    }

    pub fn settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            consumer_tag: self.consumer_tag.clone(),
            prefetch: self.prefetch,
            sequencing: self.sequencing,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            handler_retries: self.handler_retries,
        }
    }
}
