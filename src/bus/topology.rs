//! Exchange, queue and binding declarations.
//!
//! Declarations are additive and idempotent, so they run every time a
//! connection is (re)established and may race across service instances.
//! Bindings use exact routing keys: a consumer binds its queue once per event
//! type it handles.

use serde::Deserialize;
use tracing::debug;

use super::{BrokerChannel, Result};
use crate::events::{
    AUTH_EVENTS_EXCHANGE, AUTH_EVENTS_QUEUE, AUTH_USER_REGISTERED, USER_EVENTS_EXCHANGE,
};

/// Catch-all pattern binding a dead-letter queue to its exchange.
const DEAD_LETTER_PATTERN: &str = "#";

/// Where rejected messages go instead of being discarded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeadLetter {
    pub exchange: String,
    pub queue: String,
}

/// Consumer-side queue and its bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    /// Exact routing keys, one binding each.
    pub routing_keys: Vec<String>,
    pub dead_letter: Option<DeadLetter>,
}

/// Everything one role declares on its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Durable topic exchange for the event family.
    pub exchange: String,
    /// Present on the consumer side only.
    pub binding: Option<QueueBinding>,
}

impl Topology {
    /// Topology for publishing to `exchange`.
    pub fn publisher(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            binding: None,
        }
    }

    /// Topology for consuming `routing_keys` from `exchange` through `queue`.
    pub fn consumer<I, S>(exchange: impl Into<String>, queue: impl Into<String>, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exchange: exchange.into(),
            binding: Some(QueueBinding {
                queue: queue.into(),
                routing_keys: routing_keys.into_iter().map(Into::into).collect(),
                dead_letter: None,
            }),
        }
    }

    /// Auth service publishing identity facts.
    pub fn auth_publisher() -> Self {
        Self::publisher(AUTH_EVENTS_EXCHANGE)
    }

    /// User service publishing profile facts.
    pub fn user_publisher() -> Self {
        Self::publisher(USER_EVENTS_EXCHANGE)
    }

    /// User service consuming identity facts.
    pub fn auth_consumer(queue: impl Into<String>) -> Self {
        Self::consumer(AUTH_EVENTS_EXCHANGE, queue, [AUTH_USER_REGISTERED])
    }

    /// Default user-service consumer on `auth-service.auth-events`.
    pub fn default_auth_consumer() -> Self {
        Self::auth_consumer(AUTH_EVENTS_QUEUE)
    }

    /// Route rejected messages to a dead-letter exchange. No-op on a
    /// publisher topology.
    pub fn with_dead_letter(mut self, dead_letter: Option<DeadLetter>) -> Self {
        if let Some(binding) = self.binding.as_mut() {
            binding.dead_letter = dead_letter;
        }
        self
    }

    pub fn queue(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.queue.as_str())
    }

    /// Declare exchange, queue and bindings on `channel`.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        channel.declare_exchange(&self.exchange).await?;

        let Some(binding) = &self.binding else {
            return Ok(());
        };

        let dead_letter_exchange = match &binding.dead_letter {
            Some(dl) => {
                channel.declare_exchange(&dl.exchange).await?;
                channel.declare_queue(&dl.queue, None).await?;
                channel
                    .bind_queue(&dl.queue, &dl.exchange, DEAD_LETTER_PATTERN)
                    .await?;
                Some(dl.exchange.as_str())
            }
            None => None,
        };

        channel
            .declare_queue(&binding.queue, dead_letter_exchange)
            .await?;

        for key in &binding.routing_keys {
            channel
                .bind_queue(&binding.queue, &self.exchange, key)
                .await?;
            debug!(
                queue = %binding.queue,
                exchange = %self.exchange,
                routing_key = %key,
                "Bound queue to exchange"
            );
        }

        Ok(())
    }
}
