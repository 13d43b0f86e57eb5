//! AMQP (RabbitMQ) transport.
//!
//! One [`lapin::Connection`] with one [`lapin::Channel`] per
//! [`BrokerChannel`]. Exchanges are durable topic exchanges, queues are
//! durable, consumers use manual acknowledgment. Publishing does not enable
//! publisher confirms: success means the frame was handed to the connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{
    Acker, BrokerChannel, BusError, Connector, Delivery, ErrorHook, MessageProperties, Result,
    Subscription,
};

/// Queue argument naming the exchange that receives rejected messages.
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// AMQP delivery mode asking the broker to persist the message.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code for a normal channel/connection close.
const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ connections with lapin.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str, on_error: ErrorHook) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        connection.on_error(move |e| on_error(BusError::Connection(e.to_string())));

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        debug!(channel_id = channel.id(), "AMQP channel opened");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

/// A lapin connection and its single channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(message_id) = properties.message_id {
        basic = basic.with_message_id(message_id.into());
    }
    if let Some(kind) = properties.kind {
        basic = basic.with_kind(kind.into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|s| s.to_string()),
        persistent: *basic.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        message_id: basic.message_id().as_ref().map(|s| s.to_string()),
        kind: basic.kind().as_ref().map(|s| s.to_string()),
        timestamp: *basic.timestamp(),
    }
}

fn queue_arguments(dead_letter_exchange: Option<&str>) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = dead_letter_exchange {
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(exchange.to_string().into()),
        );
    }
    args
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare exchange {}: {}", name, e)))
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(dead_letter_exchange),
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::Topology(format!("Failed to declare queue {}: {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to bind queue {}: {}", queue, e)))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        // Confirms are not enabled on this channel; the returned confirm
        // resolves without a broker round trip and is dropped.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                to_basic_properties(properties),
            )
            .await
            .map(drop)
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))
    }

    async fn consume(&self, queue: &str, tag: &str) -> Result<Subscription> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let tag = consumer.tag().to_string();
        info!(queue = %queue, consumer_tag = %tag, "AMQP consumer registered");

        let deliveries = consumer
            .map(|next| {
                next.map(|delivery| {
                    Delivery::new(
                        delivery.data,
                        delivery.routing_key.as_str(),
                        delivery.redelivered,
                        from_basic_properties(&delivery.properties),
                        Box::new(AmqpAcker(delivery.acker)),
                    )
                })
                .map_err(|e| BusError::Subscribe(format!("Delivery failed: {}", e)))
            })
            .boxed();

        Ok(Subscription { tag, deliveries })
    }

    async fn cancel(&self, tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to cancel consumer {}: {}", tag, e)))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;
        }
        Ok(())
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to nack: {}", e)))
    }
}
