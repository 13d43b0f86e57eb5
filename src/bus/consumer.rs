//! Event consumer with manual acknowledgment.
//!
//! Subscription lifecycle: `Unsubscribed -> Subscribed -> Cancelling -> Unsubscribed`.
//!
//! ## Concurrency contract
//!
//! The delivery loop never awaits a handler: every delivery is dispatched to
//! its own task, so facts overlap in time. With [`Sequencing::PerIdentity`]
//! (the default) tasks for the same identity wait their turn in delivery
//! order while other identities proceed. With [`Sequencing::Unordered`] two
//! facts for one identity may finish in either order.
//!
//! ## Settlement
//!
//! Success acks. Decode failures and handler failures nack without requeue:
//! the broker discards the message, or routes it to the queue's dead-letter
//! exchange when the topology declares one. Transient handler failures are
//! retried in-process first when `handler_retries > 0`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::BackoffBuilder;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::sequencer::{InFlight, KeyTicket, KeyedSequencer};
use super::{
    BusError, ConnectionManager, Delivery, DeliveryStream, EventHandler, HandlerError, Result,
};
use crate::events::{CodecError, InboundEvent};
use crate::utils::retry::handler_backoff;

/// Default consumer tag prefix.
pub const DEFAULT_CONSUMER_TAG: &str = "user-service";

/// Ordering policy for facts about the same identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sequencing {
    /// One fact at a time per identity, in delivery order.
    #[default]
    PerIdentity,
    /// No ordering; facts for one identity may be applied concurrently.
    Unordered,
}

/// Tunables for an [`EventConsumer`].
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Prefix of the consumer tag; a unique suffix is appended per subscription.
    pub consumer_tag: String,
    /// Unacknowledged deliveries allowed on the channel. Zero means unlimited.
    pub prefetch: u16,
    pub sequencing: Sequencing,
    /// How long `stop()` waits for running handlers.
    pub drain_timeout: Duration,
    /// Extra attempts for transient handler failures. Zero disables retry.
    pub handler_retries: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            prefetch: 64,
            sequencing: Sequencing::PerIdentity,
            drain_timeout: Duration::from_secs(10),
            handler_retries: 0,
        }
    }
}

/// Lifecycle of the consumer's subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed { tag: String },
    Cancelling { tag: String },
}

/// Per-delivery processing shared by all handler tasks.
struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    sequencer: Arc<KeyedSequencer>,
    sequencing: Sequencing,
    handler_retries: usize,
}

/// A delivery decoded and placed in line, ready to run on its own task.
struct Job {
    delivery: Delivery,
    event: std::result::Result<Arc<InboundEvent>, CodecError>,
    identity: Option<String>,
    ticket: Option<KeyTicket>,
}

impl Dispatcher {
    /// Decode and take a sequencing ticket. Runs on the delivery loop so
    /// tickets follow delivery order.
    fn admit(&self, delivery: Delivery) -> Job {
        let event = InboundEvent::decode(&delivery.data).map(Arc::new);
        let identity = event
            .as_ref()
            .ok()
            .and_then(|event| self.handler.identity(event));
        let ticket = match (self.sequencing, identity.as_deref()) {
            (Sequencing::PerIdentity, Some(id)) => Some(self.sequencer.ticket(id)),
            _ => None,
        };
        Job {
            delivery,
            event,
            identity,
            ticket,
        }
    }

    async fn process(&self, job: Job) {
        let Job {
            delivery,
            event,
            identity,
            ticket,
        } = job;
        let span = tracing::info_span!(
            "bus.consume",
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered
        );

        async {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "Discarding undecodable message");
                    settle(&delivery, false).await;
                    return;
                }
            };

            let _turn = match ticket {
                Some(ticket) => Some(ticket.wait().await),
                None => None,
            };

            debug!(identity = ?identity, event_type = %event.event_type, "Handling event");

            match self.invoke(event).await {
                Ok(()) => settle(&delivery, true).await,
                Err(e) => {
                    error!(
                        identity = ?identity,
                        error = %e,
                        "Error handling message, discarding"
                    );
                    settle(&delivery, false).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn invoke(&self, event: Arc<InboundEvent>) -> std::result::Result<(), HandlerError> {
        let mut delays = handler_backoff(self.handler_retries).build();
        loop {
            match self.handler.handle(Arc::clone(&event)).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => match delays.next() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            "Transient handler failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Ack on success, otherwise nack without requeue.
async fn settle(delivery: &Delivery, success: bool) {
    let result = if success {
        delivery.ack().await
    } else {
        delivery.nack(false).await
    };
    if let Err(e) = result {
        error!(error = %e, ack = success, "Failed to settle message");
    }
}

/// Subscribes a handler to the queue of its manager's topology.
pub struct EventConsumer {
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    settings: ConsumerSettings,
    state: Arc<Mutex<SubscriptionState>>,
    lifecycle: AsyncMutex<()>,
    in_flight: Arc<InFlight>,
    ended: watch::Sender<bool>,
    delivery_loop: Mutex<Option<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        handler: Arc<dyn EventHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        let dispatcher = Dispatcher {
            handler,
            sequencer: Arc::new(KeyedSequencer::new()),
            sequencing: settings.sequencing,
            handler_retries: settings.handler_retries,
        };
        let (ended, _) = watch::channel(false);
        Self {
            manager,
            dispatcher: Arc::new(dispatcher),
            settings,
            state: Arc::new(Mutex::new(SubscriptionState::Unsubscribed)),
            lifecycle: AsyncMutex::new(()),
            in_flight: Arc::new(InFlight::new()),
            ended,
            delivery_loop: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        lock(&self.state).clone()
    }

    /// Handler tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Declare topology and subscribe.
    ///
    /// A no-op when messaging is disabled or the consumer is already
    /// subscribed.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() != SubscriptionState::Unsubscribed {
            return Ok(());
        }

        let Some(channel) = self.manager.ensure_ready().await? else {
            warn!("Messaging disabled, event consumer not started");
            return Ok(());
        };

        let queue = self
            .manager
            .topology()
            .queue()
            .ok_or_else(|| {
                BusError::InvalidState("consumer topology declares no queue".to_string())
            })?
            .to_string();

        if self.settings.prefetch > 0 {
            channel.set_prefetch(self.settings.prefetch).await?;
        }

        let requested_tag = format!(
            "{}-{}",
            self.settings.consumer_tag,
            uuid::Uuid::new_v4().simple()
        );
        let subscription = channel.consume(&queue, &requested_tag).await?;
        let tag = subscription.tag;

        *lock(&self.state) = SubscriptionState::Subscribed { tag: tag.clone() };
        self.ended.send_replace(false);

        let handle = tokio::spawn(Self::run(
            subscription.deliveries,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.in_flight),
            Arc::clone(&self.state),
            self.ended.clone(),
        ));
        *lock(&self.delivery_loop) = Some(handle);

        info!(queue = %queue, consumer_tag = %tag, "Event consumer started");
        Ok(())
    }

    /// Cancel the subscription, drain running handlers, close the channel.
    ///
    /// The channel is closed even when cancellation fails, so no
    /// subscription outlives the connection.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let tag = {
            let mut state = lock(&self.state);
            match &*state {
                SubscriptionState::Subscribed { tag } => {
                    let tag = tag.clone();
                    *state = SubscriptionState::Cancelling { tag: tag.clone() };
                    Some(tag)
                }
                _ => None,
            }
        };

        let Some(tag) = tag else {
            return self.manager.close().await;
        };

        let cancelled = match self.manager.current().await {
            Some(channel) => channel.cancel(&tag).await,
            None => Ok(()),
        };
        if let Err(e) = &cancelled {
            warn!(consumer_tag = %tag, error = %e, "Failed to cancel subscription, closing connection anyway");
        }

        if !self.in_flight.drain(self.settings.drain_timeout).await {
            warn!(
                pending = self.in_flight.count(),
                timeout_secs = self.settings.drain_timeout.as_secs(),
                "Drain timed out, unsettled messages will be redelivered"
            );
        }

        let closed = self.manager.close().await;
        *lock(&self.state) = SubscriptionState::Unsubscribed;

        let delivery_loop = lock(&self.delivery_loop).take();
        if let Some(handle) = delivery_loop {
            handle.abort();
        }

        info!(consumer_tag = %tag, "Event consumer stopped");
        cancelled.and(closed)
    }

    /// Resolve when the subscription ends without `stop()` (channel closed
    /// by the broker or a delivery error).
    pub async fn closed(&self) {
        let mut ended = self.ended.subscribe();
        // The sender lives in `self`, so this only returns once flagged.
        let _ = ended.wait_for(|ended| *ended).await;
    }

    async fn run(
        mut deliveries: DeliveryStream,
        dispatcher: Arc<Dispatcher>,
        in_flight: Arc<InFlight>,
        state: Arc<Mutex<SubscriptionState>>,
        ended: watch::Sender<bool>,
    ) {
        while let Some(next) = deliveries.next().await {
            match next {
                Ok(delivery) => {
                    let guard = in_flight.enter();
                    let job = dispatcher.admit(delivery);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        dispatcher.process(job).await;
                        drop(guard);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Consumer delivery error");
                    break;
                }
            }
        }

        let mut state = lock(&state);
        if let SubscriptionState::Subscribed { tag } = &*state {
            warn!(consumer_tag = %tag, "Subscription ended unexpectedly");
            *state = SubscriptionState::Unsubscribed;
            ended.send_replace(true);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelBroker, MessageProperties, Role, Topology};
    use crate::events::{DomainEvent, AUTH_EVENTS_EXCHANGE, AUTH_USER_REGISTERED};
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler recording payload ids, failing per a closure.
    struct ScriptedHandler {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        fail: Box<dyn Fn(usize) -> Option<HandlerError> + Send + Sync>,
        delay: Duration,
    }

    impl ScriptedHandler {
        fn ok() -> Arc<Self> {
            Self::failing(|_| None)
        }

        fn failing(fail: impl Fn(usize) -> Option<HandlerError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                fail: Box::new(fail),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                fail: Box::new(|_| None),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl EventHandler for ScriptedHandler {
        fn handle(
            &self,
            event: Arc<InboundEvent>,
        ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen).push(event.payload_str("id").unwrap_or_default().to_string());
            let outcome = (self.fail)(call);
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match outcome {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
        }
    }

    struct Harness {
        broker: ChannelBroker,
        consumer: EventConsumer,
        manager: Arc<ConnectionManager>,
    }

    fn harness(url: Option<&str>, handler: Arc<dyn EventHandler>, settings: ConsumerSettings) -> Harness {
        let broker = ChannelBroker::new();
        let manager = Arc::new(ConnectionManager::new(
            Role::Consumer,
            url.map(str::to_owned),
            Arc::new(broker.clone()),
            Topology::default_auth_consumer(),
        ));
        let consumer = EventConsumer::new(Arc::clone(&manager), handler, settings);
        Harness {
            broker,
            consumer,
            manager,
        }
    }

    async fn publish_raw(broker: &ChannelBroker, body: Vec<u8>) {
        use crate::bus::Connector;
        let channel = broker
            .connect("memory://test", Arc::new(|_: BusError| {}))
            .await
            .unwrap();
        channel.declare_exchange(AUTH_EVENTS_EXCHANGE).await.unwrap();
        channel
            .publish(
                AUTH_EVENTS_EXCHANGE,
                AUTH_USER_REGISTERED,
                body,
                MessageProperties::persistent_json(AUTH_USER_REGISTERED),
            )
            .await
            .unwrap();
        channel.close().await.unwrap();
    }

    async fn publish_id(broker: &ChannelBroker, id: &str) {
        let event = DomainEvent::new(AUTH_USER_REGISTERED, json!({"id": id}));
        publish_raw(broker, event.encode().unwrap()).await;
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_start_disabled_is_noop() {
        let h = harness(None, ScriptedHandler::ok(), ConsumerSettings::default());

        h.consumer.start().await.unwrap();

        assert_eq!(h.consumer.state(), SubscriptionState::Unsubscribed);
        assert_eq!(h.broker.stats().connections, 0);
        assert_eq!(h.broker.stats().declarations, 0);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_subscribes_once() {
        let h = harness(Some("memory://local"), ScriptedHandler::ok(), ConsumerSettings::default());

        h.consumer.start().await.unwrap();
        h.consumer.start().await.unwrap();

        assert!(matches!(h.consumer.state(), SubscriptionState::Subscribed { ref tag } if tag.starts_with("user-service-")));
        assert_eq!(h.broker.consumer_count("auth-service.auth-events"), 1);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_success_acks() {
        let handler = ScriptedHandler::ok();
        let h = harness(Some("memory://local"), handler.clone(), ConsumerSettings::default());
        h.consumer.start().await.unwrap();

        publish_id(&h.broker, "u1").await;

        eventually(|| h.broker.stats().acked == 1).await;
        assert_eq!(handler.calls(), 1);
        assert_eq!(h.broker.queue_depth("auth-service.auth-events"), 0);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_nacks_once_without_redelivery() {
        let handler = ScriptedHandler::failing(|_| Some(HandlerError::Transient("db down".into())));
        let h = harness(Some("memory://local"), handler.clone(), ConsumerSettings::default());
        h.consumer.start().await.unwrap();

        publish_id(&h.broker, "u1").await;

        eventually(|| h.broker.stats().nacked == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = h.broker.stats();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.delivered, 1);
        assert_eq!(handler.calls(), 1);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_message_is_discarded() {
        let handler = ScriptedHandler::ok();
        let h = harness(Some("memory://local"), handler.clone(), ConsumerSettings::default());
        h.consumer.start().await.unwrap();

        publish_raw(&h.broker, b"{not json".to_vec()).await;

        eventually(|| h.broker.stats().nacked == 1).await;
        assert_eq!(handler.calls(), 0);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_budget() {
        let handler = ScriptedHandler::failing(|call| {
            (call < 2).then(|| HandlerError::Transient("timeout".into()))
        });
        let settings = ConsumerSettings {
            handler_retries: 3,
            ..Default::default()
        };
        let h = harness(Some("memory://local"), handler.clone(), settings);
        h.consumer.start().await.unwrap();

        publish_id(&h.broker, "u1").await;

        eventually(|| h.broker.stats().acked == 1).await;
        assert_eq!(handler.calls(), 3);
        assert_eq!(h.broker.stats().nacked, 0);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let handler = ScriptedHandler::failing(|_| Some(HandlerError::Permanent("bad".into())));
        let settings = ConsumerSettings {
            handler_retries: 3,
            ..Default::default()
        };
        let h = harness(Some("memory://local"), handler.clone(), settings);
        h.consumer.start().await.unwrap();

        publish_id(&h.broker, "u1").await;

        eventually(|| h.broker.stats().nacked == 1).await;
        assert_eq!(handler.calls(), 1);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_deliveries_are_not_processed_sequentially() {
        let handler = ScriptedHandler::slow(Duration::from_millis(100));
        let settings = ConsumerSettings {
            sequencing: Sequencing::Unordered,
            ..Default::default()
        };
        let h = harness(Some("memory://local"), handler.clone(), settings);
        h.consumer.start().await.unwrap();

        for id in ["u1", "u2", "u3"] {
            publish_id(&h.broker, id).await;
        }

        eventually(|| h.consumer.in_flight() == 3).await;
        eventually(|| h.broker.stats().acked == 3).await;
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_per_identity_sequencing_serializes_same_identity() {
        let handler = ScriptedHandler::slow(Duration::from_millis(150));
        let h = harness(Some("memory://local"), handler.clone(), ConsumerSettings::default());
        h.consumer.start().await.unwrap();

        publish_id(&h.broker, "u1").await;
        publish_id(&h.broker, "u1").await;
        publish_id(&h.broker, "u2").await;

        // u1's second fact waits for the first, u2 runs alongside.
        eventually(|| handler.calls() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.calls(), 2);
        eventually(|| h.broker.stats().acked == 3).await;
        assert_eq!(lock(&handler.seen).as_slice(), ["u1", "u2", "u1"]);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_drains_and_closes() {
        let handler = ScriptedHandler::slow(Duration::from_millis(50));
        let h = harness(Some("memory://local"), handler.clone(), ConsumerSettings::default());
        h.consumer.start().await.unwrap();
        publish_id(&h.broker, "u1").await;
        eventually(|| h.consumer.in_flight() == 1).await;

        h.consumer.stop().await.unwrap();

        assert_eq!(h.consumer.state(), SubscriptionState::Unsubscribed);
        assert_eq!(h.consumer.in_flight(), 0);
        assert_eq!(h.broker.stats().acked, 1);
        assert_eq!(h.broker.consumer_count("auth-service.auth-events"), 0);
        assert!(h.manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_after_drain_timeout_leaves_message_for_redelivery() {
        let handler = ScriptedHandler::slow(Duration::from_secs(5));
        let settings = ConsumerSettings {
            drain_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let h = harness(Some("memory://local"), handler.clone(), settings);
        h.consumer.start().await.unwrap();
        publish_id(&h.broker, "u1").await;
        eventually(|| h.consumer.in_flight() == 1).await;

        h.consumer.stop().await.unwrap();

        assert_eq!(h.broker.queue_depth("auth-service.auth-events"), 1);
        assert_eq!(h.broker.stats().acked, 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let handler = ScriptedHandler::ok();
        let h = harness(Some("memory://local"), handler.clone(), ConsumerSettings::default());
        h.consumer.start().await.unwrap();
        h.consumer.stop().await.unwrap();

        h.consumer.start().await.unwrap();
        publish_id(&h.broker, "u9").await;

        eventually(|| h.broker.stats().acked == 1).await;
        assert_eq!(h.manager.established_count(), 2);
        h.consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_resolves_when_broker_closes_connection() {
        let h = harness(Some("memory://local"), ScriptedHandler::ok(), ConsumerSettings::default());
        h.consumer.start().await.unwrap();

        h.broker.close_connections();

        tokio::time::timeout(Duration::from_secs(1), h.consumer.closed())
            .await
            .expect("closed() should resolve");
        assert_eq!(h.consumer.state(), SubscriptionState::Unsubscribed);
    }
}
