//! In-process broker for standalone mode and testing.
//!
//! Emulates the parts of an AMQP broker this crate relies on: durable topic
//! exchanges, queues with bindings, manual acknowledgment, redelivery of
//! unsettled messages when a channel closes, and dead-letter routing on
//! non-requeueing nacks. Selected with `memory://` broker URLs.
//!
//! Every [`ChannelBroker::connect`] call yields one link, the equivalent of
//! one connection with one channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tracing::{debug, info};

use super::{
    Acker, BrokerChannel, BusError, Connector, Delivery, ErrorHook, MessageProperties, Result,
    Subscription,
};


/// Counters for observing broker behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: u64,
    pub declarations: u64,
    pub published: u64,
    pub unroutable: u64,
    pub rejected_publishes: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
}

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules:
/// - Words are separated by `.`
/// - `*` matches exactly one word
/// - `#` matches zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    link: u64,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Unacked {
    link: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    next_consumer: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

struct LinkEntry {
    open: bool,
    prefetch: u16,
    on_error: ErrorHook,
}

#[derive(Default)]
struct BrokerState {
    /// Handed to ackers so settlements reach this state.
    self_ref: Weak<Mutex<BrokerState>>,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    links: HashMap<u64, LinkEntry>,
    next_link: u64,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
    reject_publishes: bool,
    refuse_connections: bool,
    stats: BrokerStats,
}

impl BrokerState {
    fn link_open(&self, link: u64) -> bool {
        self.links.get(&link).map(|l| l.open).unwrap_or(false)
    }

    fn route(&mut self, exchange: &str, message: StoredMessage) {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        if targets.is_empty() {
            self.stats.unroutable += 1;
            debug!(exchange = %exchange, routing_key = %message.routing_key, "Unroutable message dropped");
            return;
        }

        for queue in targets {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
            }
            self.dispatch(&queue);
        }
    }

    /// Hand ready messages to consumers round-robin, honoring each link's prefetch.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(mut queue) = self.queues.remove(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let eligible = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    let link = queue.consumers[idx].link;
                    let limit = self.links.get(&link).map(|l| l.prefetch).unwrap_or(0);
                    limit == 0
                        || queue.unacked.values().filter(|u| u.link == link).count()
                            < usize::from(limit)
                });
            let Some(idx) = eligible else {
                break;
            };
            queue.next_consumer = (idx + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let acker = ChannelAcker {
                state: Weak::clone(&self.self_ref),
                queue: queue_name.to_string(),
                delivery_tag: tag,
            };
            let delivery = Delivery::new(
                message.payload.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.properties.clone(),
                Box::new(acker),
            );

            let slot = &queue.consumers[idx];
            let link = slot.link;
            match slot.tx.unbounded_send(Ok(delivery)) {
                Ok(()) => {
                    queue.unacked.insert(tag, Unacked { link, message });
                    self.stats.delivered += 1;
                }
                Err(_) => {
                    // Receiver dropped: forget the consumer, keep the message.
                    queue.consumers.remove(idx);
                    queue.ready.push_front(message);
                    queue.next_consumer = 0;
                }
            }
        }

        self.queues.insert(queue_name.to_string(), queue);
    }

    fn settle(&mut self, queue_name: &str, delivery_tag: u64, outcome: Settlement) -> Result<()> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BusError::Acknowledge(format!("unknown queue '{}'", queue_name)))?;
        let unacked = queue.unacked.remove(&delivery_tag).ok_or_else(|| {
            BusError::Acknowledge(format!("unknown delivery tag {}", delivery_tag))
        })?;
        let dead_letter_exchange = queue.dead_letter_exchange.clone();

        match outcome {
            Settlement::Ack => {
                self.stats.acked += 1;
            }
            Settlement::Nack { requeue: true } => {
                self.stats.nacked += 1;
                self.stats.requeued += 1;
                let mut message = unacked.message;
                message.redelivered = true;
                if let Some(q) = self.queues.get_mut(queue_name) {
                    q.ready.push_front(message);
                }
            }
            Settlement::Nack { requeue: false } => {
                self.stats.nacked += 1;
                match dead_letter_exchange {
                    Some(exchange) => {
                        self.stats.dead_lettered += 1;
                        let mut message = unacked.message;
                        message.redelivered = false;
                        self.route(&exchange, message);
                    }
                    None => {
                        self.stats.discarded += 1;
                    }
                }
            }
        }

        // A settlement frees prefetch capacity.
        self.dispatch(queue_name);
        Ok(())
    }

    /// Close a link: drop its consumers and requeue what it left unsettled.
    fn close_link(&mut self, link: u64) -> Option<ErrorHook> {
        let entry = self.links.get_mut(&link)?;
        if !entry.open {
            return None;
        }
        entry.open = false;
        let hook = Arc::clone(&entry.on_error);

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.consumers.retain(|c| c.link != link);
                queue.next_consumer = 0;

                let mut returned: Vec<(u64, StoredMessage)> = queue
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.link == link)
                    .map(|(tag, u)| (*tag, u.message.clone()))
                    .collect();
                returned.sort_by_key(|(tag, _)| *tag);
                for (tag, _) in &returned {
                    queue.unacked.remove(tag);
                }
                for (_, mut message) in returned.into_iter().rev() {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        for name in &names {
            self.dispatch(name);
        }

        Some(hook)
    }
}

enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// In-process broker shared by every link connected to it.
#[derive(Clone)]
pub struct ChannelBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|weak| {
            Mutex::new(BrokerState {
                self_ref: Weak::clone(weak),
                ..Default::default()
            })
        });
        Self { state }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    /// Close every open link cleanly. Consumers' streams end; unsettled
    /// messages return to their queues flagged as redelivered.
    pub fn close_connections(&self) {
        let mut state = self.lock();
        let links: Vec<u64> = state.links.keys().copied().collect();
        for link in links {
            state.close_link(link);
        }
        info!("Channel broker closed all connections");
    }

    /// Fail every open link with a transport error.
    pub fn fail_connections(&self, reason: &str) {
        let hooks: Vec<ErrorHook> = {
            let mut state = self.lock();
            let links: Vec<u64> = state.links.keys().copied().collect();
            links
                .into_iter()
                .filter_map(|link| state.close_link(link))
                .collect()
        };
        // Hooks run outside the lock; they may call back into the broker.
        for hook in hooks {
            hook(BusError::Connection(reason.to_string()));
        }
    }

    /// Make publishes fail locally, as under flow control.
    pub fn set_reject_publishes(&self, reject: bool) {
        self.lock().reject_publishes = reject;
    }

    /// Make new connections fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting for delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet settled.
    #[cfg(test)]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Binding patterns of a queue, in declaration order.
    pub fn bindings_for(&self, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    pub fn dead_letter_exchange_of(&self, queue: &str) -> Option<String> {
        self.lock()
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone())
    }

    /// Remove and return the payloads waiting in `queue`.
    pub fn drain_queue(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.payload).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for ChannelBroker {
    async fn connect(&self, _url: &str, on_error: ErrorHook) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(BusError::Connection("connection refused".to_string()));
        }
        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(
            id,
            LinkEntry {
                open: true,
                prefetch: 0,
                on_error,
            },
        );
        state.stats.connections += 1;
        debug!(link = id, "Channel broker link opened");

        Ok(Arc::new(ChannelLink {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// One connection plus channel on a [`ChannelBroker`].
pub struct ChannelLink {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl ChannelLink {
    fn lock_open(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.link_open(self.id) {
            Ok(state)
        } else {
            Err(BusError::Closed)
        }
    }
}

#[async_trait]
impl BrokerChannel for ChannelLink {
    fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .link_open(self.id)
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.lock_open()?;
        state.exchanges.insert(name.to_string());
        state.stats.declarations += 1;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        let mut state = self.lock_open()?;
        state.stats.declarations += 1;
        match state.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange.as_deref() != dead_letter_exchange => {
                Err(BusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange' for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        dead_letter_exchange: dead_letter_exchange.map(str::to_owned),
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock_open()?;
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Topology(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("no queue '{}'", queue)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        state.stats.declarations += 1;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.lock_open()?;
        if let Some(link) = state.links.get_mut(&self.id) {
            link.prefetch = count;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let mut state = self.lock_open()?;
        if state.reject_publishes {
            state.stats.rejected_publishes += 1;
            return Err(BusError::Publish("send buffer full".to_string()));
        }
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Publish(format!("no exchange '{}'", exchange)));
        }
        state.stats.published += 1;
        state.route(
            exchange,
            StoredMessage {
                routing_key: routing_key.to_string(),
                payload,
                properties,
                redelivered: false,
            },
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, tag: &str) -> Result<Subscription> {
        let mut state = self.lock_open()?;
        if !state.queues.contains_key(queue) {
            return Err(BusError::Subscribe(format!("no queue '{}'", queue)));
        }

        let tag = if tag.is_empty() {
            state.next_consumer_tag += 1;
            format!("amq.ctag-{}", state.next_consumer_tag)
        } else {
            tag.to_string()
        };
        let duplicate = state
            .queues
            .values()
            .any(|q| q.consumers.iter().any(|c| c.tag == tag));
        if duplicate {
            return Err(BusError::Subscribe(format!("consumer tag '{}' in use", tag)));
        }

        let (tx, rx) = mpsc::unbounded();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                link: self.id,
                tx,
            });
        }
        state.dispatch(queue);

        Ok(Subscription {
            tag,
            deliveries: rx.boxed(),
        })
    }

    async fn cancel(&self, tag: &str) -> Result<()> {
        let mut state = self.lock_open()?;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != tag);
            queue.next_consumer = 0;
        }
        debug!(consumer_tag = %tag, "Channel broker consumer cancelled");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.close_link(self.id);
        Ok(())
    }
}

/// Settles deliveries against the broker's queue state.
struct ChannelAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
}

impl ChannelAcker {
    fn settle(&self, outcome: Settlement) -> Result<()> {
        let state = self.state.upgrade().ok_or(BusError::Closed)?;
        let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
        state.settle(&self.queue, self.delivery_tag, outcome)
    }
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Settlement::Nack { requeue })
    }
}
