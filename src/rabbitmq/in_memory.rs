//! An in-process broker implementing the client traits.
//!
//! It keeps the parts of the broker contract the consumer and publisher rely
//! on: declaration conflicts close the channel, delivery tags are per channel,
//! unacknowledged messages are requeued when their channel closes, and a
//! mandatory publish with no route is refused. Tests use the hooks on
//! [`InMemoryBroker`] to refuse connections, drop connections or close a
//! consumer's channel from the broker side.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::BasicProperties;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryMetadata, DeliveryStream,
    DeliveryTag,
};
use super::errors::{RabbitMQError, Result};
use super::topology::{ExchangeDeclaration, ExchangeType, QueueDeclaration};

/// A message as it was handed to the broker by a publisher.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub mandatory: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerEntry {
    channel: u64,
    tag: String,
    sender: UnboundedSender<Result<Delivery>>,
}

struct QueueEntry {
    declaration: QueueDeclaration,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ConnectionEntry {
    open: bool,
    channels: Vec<u64>,
}

struct ChannelEntry {
    open: bool,
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: HashMap<DeliveryTag, (String, StoredMessage)>,
}

#[derive(Default)]
struct BrokerState {
    refusal: Option<String>,
    next_id: u64,
    connections_opened: usize,
    channels_opened: usize,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueEntry>,
    exchanges: HashMap<String, ExchangeDeclaration>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    acked: usize,
    rejected: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).map_or(false, |c| c.open)
    }

    fn ensure_open(&self, channel: u64) -> Result<()> {
        if self.channel_open(channel) {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelClosed(format!("channel {} is closed", channel)))
        }
    }

    /// Closes a channel, requeueing its unacknowledged messages. `reason` is
    /// set when the broker initiates the close; its consumers then see an
    /// error item before their stream ends.
    fn close_channel(&mut self, channel: u64, reason: Option<&str>) {
        let unacked = match self.channels.get_mut(&channel) {
            Some(entry) if entry.open => {
                entry.open = false;
                std::mem::take(&mut entry.unacked)
            }
            _ => return,
        };

        let mut touched: Vec<String> = Vec::new();
        let mut requeued: Vec<(DeliveryTag, String, StoredMessage)> = unacked
            .into_iter()
            .map(|(tag, (queue, message))| (tag, queue, message))
            .collect();
        // Oldest delivery ends up at the head of the queue.
        requeued.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, queue, mut message) in requeued {
            if let Some(entry) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                entry.ready.push_front(message);
                touched.push(queue);
            }
        }

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                if consumer.channel != channel {
                    return true;
                }
                if let Some(reason) = reason {
                    let _ = consumer
                        .sender
                        .send(Err(RabbitMQError::ChannelClosed(reason.to_string())));
                }
                false
            });
            if queue.consumers.len() != before {
                touched.push(name.clone());
            }
        }

        for queue in touched {
            self.dispatch(&queue);
        }
    }

    /// Hands ready messages to consumers whose channel has prefetch room.
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState { queues, channels, .. } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let position = queue.consumers.iter().position(|consumer| {
                channels.get(&consumer.channel).map_or(false, |c| {
                    c.open && (c.prefetch == 0 || c.unacked.len() < c.prefetch as usize)
                })
            });
            let Some(position) = position else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let consumer = &queue.consumers[position];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                queue.ready.push_front(message);
                return;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = Delivery {
                metadata: DeliveryMetadata {
                    delivery_tag: tag,
                    consumer_tag: consumer.tag.clone(),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                },
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_ok() {
                channel.unacked.insert(tag, (queue_name.to_string(), message));
                // Round-robin across consumers.
                let consumer = queue.consumers.remove(position);
                queue.consumers.push(consumer);
            } else {
                queue.ready.push_front(message);
                queue.consumers.remove(position);
            }
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }

        let fanout = self
            .exchanges
            .get(exchange)
            .map_or(false, |e| e.kind == ExchangeType::Fanout);
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && (fanout || b.routing_key == routing_key))
            .map(|b| b.queue.clone())
            .collect();
        // A queue gets one copy however many of its bindings match.
        targets.sort();
        targets.dedup();
        targets
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(entry) = self.queues.get_mut(queue) {
            entry.ready.push_back(message);
            self.dispatch(queue);
        }
    }
}

/// Handle to a shared in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes subsequent connection attempts fail with `reason`.
    pub fn refuse_connections(&self, reason: &str) {
        self.lock().refusal = Some(reason.to_string());
    }

    pub fn accept_connections(&self) {
        self.lock().refusal = None;
    }

    /// Closes every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            close_connection(&mut state, id, Some("CONNECTION_FORCED"));
        }
    }

    /// Closes, from the broker side, every channel consuming from `queue`.
    /// Returns how many channels were closed.
    pub fn close_consumer_channels(&self, queue: &str) -> usize {
        let mut state = self.lock();
        let mut channels: Vec<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.channel).collect())
            .unwrap_or_default();
        channels.sort_unstable();
        channels.dedup();
        for channel in &channels {
            state.close_channel(*channel, Some("CHANNEL_ERROR - closed by broker"));
        }
        channels.len()
    }

    /// Declares a queue directly, as another application would have.
    pub fn declare_queue(&self, queue: QueueDeclaration) {
        let mut state = self.lock();
        state.queues.entry(queue.name.clone()).or_insert(QueueEntry {
            declaration: queue,
            ready: VecDeque::new(),
            consumers: Vec::new(),
        });
    }

    /// Places a message on `queue` through the default exchange.
    pub fn inject(&self, queue: &str, body: &[u8]) {
        let mut state = self.lock();
        state.enqueue(
            queue,
            StoredMessage {
                exchange: String::new(),
                routing_key: queue.to_string(),
                properties: BasicProperties::default(),
                body: body.to_vec(),
                redelivered: false,
            },
        );
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Messages waiting on `queue` that have not been delivered.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Consumers currently registered on `queue`.
    pub fn consumers(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn rejected(&self) -> usize {
        self.lock().rejected
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.open).count()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|c| c.open).count()
    }
}

fn close_connection(state: &mut BrokerState, id: u64, reason: Option<&str>) {
    let channels = match state.connections.get_mut(&id) {
        Some(entry) if entry.open => {
            entry.open = false;
            entry.channels.clone()
        }
        _ => return,
    };
    for channel in channels {
        state.close_channel(channel, reason);
    }
}

#[async_trait]
impl AmqpConnector for InMemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn AmqpConnection>> {
        let mut state = self.lock();
        if let Some(reason) = &state.refusal {
            return Err(RabbitMQError::ConnectionError(format!(
                "Failed to connect to {}: {}",
                uri, reason
            )));
        }
        let id = state.next_id();
        state.connections_opened += 1;
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                channels: Vec::new(),
            },
        );
        debug!(connection = id, "In-memory broker accepted connection");
        Ok(Arc::new(InMemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

pub struct InMemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl AmqpConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .map_or(false, |c| c.open)
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        let mut state = self.broker.lock();
        let id = state.next_id();
        match state.connections.get_mut(&self.id) {
            Some(connection) if connection.open => connection.channels.push(id),
            _ => {
                return Err(RabbitMQError::ConnectionError(format!(
                    "connection {} is closed",
                    self.id
                )))
            }
        }
        state.channels_opened += 1;
        state.channels.insert(
            id,
            ChannelEntry {
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(Box::new(InMemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        close_connection(&mut self.broker.lock(), self.id, None);
        Ok(())
    }
}

pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().channel_open(self.id)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.broker.lock().ensure_open(self.id)
    }

    async fn queue_declare(&self, queue: &QueueDeclaration) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let error = match state.queues.get(&queue.name) {
            Some(_) if queue.passive => return Ok(()),
            Some(existing) if existing.declaration.conflicts_with(queue) => format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                queue.name
            ),
            Some(_) => return Ok(()),
            None if queue.passive => format!("NOT_FOUND - no queue '{}'", queue.name),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueEntry {
                        declaration: queue.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                    },
                );
                return Ok(());
            }
        };

        state.close_channel(self.id, None);
        Err(RabbitMQError::DeclarationError(error))
    }

    async fn exchange_declare(&self, exchange: &ExchangeDeclaration) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let error = match state.exchanges.get(&exchange.name) {
            Some(_) if exchange.passive => return Ok(()),
            Some(existing) if existing.conflicts_with(exchange) => format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                exchange.name
            ),
            Some(_) => return Ok(()),
            None if exchange.passive => format!("NOT_FOUND - no exchange '{}'", exchange.name),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                return Ok(());
            }
        };

        state.close_channel(self.id, None);
        Err(RabbitMQError::DeclarationError(error))
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            state.close_channel(self.id, None);
            return Err(RabbitMQError::DeclarationError(format!(
                "NOT_FOUND - cannot bind queue '{}' to exchange '{}'",
                queue, exchange
            )));
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) {
            state.close_channel(self.id, None);
            return Err(RabbitMQError::ConsumeError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.consumers.push(ConsumerEntry {
                channel: self.id,
                tag: consumer_tag.to_string(),
                sender,
            });
        }
        state.dispatch(queue);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        let acked = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        match acked {
            Some((queue, _)) => {
                state.acked += 1;
                state.dispatch(&queue);
                Ok(())
            }
            None => {
                state.close_channel(self.id, None);
                Err(RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
    }

    async fn basic_reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        let rejected = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        match rejected {
            Some((queue, mut message)) => {
                state.rejected += 1;
                if requeue {
                    message.redelivered = true;
                    if let Some(entry) = state.queues.get_mut(&queue) {
                        entry.ready.push_front(message);
                    }
                }
                state.dispatch(&queue);
                Ok(())
            }
            None => {
                state.close_channel(self.id, None);
                Err(RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            state.close_channel(self.id, None);
            return Err(RabbitMQError::PublishError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: payload.to_vec(),
            mandatory,
        });

        let targets = state.route(exchange, routing_key);
        if targets.is_empty() && mandatory {
            return Err(RabbitMQError::PublishError(format!(
                "NO_ROUTE - message to exchange '{}' with routing key '{}' was returned",
                exchange, routing_key
            )));
        }
        for queue in targets {
            state.enqueue(
                &queue,
                StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: properties.clone(),
                    body: payload.to_vec(),
                    redelivered: false,
                },
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id, None);
        Ok(())
    }
}
