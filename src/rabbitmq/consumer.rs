//! Queue consumer with a bounded restart on broker-closed channels.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::BasicProperties;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, Delivery, DeliveryMetadata, DeliveryStream, DeliveryTag};
use super::channel_manager::{open_channel, ChannelConfig};
use super::connection::{BrokerConnection, ConnectionManager};
use super::errors::{RabbitMQError, Result};
use super::topology::{ExchangeDeclaration, QueueDeclaration};

/// What the consumer should do with a delivery once the handler is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Reject { requeue: bool },
}

/// Business logic for one queue.
///
/// Deliveries are handed over one at a time, in the order the broker sent
/// them. The body is raw bytes; decoding is up to the handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        metadata: &DeliveryMetadata,
        properties: &BasicProperties,
        body: &[u8],
    ) -> AckDecision;

    /// A name for the handler, used for logging.
    fn handler_name(&self) -> &str {
        "handler"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initialized,
    Declaring,
    /// Queue and exchange exist; not consuming yet.
    Declared,
    Consuming,
    ChannelClosed,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub queue: QueueDeclaration,
    pub exchange: ExchangeDeclaration,
    pub channel: ChannelConfig,
    /// Channel reopen attempts allowed over the consumer's lifetime.
    pub restart_limit: u32,
    /// Defaults to `{queue}-{random}`.
    pub consumer_tag: Option<String>,
}

impl ConsumerOptions {
    /// A durable queue and a transient fanout exchange, one channel restart.
    pub fn new(queue_name: &str, exchange_name: &str) -> Self {
        Self {
            queue: QueueDeclaration::new(queue_name),
            exchange: ExchangeDeclaration::new(exchange_name),
            channel: ChannelConfig::for_consumer(),
            restart_limit: 1,
            consumer_tag: None,
        }
    }

    pub fn queue(mut self, queue: QueueDeclaration) -> Self {
        self.queue = queue;
        self
    }

    pub fn exchange(mut self, exchange: ExchangeDeclaration) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn restart_limit(mut self, restart_limit: u32) -> Self {
        self.restart_limit = restart_limit;
        self
    }

    pub fn consumer_tag(mut self, consumer_tag: &str) -> Self {
        self.consumer_tag = Some(consumer_tag.to_string());
        self
    }
}

pub struct RabbitConsumer<H: MessageHandler> {
    connection: Arc<BrokerConnection>,
    channel: Box<dyn AmqpChannel>,
    options: ConsumerOptions,
    consumer_tag: String,
    handler: H,
    state: ConsumerState,
    pending_delivery: Option<DeliveryTag>,
    restarts: u32,
}

impl<H: MessageHandler> RabbitConsumer<H> {
    /// Takes the shared connection, opens a channel and declares the queue,
    /// then the exchange.
    ///
    /// A declaration the broker refuses fails with `DeclarationError`; the
    /// channel is closed first.
    pub async fn new(manager: &ConnectionManager, options: ConsumerOptions, handler: H) -> Result<Self> {
        let connection = manager.get_consumer_connection().await?;
        let channel = open_channel(&connection, &options.channel).await?;

        let consumer_tag = options.consumer_tag.clone().unwrap_or_else(|| {
            format!("{}-{}", options.queue.name, &Uuid::new_v4().to_string()[..8])
        });

        let mut consumer = RabbitConsumer {
            connection,
            channel,
            options,
            consumer_tag,
            handler,
            state: ConsumerState::Initialized,
            pending_delivery: None,
            restarts: 0,
        };

        if let Err(e) = consumer.declare().await {
            error!(queue = %consumer.options.queue.name, "Declaration failed: {}", e);
            consumer.stop().await;
            return Err(e);
        }
        consumer.state = ConsumerState::Declared;
        Ok(consumer)
    }

    async fn declare(&mut self) -> Result<()> {
        self.state = ConsumerState::Declaring;

        info!("About to declare queue: {}", self.options.queue.name);
        self.channel.queue_declare(&self.options.queue).await?;

        self.channel.exchange_declare(&self.options.exchange).await?;
        info!(
            "Queue '{}' and exchange '{}' declared",
            self.options.queue.name, self.options.exchange.name
        );
        Ok(())
    }

    /// Binds the declared queue to the declared exchange.
    pub async fn bind(&self, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(&self.options.queue.name, &self.options.exchange.name, routing_key)
            .await?;
        info!(
            "Queue '{}' bound to exchange '{}' with routing key '{}'",
            self.options.queue.name, self.options.exchange.name, routing_key
        );
        Ok(())
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn queue_name(&self) -> &str {
        &self.options.queue.name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn pending_delivery(&self) -> Option<DeliveryTag> {
        self.pending_delivery
    }

    /// Consumes until the channel fails beyond recovery or the broker cancels
    /// the consumer.
    pub async fn start_consume(&mut self) -> Result<()> {
        self.start_consume_until(std::future::pending()).await
    }

    /// Consumes until `shutdown` resolves. Shutdown is checked between
    /// deliveries; a delivery being handled is finished first.
    pub async fn start_consume_until<S>(&mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let mut deliveries = match self.register().await {
            Ok(deliveries) => deliveries,
            Err(RabbitMQError::ChannelClosed(reason)) => self.restart(reason).await?,
            Err(e) => {
                self.state = ConsumerState::Stopped;
                return Err(e);
            }
        };
        self.state = ConsumerState::Consuming;

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(queue = %self.options.queue.name, "Shutdown requested, stopping consumer");
                    self.stop().await;
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let outcome = match next {
                Some(Ok(delivery)) => self.dispatch(delivery).await,
                Some(Err(e)) => Err(e),
                None if !self.channel.is_open() => Err(RabbitMQError::ChannelClosed(
                    "delivery stream ended with the channel closed".to_string(),
                )),
                None => {
                    info!(queue = %self.options.queue.name, "Consumer cancelled by broker");
                    self.state = ConsumerState::Stopped;
                    return Ok(());
                }
            };

            match outcome {
                Ok(()) => {}
                Err(RabbitMQError::ChannelClosed(reason)) => {
                    deliveries = self.restart(reason).await?;
                }
                Err(e) => {
                    error!(queue = %self.options.queue.name, "Consumer failed: {}", e);
                    self.state = ConsumerState::Stopped;
                    return Err(e);
                }
            }
        }
    }

    async fn register(&self) -> Result<DeliveryStream> {
        let deliveries = self
            .channel
            .basic_consume(&self.options.queue.name, &self.consumer_tag)
            .await?;
        info!(
            queue = %self.options.queue.name,
            consumer_tag = %self.consumer_tag,
            handler = %self.handler.handler_name(),
            "Started consuming"
        );
        Ok(deliveries)
    }

    async fn dispatch(&mut self, delivery: Delivery) -> Result<()> {
        let Delivery {
            metadata,
            properties,
            body,
        } = delivery;
        self.pending_delivery = Some(metadata.delivery_tag);

        match self.handler.handle(&metadata, &properties, &body).await {
            AckDecision::Ack => self.ack().await,
            AckDecision::Reject { requeue } => self.reject(requeue).await,
        }
    }

    // Reopens a channel on the same connection and registers again. Beyond
    // `restart_limit` the closure is returned to the caller.
    async fn restart(&mut self, reason: String) -> Result<DeliveryStream> {
        self.state = ConsumerState::ChannelClosed;
        self.pending_delivery = None;

        if self.restarts >= self.options.restart_limit {
            error!(
                queue = %self.options.queue.name,
                restarts = self.restarts,
                "Channel closed again, giving up: {}", reason
            );
            self.state = ConsumerState::Stopped;
            return Err(RabbitMQError::ChannelClosed(reason));
        }

        warn!(
            queue = %self.options.queue.name,
            "Queue {}: Channel has been closed ({}), restart", self.options.queue.name, reason
        );
        self.restarts += 1;
        self.state = ConsumerState::Reconnecting;

        match self.reopen().await {
            Ok(deliveries) => {
                self.state = ConsumerState::Consuming;
                Ok(deliveries)
            }
            Err(e) => {
                error!(queue = %self.options.queue.name, "Channel restart failed: {}", e);
                self.state = ConsumerState::Stopped;
                Err(e)
            }
        }
    }

    async fn reopen(&mut self) -> Result<DeliveryStream> {
        self.channel = open_channel(&self.connection, &self.options.channel).await?;
        self.register().await
    }

    /// Acknowledges the delivery currently being handled.
    pub async fn ack(&mut self) -> Result<()> {
        let delivery_tag = self
            .pending_delivery
            .take()
            .ok_or(RabbitMQError::NoPendingDelivery)?;
        if !self.channel.is_open() {
            return Err(RabbitMQError::ChannelClosed(format!(
                "cannot ack delivery {} on a closed channel",
                delivery_tag
            )));
        }
        info!(queue = %self.options.queue.name, delivery_tag, "Ack");
        self.channel.basic_ack(delivery_tag).await
    }

    /// Rejects the delivery currently being handled.
    pub async fn reject(&mut self, requeue: bool) -> Result<()> {
        let delivery_tag = self
            .pending_delivery
            .take()
            .ok_or(RabbitMQError::NoPendingDelivery)?;
        if !self.channel.is_open() {
            return Err(RabbitMQError::ChannelClosed(format!(
                "cannot reject delivery {} on a closed channel",
                delivery_tag
            )));
        }
        info!(queue = %self.options.queue.name, delivery_tag, requeue, "Reject");
        self.channel.basic_reject(delivery_tag, requeue).await
    }

    async fn stop(&mut self) {
        self.state = ConsumerState::Stopped;
        if let Err(e) = self.channel.close().await {
            warn!(queue = %self.options.queue.name, "Failed to close channel: {}", e);
        }
    }

    /// Closes this consumer's channel. The shared connection stays open for
    /// other consumers.
    pub async fn close(self) -> Result<()> {
        self.channel.close().await
    }
}
