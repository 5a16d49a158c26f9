// src/rabbitmq/amqp_client.rs

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

use super::errors::Result;
use super::topology::{ExchangeDeclaration, QueueDeclaration};

/// Identifies one delivery on one channel.
pub type DeliveryTag = u64;

/// Stream of deliveries for a registered consumer.
///
/// An `Err(RabbitMQError::ChannelClosed(_))` item means the broker closed the
/// channel under the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Broker-side envelope of a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub delivery_tag: DeliveryTag,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub metadata: DeliveryMetadata,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// Opens transport sessions to a broker.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Operations performed on a single channel.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    async fn queue_declare(&self, queue: &QueueDeclaration) -> Result<()>;

    async fn exchange_declare(&self, exchange: &ExchangeDeclaration) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<()>;

    async fn basic_reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Publishes and, when confirms are enabled, waits for the broker's verdict.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
