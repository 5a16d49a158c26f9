// src/rabbitmq/lapin_client.rs
// Production implementation of the client traits over lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueBindOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::debug;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryMetadata, DeliveryStream,
    DeliveryTag,
};
use super::errors::{RabbitMQError, Result};
use super::topology::{ExchangeDeclaration, QueueDeclaration};

#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn AmqpConnection>> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;
        Ok(Arc::new(LapinConnection { connection }))
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        let channel = self.connection.create_channel().await.map_err(|e| {
            if self.is_open() {
                RabbitMQError::ChannelError(format!("Failed to create channel: {}", e))
            } else {
                RabbitMQError::ConnectionError(format!("Failed to create channel: {}", e))
            }
        })?;
        debug!(channel_id = channel.id(), "Opened lapin channel");
        Ok(Box::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(200, "Closing connection")
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))
    }
}

pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    // A failed operation on a channel the broker has since closed is a channel closure.
    fn classify(&self, error: lapin::Error, wrap: fn(String) -> RabbitMQError) -> RabbitMQError {
        if self.channel.status().connected() {
            wrap(error.to_string())
        } else {
            match RabbitMQError::from(error) {
                RabbitMQError::ChannelClosed(text) => RabbitMQError::ChannelClosed(text),
                other => wrap(other.to_string()),
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })
    }

    async fn queue_declare(&self, queue: &QueueDeclaration) -> Result<()> {
        self.channel
            .queue_declare(&queue.name, queue.options(), queue.arguments.clone())
            .await
            .map_err(|e| {
                RabbitMQError::DeclarationError(format!(
                    "Failed to declare queue '{}': {}",
                    queue.name, e
                ))
            })?;
        Ok(())
    }

    async fn exchange_declare(&self, exchange: &ExchangeDeclaration) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.into(),
                exchange.options(),
                exchange.arguments.clone(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::DeclarationError(format!(
                    "Failed to declare exchange '{}': {}",
                    exchange.name, e
                ))
            })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::DeclarationError(format!(
                    "Failed to bind queue '{}' to '{}': {}",
                    queue, exchange, e
                ))
            })
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.classify(e, RabbitMQError::ConsumeError))?;

        let channel = self.channel.clone();
        let consumer_tag = consumer_tag.to_string();
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => Ok(Delivery {
                metadata: DeliveryMetadata {
                    delivery_tag: delivery.delivery_tag,
                    consumer_tag: consumer_tag.clone(),
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                },
                properties: delivery.properties,
                body: delivery.data,
            }),
            Err(e) if !channel.status().connected() => {
                Err(RabbitMQError::ChannelClosed(e.to_string()))
            }
            Err(e) => Err(RabbitMQError::ConsumeError(e.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.classify(e, RabbitMQError::AckError))
    }

    async fn basic_reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| self.classify(e, RabbitMQError::AckError))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..BasicPublishOptions::default()
                },
                payload,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        match confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
        {
            Confirmation::Nack(_) => Err(RabbitMQError::PublishError(
                "Broker negatively acknowledged the message".to_string(),
            )),
            Confirmation::Ack(Some(_)) => Err(RabbitMQError::PublishError(format!(
                "Message to exchange '{}' with routing key '{}' was returned as unroutable",
                exchange, routing_key
            ))),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(200, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}
