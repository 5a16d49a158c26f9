use lapin::BasicProperties;
use serde::Serialize;
use serde_json::ser::Formatter;
use std::io;
use tracing::{info, warn};
use uuid::Uuid;

use super::amqp_client::AmqpChannel;
use super::channel_manager::{open_channel, ChannelConfig};
use super::connection::{BrokerConnection, ConnectionManager};
use super::errors::{RabbitMQError, Result};

/// AMQP delivery mode carried in the message properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Transient = 1,
    #[default]
    Persistent = 2,
}

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub exchange: String,
    /// Routing key; with the default exchange this is the queue name.
    pub routing_key: String,
    pub delivery_mode: DeliveryMode,
    pub mandatory: bool,
    pub channel: ChannelConfig,
}

impl PublisherOptions {
    pub fn new(queue_name: &str, exchange_name: &str) -> Self {
        Self {
            exchange: exchange_name.to_string(),
            routing_key: queue_name.to_string(),
            delivery_mode: DeliveryMode::Persistent,
            mandatory: false,
            channel: ChannelConfig::for_publisher(),
        }
    }

    pub fn delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

/// JSON with `", "` between entries and `": "` after keys, so `{"a": 1}`
/// goes out byte for byte as written.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Serializes a message body the way it is put on the wire.
pub fn encode_json<T>(message: &T) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let mut payload = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut payload, SpacedFormatter);
    message.serialize(&mut serializer)?;
    Ok(payload)
}

/// Sends exactly one message over a connection of its own, then closes it.
pub struct RabbitPublisher {
    connection: Option<BrokerConnection>,
    channel: Option<Box<dyn AmqpChannel>>,
    options: PublisherOptions,
}

impl RabbitPublisher {
    pub async fn new(manager: &ConnectionManager, options: PublisherOptions) -> Result<Self> {
        let connection = manager.get_publisher_connection().await?;

        let channel = match open_channel(&connection, &options.channel).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_error) = connection.close().await {
                    warn!(
                        connection_id = %connection.id(),
                        "Failed to close publisher connection: {}", close_error
                    );
                }
                return Err(e);
            }
        };

        Ok(RabbitPublisher {
            connection: Some(connection),
            channel: Some(channel),
            options,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_none()
    }

    /// Serializes `message` to JSON, publishes it and closes the channel and
    /// connection.
    ///
    /// A message that cannot be serialized is reported before anything is
    /// sent and leaves the publisher usable. Once a publish has been
    /// attempted the publisher is closed whatever the outcome.
    pub async fn send_message<T>(&mut self, message: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(RabbitMQError::PublisherClosed);
        }
        let payload = encode_json(message)?;

        let published = match self.channel.as_ref() {
            Some(channel) => self.publish(channel.as_ref(), &payload).await,
            None => Err(RabbitMQError::PublisherClosed),
        };
        let closed = self.close().await;

        match (published, closed) {
            (Err(e), Err(close_error)) => {
                warn!("Failed to close publisher after failed publish: {}", close_error);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), closed) => closed,
        }
    }

    async fn publish(&self, channel: &dyn AmqpChannel, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(self.options.delivery_mode as u8)
            .with_content_type("application/json".into())
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        channel
            .basic_publish(
                &self.options.exchange,
                &self.options.routing_key,
                payload,
                properties,
                self.options.mandatory,
            )
            .await?;

        info!(
            "Published message to exchange '{}' with routing key '{}'",
            self.options.exchange, self.options.routing_key
        );
        Ok(())
    }

    // Both halves are attempted; the channel error wins if both fail.
    async fn close(&mut self) -> Result<()> {
        let channel_closed = match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };
        let connection_closed = match self.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };
        channel_closed.and(connection_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::rabbitmq::in_memory::InMemoryBroker;
    use crate::rabbitmq::topology::QueueDeclaration;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::with_connector(
            &ConnectionConfig::new("localhost", "guest", "guest"),
            Arc::new(broker.clone()),
        )
    }

    #[tokio::test]
    async fn test_send_message_publishes_json_and_tears_down() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(QueueDeclaration::new("jobs"));
        let manager = manager(&broker);

        let mut publisher = RabbitPublisher::new(&manager, PublisherOptions::new("jobs", ""))
            .await
            .unwrap();
        assert_eq!(broker.open_connections(), 1);
        publisher.send_message(&json!({"a": 1})).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].body, br#"{"a": 1}"#);
        assert_eq!(published[0].routing_key, "jobs");
        assert_eq!(published[0].properties.delivery_mode(), &Some(2));
        assert!(!published[0].mandatory);
        assert_eq!(broker.queue_depth("jobs"), 1);

        assert!(publisher.is_closed());
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[test]
    fn test_encode_json_spacing() {
        let nested = json!({"a": [1, 2], "b": {"c": null}});
        assert_eq!(encode_json(&nested).unwrap(), br#"{"a": [1, 2], "b": {"c": null}}"#);
        assert_eq!(encode_json(&json!([])).unwrap(), b"[]");
        assert_eq!(encode_json(&json!({})).unwrap(), b"{}");
        assert_eq!(encode_json(&json!("x")).unwrap(), br#""x""#);
    }

    #[tokio::test]
    async fn test_second_send_is_rejected() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let mut publisher = RabbitPublisher::new(&manager, PublisherOptions::new("jobs", ""))
            .await
            .unwrap();
        publisher.send_message(&json!({"n": 1})).await.unwrap();

        let again = publisher.send_message(&json!({"n": 2})).await;
        assert!(matches!(again, Err(RabbitMQError::PublisherClosed)));
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_delivery_mode() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let options = PublisherOptions::new("jobs", "").delivery_mode(DeliveryMode::Transient);

        let mut publisher = RabbitPublisher::new(&manager, options).await.unwrap();
        publisher.send_message(&json!({})).await.unwrap();
        assert_eq!(broker.published()[0].properties.delivery_mode(), &Some(1));
    }

    #[tokio::test]
    async fn test_serialization_error_happens_before_publishing() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let mut publisher = RabbitPublisher::new(&manager, PublisherOptions::new("jobs", ""))
            .await
            .unwrap();

        let mut unencodable = BTreeMap::new();
        unencodable.insert((1, 2), "tuple keys are not JSON");
        let result = publisher.send_message(&unencodable).await;

        assert!(matches!(result, Err(RabbitMQError::SerializationError(_))));
        assert!(broker.published().is_empty());
        assert!(!publisher.is_closed());
    }

    #[tokio::test]
    async fn test_unroutable_mandatory_message_is_a_publish_error() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let options = PublisherOptions::new("nobody-listens", "").mandatory(true);

        let mut publisher = RabbitPublisher::new(&manager, options).await.unwrap();
        let result = publisher.send_message(&json!({"a": 1})).await;

        assert!(matches!(result, Err(RabbitMQError::PublishError(_))));
        assert!(publisher.is_closed());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_each_publisher_has_its_own_connection() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let _first = RabbitPublisher::new(&manager, PublisherOptions::new("a", "")).await.unwrap();
        let _second = RabbitPublisher::new(&manager, PublisherOptions::new("b", "")).await.unwrap();
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_connection_refused_surfaces_on_construction() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections("ECONNREFUSED");
        let manager = manager(&broker);

        let result = RabbitPublisher::new(&manager, PublisherOptions::new("a", "")).await;
        assert!(matches!(result, Err(RabbitMQError::ConnectionError(_))));
    }
}
