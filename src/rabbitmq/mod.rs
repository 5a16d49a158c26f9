// src/rabbitmq/mod.rs
// Connection provider, consumer and publisher on top of the broker client

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod errors;
#[cfg(any(test, feature = "test-util"))]
pub mod in_memory;
pub mod lapin_client;
pub mod publisher;
pub mod topology;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryMetadata, DeliveryStream,
    DeliveryTag,
};
pub use channel_manager::ChannelConfig;
pub use connection::{BrokerConnection, ConnectionManager};
pub use consumer::{AckDecision, ConsumerOptions, ConsumerState, MessageHandler, RabbitConsumer};
pub use errors::{RabbitMQError, Result};
#[cfg(any(test, feature = "test-util"))]
pub use in_memory::InMemoryBroker;
pub use lapin_client::LapinConnector;
pub use publisher::{encode_json, DeliveryMode, PublisherOptions, RabbitPublisher};
pub use topology::{ExchangeDeclaration, ExchangeType, QueueDeclaration};
