//! RabbitMQ transport: a shared connection provider, a queue consumer with a
//! bounded channel restart, and a one-shot JSON publisher.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::ConnectionConfig;
pub use rabbitmq::{
    AckDecision, ConnectionManager, ConsumerOptions, DeliveryMetadata, MessageHandler,
    PublisherOptions, RabbitConsumer, RabbitMQError, RabbitPublisher,
};
