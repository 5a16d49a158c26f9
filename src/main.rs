use async_trait::async_trait;
use lapin::BasicProperties;
use rabbit_transport::config;
use rabbit_transport::rabbitmq::{
    AckDecision, ConnectionManager, ConsumerOptions, DeliveryMetadata, MessageHandler,
    PublisherOptions, RabbitConsumer, RabbitPublisher,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logs every JSON message it receives and rejects anything else.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(
        &self,
        metadata: &DeliveryMetadata,
        _properties: &BasicProperties,
        body: &[u8],
    ) -> AckDecision {
        match serde_json::from_slice::<Value>(body) {
            Ok(message) => {
                info!(delivery_tag = metadata.delivery_tag, "Received message: {}", message);
                AckDecision::Ack
            }
            Err(e) => {
                warn!(delivery_tag = metadata.delivery_tag, "Dropping non-JSON message: {}", e);
                AckDecision::Reject { requeue: false }
            }
        }
    }

    fn handler_name(&self) -> &str {
        "logging"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = config::load_settings()?;
    let queue = std::env::var("RMQ_QUEUE").unwrap_or_else(|_| "rabbit_transport.events".to_string());
    let exchange =
        std::env::var("RMQ_EXCHANGE").unwrap_or_else(|_| "rabbit_transport.fanout".to_string());

    let manager = ConnectionManager::new(&settings);

    let mut consumer =
        RabbitConsumer::new(&manager, ConsumerOptions::new(&queue, &exchange), LoggingHandler).await?;
    consumer.bind(&queue).await?;

    let mut publisher = RabbitPublisher::new(&manager, PublisherOptions::new(&queue, &exchange)).await?;
    publisher
        .send_message(&json!({
            "event": "startup",
            "queue": queue,
            "at": chrono::Utc::now().to_rfc3339(),
        }))
        .await?;

    info!("Service running. Press Ctrl+C to exit.");
    consumer
        .start_consume_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    info!("Closing connection...");
    manager.close().await?;
    Ok(())
}
