use tracing::{debug, info, warn};
use uuid::Uuid;

use super::amqp_client::AmqpChannel;
use super::connection::BrokerConnection;
use super::errors::Result;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            confirm_mode: false,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    /// One outstanding delivery at a time, matching a sequential consume loop.
    pub fn for_consumer() -> Self {
        Self {
            prefetch_count: 1,
            ..Self::default()
        }
    }

    /// Confirms on, so nacks and returned mandatory messages surface as errors.
    pub fn for_publisher() -> Self {
        Self {
            confirm_mode: true,
            ..Self::default()
        }
    }
}

/// Opens a channel on `connection` and applies `config` to it.
///
/// If configuring the channel fails the channel is closed before the error is
/// returned.
pub async fn open_channel(
    connection: &BrokerConnection,
    config: &ChannelConfig,
) -> Result<Box<dyn AmqpChannel>> {
    debug!(
        channel_id = %config.id,
        connection_id = %connection.id(),
        prefetch = %config.prefetch_count,
        confirm = %config.confirm_mode,
        "Creating channel"
    );
    let channel = connection.open_channel().await?;

    if let Err(e) = configure(channel.as_ref(), config).await {
        if let Err(close_error) = channel.close().await {
            warn!(channel_id = %config.id, "Failed to close unconfigured channel: {}", close_error);
        }
        return Err(e);
    }

    info!("Channel {} created and configured successfully", config.id);
    Ok(channel)
}

async fn configure(channel: &dyn AmqpChannel, config: &ChannelConfig) -> Result<()> {
    // Configure QoS if specified
    if config.prefetch_count > 0 {
        debug!("Setting channel QoS to {}", config.prefetch_count);
        channel.basic_qos(config.prefetch_count).await?;
    }

    if config.confirm_mode {
        debug!("Enabling confirm mode for channel {}", config.id);
        channel.confirm_select().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::in_memory::InMemoryBroker;
    use crate::rabbitmq::AmqpConnector;

    #[test]
    fn test_default_config_ids_are_unique() {
        let a = ChannelConfig::default();
        let b = ChannelConfig::default();
        assert!(a.id.starts_with("channel-"));
        assert_eq!(a.id.len(), "channel-".len() + 8);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_role_presets() {
        assert_eq!(ChannelConfig::for_consumer().prefetch_count, 1);
        assert!(!ChannelConfig::for_consumer().confirm_mode);
        assert!(ChannelConfig::for_publisher().confirm_mode);
        assert_eq!(ChannelConfig::for_publisher().prefetch_count, 0);
    }

    #[tokio::test]
    async fn test_open_channel_on_closed_connection_fails() {
        let broker = InMemoryBroker::new();
        let connection = BrokerConnection::new(broker.connect("amqp://test").await.unwrap());
        connection.close().await.unwrap();

        let result = open_channel(&connection, &ChannelConfig::for_consumer()).await;
        assert!(result.is_err());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_open_channel_applies_config() {
        let broker = InMemoryBroker::new();
        let connection = BrokerConnection::new(broker.connect("amqp://test").await.unwrap());
        let channel = open_channel(&connection, &ChannelConfig::for_publisher())
            .await
            .unwrap();
        assert!(channel.is_open());
        assert_eq!(broker.channels_opened(), 1);
    }
}
