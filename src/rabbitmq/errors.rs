// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Broker unreachable, authentication rejected or connect timed out.
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    /// A queue or exchange declaration conflicted with the broker's view of it.
    #[error("RabbitMQ declaration error: {0}")]
    DeclarationError(String),

    /// The broker closed the channel, or it was used after being closed.
    #[error("RabbitMQ channel closed: {0}")]
    ChannelClosed(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("No pending delivery to acknowledge or reject")]
    NoPendingDelivery,

    #[error("Publisher has already sent its message and closed")]
    PublisherClosed,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, RabbitMQError::ChannelClosed(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match error {
            LapinError::InvalidChannelState(_) | LapinError::InvalidChannel(_) => {
                RabbitMQError::ChannelClosed(error_text)
            }
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                RabbitMQError::ConnectionError(error_text)
            }
            _ => RabbitMQError::ChannelError(error_text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::ChannelState;

    #[test]
    fn test_invalid_channel_state_is_channel_closed() {
        let error: RabbitMQError = LapinError::InvalidChannelState(ChannelState::Closed).into();
        assert!(error.is_channel_closed());
    }

    #[test]
    fn test_channels_limit_is_channel_error() {
        let error: RabbitMQError = LapinError::ChannelsLimitReached.into();
        assert!(matches!(error, RabbitMQError::ChannelError(_)));
    }

    #[test]
    fn test_serde_error_converts() {
        let serde_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: RabbitMQError = serde_error.into();
        assert!(matches!(error, RabbitMQError::SerializationError(_)));
        assert!(error.to_string().starts_with("Message serialization error"));
    }
}
