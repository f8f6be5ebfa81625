//! Error types for messaging operations

/// Result type for messaging operations
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Caller-supplied input was rejected before touching the broker
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation is not supported by the selected backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Publish was attempted on a client built without a producer
    #[error("Producer not configured: {0}")]
    ProducerNotConfigured(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Publish failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Subscribe failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Consume failed
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// Acknowledgement could not be delivered to the broker
    #[error("Ack failed: {0}")]
    AckFailed(String),

    /// Client has been closed; no further operations are accepted
    #[error("Messaging client is closed")]
    Closed,

    /// Handler returned an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// Handler panicked while processing a message
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Driver name did not match any known backend
    #[error("Unknown messaging driver: {0}")]
    UnknownDriver(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MessagingError {
    /// Stable low-cardinality name for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagingError::Validation(_) => "validation",
            MessagingError::Unsupported(_) => "unsupported",
            MessagingError::ProducerNotConfigured(_) => "producer_not_configured",
            MessagingError::ConnectionFailed(_) => "connection_failed",
            MessagingError::PublishFailed(_) => "publish_failed",
            MessagingError::SubscribeFailed(_) => "subscribe_failed",
            MessagingError::ConsumeFailed(_) => "consume_failed",
            MessagingError::AckFailed(_) => "ack_failed",
            MessagingError::Closed => "closed",
            MessagingError::Handler(_) => "handler",
            MessagingError::HandlerPanic(_) => "handler_panic",
            MessagingError::UnknownDriver(_) => "unknown_driver",
            MessagingError::Configuration(_) => "configuration",
        }
    }

    /// True when the error indicates the client was already shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self, MessagingError::Closed)
    }

    /// True when the error was raised by input validation rather than a
    /// broker interaction.
    pub fn is_validation(&self) -> bool {
        matches!(self, MessagingError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_detail() {
        let err = MessagingError::PublishFailed("broker unreachable".to_string());
        assert_eq!(err.to_string(), "Publish failed: broker unreachable");
    }

    #[test]
    fn test_closed_classification() {
        assert!(MessagingError::Closed.is_closed());
        assert!(!MessagingError::Closed.is_validation());
        assert!(MessagingError::Validation("empty topic".into()).is_validation());
    }
}
