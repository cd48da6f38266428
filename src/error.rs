use thiserror::Error;

/// Error type for the consumer library.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Error while decoding a message payload or a configuration document.
    #[error("Failed to deserialize: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Setup or configuration error.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError {
        message: String,
    },

    /// Error from the message handler logic.
    #[error("Message handler failed: {0}")]
    HandlerError(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// The dispatch delegate panicked.
    #[error("Message handler panicked: {0}")]
    HandlerPanicked(String),

    /// The unit of work could not be committed.
    #[error("Failed to commit unit of work: {0}")]
    CommitFailed(String),

    /// A dead-letter operation failed. There is no fallback after this.
    #[error("Dead letter queue operation failed: {0}")]
    DlqError(String),
}

impl From<&str> for ConsumerError {
    fn from(s: &str) -> Self {
        ConsumerError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for ConsumerError {
    fn from(s: String) -> Self {
        ConsumerError::MessagingError { message: s }
    }
}
