// src/messaging/error.rs
use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Queue {0} does not exist")]
    QueueNotFound(String),

    #[error("Queue {0} already exists")]
    QueueAlreadyExists(String),

    #[error("Transport connection error: {0}")]
    Connection(String),

    #[error("Transport channel error: {0}")]
    Channel(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Consume error: {0}")]
    Consume(String),

    #[error("Settlement error: {0}")]
    Settlement(String),

    #[error("Queue {0} already has an active subscription")]
    AlreadySubscribed(String),

    #[error("Transport handle is closed: {0}")]
    Closed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Unknown transport error: {0}")]
    Unknown(String),
}

impl TransportError {
    /// True for faults a broker may recover from on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Channel(_) | TransportError::Timeout(_)
        )
    }
}

// Classify lapin errors by their rendered text; lapin folds most protocol
// failures into a handful of variants.
impl From<LapinError> for TransportError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") {
            TransportError::Connection(error_text)
        } else if lowered.contains("channel") {
            TransportError::Channel(error_text)
        } else if lowered.contains("publish") {
            TransportError::Publish(error_text)
        } else if lowered.contains("consume") {
            TransportError::Consume(error_text)
        } else if lowered.contains("ack") || lowered.contains("nack") {
            TransportError::Settlement(error_text)
        } else {
            TransportError::Unknown(error_text)
        }
    }
}

impl From<Elapsed> for TransportError {
    fn from(_: Elapsed) -> Self {
        TransportError::Timeout("transport operation timed out".to_string())
    }
}

impl From<String> for TransportError {
    fn from(message: String) -> Self {
        TransportError::Unknown(message)
    }
}

impl From<&str> for TransportError {
    fn from(message: &str) -> Self {
        TransportError::Unknown(message.to_string())
    }
}
