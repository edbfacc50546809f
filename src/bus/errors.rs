// src/bus/errors.rs

use thiserror::Error;

use crate::messaging::TransportError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Handler conflict on queue {queue}: {detail}")]
    Conflict { queue: String, detail: String },

    #[error("Queue {queue} cannot mix single-handler and message-type registrations")]
    ModeConflict { queue: String },

    #[error("No handlers registered for queue {0}")]
    NoHandlersRegistered(String),

    #[error("Queue {0} is already connected")]
    AlreadyConnected(String),

    #[error("Queue {0} is not connected")]
    NotConnected(String),

    #[error("Queue {0} connection is closed")]
    ConnectionClosed(String),

    #[error("Unknown message type {message_type:?} on queue {queue}")]
    UnknownMessageType {
        queue: String,
        message_type: Option<String>,
    },

    #[error("Queue {0} doesn't exist in the connection pool")]
    NotFound(String),

    #[error("Queue {0} already exists in the connection pool")]
    DuplicateKey(String),

    #[error("Unable to provision queue {queue}: {source}")]
    QueueProvisioning {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("Message types cannot be registered without a controller namespace (handler {0})")]
    MissingNamespace(String),

    #[error("Invalid handler spec for {handler}: {reason}")]
    InvalidHandlerSpec { handler: String, reason: String },

    #[error("Queue {0} dispatches by message type; a message type is required for its sender")]
    MessageTypeRequired(String),

    #[error("Handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Handler {0} panicked")]
    HandlerPanicked(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl BusError {
    /// Startup errors that indicate a wiring mistake rather than a broker fault.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            BusError::Conflict { .. }
                | BusError::ModeConflict { .. }
                | BusError::NoHandlersRegistered(_)
                | BusError::MissingNamespace(_)
                | BusError::InvalidHandlerSpec { .. }
                | BusError::DuplicateKey(_)
        )
    }
}

// Custom Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
