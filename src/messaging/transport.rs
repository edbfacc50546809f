// src/messaging/transport.rs
// Boundary traits implemented by concrete transports (AMQP, in-memory).

use async_trait::async_trait;
use std::sync::Arc;

use super::error::TransportError;
use super::types::{Message, ReceivedMessage, ReceiverOptions, Settlement, SubscribeOptions};

pub type ReceiverHandle = Arc<dyn Receiver>;
pub type SenderHandle = Arc<dyn Sender>;

/// Queue administration plus handle creation for one broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn queue_exists(&self, name: &str) -> Result<bool, TransportError>;

    /// Creates the queue. A queue that appeared in the meantime is reported
    /// as `TransportError::QueueAlreadyExists`.
    async fn create_queue(&self, name: &str) -> Result<(), TransportError>;

    async fn create_receiver(
        &self,
        name: &str,
        options: &ReceiverOptions,
    ) -> Result<ReceiverHandle, TransportError>;

    async fn create_sender(&self, name: &str) -> Result<SenderHandle, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// The `{on_message, on_error}` pair a subscription pushes into.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Must not fail: whatever happens inside is folded into the returned settlement.
    async fn on_message(&self, message: ReceivedMessage, receiver: ReceiverHandle) -> Settlement;

    async fn on_error(&self, error: TransportError);
}

#[async_trait]
pub trait Receiver: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Starts pushing deliveries into `listener` in the background.
    async fn subscribe(
        &self,
        listener: Arc<dyn MessageListener>,
        options: &SubscribeOptions,
    ) -> Result<(), TransportError>;

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), TransportError>;

    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Sender: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn send(&self, message: Message) -> Result<(), TransportError>;

    async fn send_batch(&self, messages: Vec<Message>) -> Result<(), TransportError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError>;
}
