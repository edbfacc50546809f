// src/bus/sender.rs

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::messaging::{Message, SenderHandle, TransportError};

/// Stamps every outgoing message with one message-type tag before handing it
/// to the queue's base sender.
pub struct TypedSender {
    base: SenderHandle,
    message_type: String,
    property: String,
}

impl TypedSender {
    pub fn new(base: SenderHandle, message_type: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            base,
            message_type: message_type.into(),
            property: property.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.base.queue_name()
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    fn stamp(&self, mut message: Message) -> Message {
        message
            .application_properties
            .insert(self.property.clone(), self.message_type.clone().into());
        message
    }

    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.base.send(self.stamp(message)).await
    }

    pub async fn send_batch(&self, messages: Vec<Message>) -> Result<(), TransportError> {
        let stamped = messages.into_iter().map(|m| self.stamp(m)).collect();
        self.base.send_batch(stamped).await
    }
}

impl std::fmt::Debug for TypedSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedSender")
            .field("queue", &self.queue_name())
            .field("message_type", &self.message_type)
            .finish()
    }
}

/// Memoizes one [`TypedSender`] per `(queue, message type)`.
///
/// Wrappers share the queue's base sender; deriving one never opens a new
/// transport sender.
pub struct TypedSenderCache {
    property: String,
    senders: RwLock<HashMap<(String, String), Arc<TypedSender>>>,
}

impl TypedSenderCache {
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, queue_name: &str, message_type: &str) -> Option<Arc<TypedSender>> {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(queue_name.to_string(), message_type.to_string()))
            .cloned()
    }

    pub fn get_or_derive(&self, base: &SenderHandle, message_type: &str) -> Arc<TypedSender> {
        if let Some(sender) = self.get(base.queue_name(), message_type) {
            return sender;
        }

        let key = (base.queue_name().to_string(), message_type.to_string());
        let mut senders = self.senders.write().unwrap_or_else(PoisonError::into_inner);
        senders
            .entry(key)
            .or_insert_with(|| {
                debug!(queue = %base.queue_name(), message_type = %message_type, "Typed sender derived");
                Arc::new(TypedSender::new(base.clone(), message_type, self.property.clone()))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.senders.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every wrapper of `queue_name`.
    pub fn remove_queue(&self, queue_name: &str) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(queue, _), _| queue != queue_name);
    }

    pub fn clear(&self) {
        self.senders.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
