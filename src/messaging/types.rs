// src/messaging/types.rs
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A single application property value carried next to the payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(value) => write!(f, "{}", value),
            PropertyValue::Int(value) => write!(f, "{}", value),
            PropertyValue::Float(value) => write!(f, "{}", value),
            PropertyValue::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

/// An outbound or inbound message: an application-property bag plus a payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub application_properties: HashMap<String, PropertyValue>,
    pub body: Vec<u8>,
}

impl Message {
    /// Creates a message with a fresh id and the given raw body.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Message {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            content_type: None,
            application_properties: HashMap::new(),
            body: body.into(),
        }
    }

    /// Serializes `payload` as the JSON body.
    pub fn json<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        let mut message = Message::new(serde_json::to_vec(payload)?);
        message.content_type = Some("application/json".to_string());
        Ok(message)
    }

    /// Parses the body as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.application_properties.get(key)
    }
}

/// A message as handed over by a transport subscription.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub message: Message,
    /// Transport-assigned token used to settle this delivery.
    pub delivery_tag: u64,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ReceivedMessage {
    pub fn new(message: Message, delivery_tag: u64) -> Self {
        ReceivedMessage {
            message,
            delivery_tag,
            delivery_count: 1,
            enqueued_at: Utc::now(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.message.property(key)
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    #[default]
    PeekLock,
    ReceiveAndDelete,
}

/// Options used when a receiver handle is opened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverOptions {
    #[serde(default)]
    pub receive_mode: ReceiveMode,

    /// Number of unsettled messages the transport may push ahead (0 means unlimited)
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            receive_mode: ReceiveMode::default(),
            prefetch_count: default_prefetch_count(),
        }
    }
}

/// Options used when a subscription is started on a receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    #[serde(default = "default_auto_complete")]
    pub auto_complete_messages: bool,

    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_complete_messages: default_auto_complete(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

fn default_prefetch_count() -> u16 { 10 }
fn default_auto_complete() -> bool { true }
fn default_max_concurrent_calls() -> usize { 1 }

/// How a delivery should be settled once dispatch is over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Abandon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        total: f64,
    }

    #[test]
    fn json_body_decodes_back() {
        let order = OrderPlaced { order_id: "o-1".into(), total: 12.5 };
        let message = Message::json(&order).unwrap();
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.decode::<OrderPlaced>().unwrap(), order);
    }

    #[test]
    fn properties_are_kept_as_given() {
        let message = Message::new("x")
            .with_property("messageType", "PLACED")
            .with_property("attempt", 3i64);
        assert_eq!(message.property("messageType").and_then(|v| v.as_str()), Some("PLACED"));
        assert_eq!(message.property("attempt"), Some(&PropertyValue::Int(3)));
        assert_eq!(message.property("attempt").and_then(|v| v.as_str()), None);
    }

    #[test]
    fn options_defaults_deserialize_from_empty_object() {
        let receiver: ReceiverOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(receiver, ReceiverOptions::default());
        assert_eq!(receiver.receive_mode, ReceiveMode::PeekLock);

        let receiver: ReceiverOptions =
            serde_json::from_str(r#"{"receive_mode": "receive_and_delete"}"#).unwrap();
        assert_eq!(receiver.receive_mode, ReceiveMode::ReceiveAndDelete);
        assert_eq!(receiver.prefetch_count, 10);

        let subscribe: SubscribeOptions =
            serde_json::from_str(r#"{"max_concurrent_calls": 4}"#).unwrap();
        assert!(subscribe.auto_complete_messages);
        assert_eq!(subscribe.max_concurrent_calls, 4);
    }
}
