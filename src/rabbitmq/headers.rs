// src/rabbitmq/headers.rs
// Mapping between bus messages and AMQP properties/headers

use chrono::{DateTime, Utc};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use std::collections::HashMap;

use crate::messaging::{Message, PropertyValue, ReceivedMessage};

const PERSISTENT: u8 = 2;

pub fn to_field_table(properties: &HashMap<String, PropertyValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in properties {
        let value = match value {
            PropertyValue::Bool(v) => AMQPValue::Boolean(*v),
            PropertyValue::Int(v) => AMQPValue::LongLongInt(*v),
            PropertyValue::Float(v) => AMQPValue::Double(*v),
            PropertyValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

/// Header values without a bus counterpart (arrays, nested tables, ...) are skipped.
pub fn from_field_table(table: &FieldTable) -> HashMap<String, PropertyValue> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(v) => PropertyValue::Bool(*v),
                AMQPValue::ShortShortInt(v) => PropertyValue::Int(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => PropertyValue::Int(i64::from(*v)),
                AMQPValue::ShortInt(v) => PropertyValue::Int(i64::from(*v)),
                AMQPValue::ShortUInt(v) => PropertyValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => PropertyValue::Int(i64::from(*v)),
                AMQPValue::LongUInt(v) => PropertyValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => PropertyValue::Int(*v),
                AMQPValue::Float(v) => PropertyValue::Float(f64::from(*v)),
                AMQPValue::Double(v) => PropertyValue::Float(*v),
                AMQPValue::ShortString(v) => PropertyValue::String(v.as_str().to_string()),
                AMQPValue::LongString(v) => {
                    PropertyValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

pub fn to_properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_message_id(message.message_id.clone().into())
        .with_timestamp(Utc::now().timestamp() as u64)
        .with_delivery_mode(PERSISTENT)
        .with_headers(to_field_table(&message.application_properties));
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    properties
}

pub fn from_delivery(delivery: &Delivery) -> ReceivedMessage {
    let properties = &delivery.properties;
    let message = Message {
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| format!("amqp-{}", delivery.delivery_tag)),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        application_properties: properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        body: delivery.data.clone(),
    };

    let enqueued_at = (*properties.timestamp())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
        .unwrap_or_else(Utc::now);

    ReceivedMessage {
        message,
        delivery_tag: delivery.delivery_tag,
        delivery_count: if delivery.redelivered { 2 } else { 1 },
        enqueued_at,
    }
}
