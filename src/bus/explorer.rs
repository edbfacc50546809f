// src/bus/explorer.rs
//! Explicit handler discovery.
//!
//! Application code lists its handlers as [`HandlerSpec`]s; [`collect`] turns
//! that feed into one registry per resolved queue, in feed order.

use tracing::{debug, info};

use super::errors::{BusError, Result};
use super::handler::HandlerBinding;
use super::naming;
use super::registry::HandlerRegistry;
use crate::config::QueueOptions;

/// One entry of the discovery feed.
#[derive(Clone, Debug)]
pub struct HandlerSpec {
    pub namespace: String,
    pub queue: Option<String>,
    pub message_type: Option<String>,
    pub binding: HandlerBinding,
    pub options: Option<QueueOptions>,
}

impl HandlerSpec {
    /// The handler owns every message on `namespace<sep>queue`.
    pub fn queue(namespace: impl Into<String>, queue: impl Into<String>, binding: HandlerBinding) -> Self {
        Self {
            namespace: namespace.into(),
            queue: Some(queue.into()),
            message_type: None,
            binding,
            options: None,
        }
    }

    /// The handler receives messages tagged `message_type` on the controller
    /// queue `namespace`.
    pub fn message_type(
        namespace: impl Into<String>,
        message_type: impl Into<String>,
        binding: HandlerBinding,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            queue: None,
            message_type: Some(message_type.into()),
            binding,
            options: None,
        }
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Handlers for one queue, ready to be connected.
#[derive(Debug)]
pub struct QueueRegistration {
    pub queue_name: String,
    pub registry: HandlerRegistry,
    /// First options given by a spec of this queue, if any.
    pub options: Option<QueueOptions>,
}

/// Groups `specs` by resolved queue name, keeping first-seen order.
pub fn collect<I>(specs: I, separator: &str) -> Result<Vec<QueueRegistration>>
where
    I: IntoIterator<Item = HandlerSpec>,
{
    let mut registrations: Vec<QueueRegistration> = Vec::new();

    for spec in specs {
        let handler = spec.binding.name();
        let (queue_name, message_type) = match (spec.queue, spec.message_type) {
            (Some(queue), None) => (naming::resolve(&spec.namespace, &queue, separator), None),
            (None, Some(message_type)) => {
                if spec.namespace.is_empty() {
                    return Err(BusError::MissingNamespace(handler));
                }
                (spec.namespace.clone(), Some(message_type))
            }
            (Some(_), Some(_)) => {
                return Err(BusError::InvalidHandlerSpec {
                    handler,
                    reason: "both a queue and a message type are set".to_string(),
                })
            }
            (None, None) => {
                return Err(BusError::InvalidHandlerSpec {
                    handler,
                    reason: "neither a queue nor a message type is set".to_string(),
                })
            }
        };

        let index = match registrations.iter().position(|r| r.queue_name == queue_name) {
            Some(index) => index,
            None => {
                registrations.push(QueueRegistration {
                    registry: HandlerRegistry::new(queue_name.clone()),
                    queue_name: queue_name.clone(),
                    options: None,
                });
                registrations.len() - 1
            }
        };
        let registration = &mut registrations[index];

        match message_type {
            Some(message_type) => registration.registry.register_typed(message_type, spec.binding)?,
            None => registration.registry.register_single(spec.binding)?,
        }
        if registration.options.is_none() {
            registration.options = spec.options;
        }
        debug!(queue = %queue_name, handler = %handler, "Handler collected");
    }

    info!(queues = registrations.len(), "Handler discovery complete");
    Ok(registrations)
}
