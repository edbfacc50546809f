// src/bus/registry.rs

use std::collections::HashMap;
use tracing::debug;

use super::errors::{BusError, Result};
use super::handler::HandlerBinding;

/// How a queue's messages map onto handlers. Fixed by the first registration.
#[derive(Clone, Debug, Default)]
enum RegistryMode {
    #[default]
    Empty,
    /// One handler receives every message on the queue.
    Single(HandlerBinding),
    /// Handlers keyed by message-type tag, sharing one queue.
    Typed(HashMap<String, HandlerBinding>),
}

/// Per-queue handler table.
///
/// Built during startup, then frozen: the owning `Connection` takes a
/// snapshot when it connects and rejects later registrations.
#[derive(Clone, Debug)]
pub struct HandlerRegistry {
    queue_name: String,
    mode: RegistryMode,
}

impl HandlerRegistry {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            mode: RegistryMode::Empty,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn register_single(&mut self, binding: HandlerBinding) -> Result<()> {
        if self.is_empty() {
            debug!(queue = %self.queue_name, handler = %binding.name(), "Single handler bound");
            self.mode = RegistryMode::Single(binding);
            return Ok(());
        }
        match &self.mode {
            RegistryMode::Single(existing) => Err(BusError::Conflict {
                queue: self.queue_name.clone(),
                detail: format!(
                    "{} is already bound, cannot bind {}",
                    existing.name(),
                    binding.name()
                ),
            }),
            _ => Err(BusError::ModeConflict {
                queue: self.queue_name.clone(),
            }),
        }
    }

    pub fn register_typed(&mut self, message_type: impl Into<String>, binding: HandlerBinding) -> Result<()> {
        let message_type = message_type.into();
        if self.is_empty() {
            self.mode = RegistryMode::Typed(HashMap::new());
        }
        match &mut self.mode {
            RegistryMode::Typed(handlers) => {
                if handlers.contains_key(&message_type) {
                    return Err(BusError::Conflict {
                        queue: self.queue_name.clone(),
                        detail: format!("message type {} already registered", message_type),
                    });
                }
                debug!(queue = %self.queue_name, message_type = %message_type, handler = %binding.name(), "Typed handler bound");
                handlers.insert(message_type, binding);
                Ok(())
            }
            _ => Err(BusError::ModeConflict {
                queue: self.queue_name.clone(),
            }),
        }
    }

    /// Finds the handler for a delivery. The tag is ignored in single mode.
    pub fn resolve(&self, message_type: Option<&str>) -> Result<&HandlerBinding> {
        match &self.mode {
            RegistryMode::Empty => Err(BusError::NotConnected(self.queue_name.clone())),
            RegistryMode::Single(binding) => Ok(binding),
            RegistryMode::Typed(handlers) => message_type
                .and_then(|tag| handlers.get(tag))
                .ok_or_else(|| BusError::UnknownMessageType {
                    queue: self.queue_name.clone(),
                    message_type: message_type.map(str::to_string),
                }),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.mode, RegistryMode::Empty)
    }

    pub fn is_typed(&self) -> bool {
        matches!(self.mode, RegistryMode::Typed(_))
    }

    pub fn len(&self) -> usize {
        match &self.mode {
            RegistryMode::Empty => 0,
            RegistryMode::Single(_) => 1,
            RegistryMode::Typed(handlers) => handlers.len(),
        }
    }

    /// Registered message-type tags, sorted.
    pub fn message_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = match &self.mode {
            RegistryMode::Typed(handlers) => handlers.keys().cloned().collect(),
            _ => Vec::new(),
        };
        tags.sort();
        tags
    }
}
