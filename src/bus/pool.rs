// src/bus/pool.rs

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use super::connection::Connection;
use super::errors::{BusError, Result};
use crate::messaging::SenderHandle;

/// What the pool keeps for a queue.
#[derive(Clone)]
pub enum PoolEntry {
    /// A queue with registered handlers, connected for receive and send.
    QueueConnection(Arc<Connection>),
    /// A send-only handle for a queue this process does not consume.
    PureSender(SenderHandle),
}

impl PoolEntry {
    /// The base sender, whichever kind of entry this is.
    pub fn sender(&self) -> Result<SenderHandle> {
        match self {
            PoolEntry::QueueConnection(connection) => connection.sender(),
            PoolEntry::PureSender(sender) => Ok(sender.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PoolEntry::QueueConnection(_) => "connection",
            PoolEntry::PureSender(_) => "sender",
        }
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolEntry::QueueConnection(connection) => f
                .debug_tuple("QueueConnection")
                .field(&connection.queue_name())
                .finish(),
            PoolEntry::PureSender(sender) => f.debug_tuple("PureSender").field(&sender.queue_name()).finish(),
        }
    }
}

/// Process-wide `queue name -> entry` table. Entries are write-once.
#[derive(Default)]
pub struct ConnectionPool {
    entries: RwLock<HashMap<String, PoolEntry>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, queue_name: impl Into<String>, entry: PoolEntry) -> Result<()> {
        let queue_name = queue_name.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&queue_name) {
            return Err(BusError::DuplicateKey(queue_name));
        }
        debug!(queue = %queue_name, kind = entry.kind(), "Pool entry added");
        entries.insert(queue_name, entry);
        Ok(())
    }

    pub fn get(&self, queue_name: &str) -> Result<PoolEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .cloned()
            .ok_or_else(|| BusError::NotFound(queue_name.to_string()))
    }

    pub fn contains(&self, queue_name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(queue_name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shutdown only.
    pub fn remove(&self, queue_name: &str) -> Option<PoolEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue_name)
    }

    /// Empties the pool, returning every entry. Shutdown only.
    pub fn drain(&self) -> Vec<(String, PoolEntry)> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut drained: Vec<(String, PoolEntry)> = entries.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }
}
