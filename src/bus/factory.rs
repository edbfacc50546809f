// src/bus/factory.rs

use std::sync::Arc;
use tracing::{debug, info};

use super::connection::{ensure_queue, Connection};
use super::errors::Result;
use super::registry::HandlerRegistry;
use super::sink::ErrorSink;
use crate::config::{BusConfig, QueueOptions};
use crate::messaging::{SenderHandle, Transport};

/// Builds connected queue connections and plain senders.
///
/// The only component that provisions queues on the transport.
#[derive(Clone)]
pub struct ConnectionFactory {
    transport: Arc<dyn Transport>,
    config: Arc<BusConfig>,
    error_sink: Arc<dyn ErrorSink>,
}

impl ConnectionFactory {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<BusConfig>, error_sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            transport,
            config,
            error_sink,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Creates the connection for `queue_name` with `registry` attached and
    /// connects it. Connection errors are returned as-is.
    pub async fn create_for_queue(
        &self,
        queue_name: &str,
        registry: HandlerRegistry,
        options: Option<&QueueOptions>,
    ) -> Result<Arc<Connection>> {
        let resolved = self.config.options_for(queue_name, options);
        debug!(
            queue = %queue_name,
            prefetch = resolved.receiver_options.prefetch_count,
            max_concurrent_calls = resolved.subscribe_options.max_concurrent_calls,
            "Creating queue connection"
        );

        let connection = Arc::new(Connection::new(
            queue_name,
            self.transport.clone(),
            registry,
            resolved,
            self.config.message_type_property.clone(),
            self.error_sink.clone(),
        ));
        connection.connect().await?;
        Ok(connection)
    }

    /// Ensures `queue_name` exists and opens a send-only handle on it.
    pub async fn create_queue_sender(&self, queue_name: &str) -> Result<SenderHandle> {
        ensure_queue(self.transport.as_ref(), queue_name).await?;
        let sender = self.transport.create_sender(queue_name).await?;
        info!(queue = %queue_name, "Queue sender created");
        Ok(sender)
    }
}
