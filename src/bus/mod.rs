// src/bus/mod.rs
// Queue bus core: naming, handler registries, per-queue connections, pooling

pub mod connection;
pub mod errors;
pub mod explorer;
pub mod factory;
pub mod handler;
pub mod naming;
pub mod pool;
pub mod registry;
pub mod sender;
pub mod sink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::messaging::{Message, SenderHandle, Transport, TransportError};

// Re-export specific items to simplify imports elsewhere
pub use connection::{Connection, ConnectionState, Dispatcher};
pub use errors::{BusError, Result};
pub use explorer::{HandlerSpec, QueueRegistration};
pub use factory::ConnectionFactory;
pub use handler::{handler_fn, HandlerBinding, JsonHandler, MessageHandler, TypedMessageHandler};
pub use pool::{ConnectionPool, PoolEntry};
pub use registry::HandlerRegistry;
pub use sender::{TypedSender, TypedSenderCache};
pub use sink::{CollectingErrorSink, DispatchFailure, ErrorSink, TracingErrorSink};

/// Sender returned by [`QueueBus::get_sender`].
#[derive(Clone)]
pub enum SenderKind {
    Queue(SenderHandle),
    Typed(Arc<TypedSender>),
}

impl std::fmt::Debug for SenderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderKind::Queue(sender) => f.debug_tuple("Queue").field(&sender.queue_name()).finish(),
            SenderKind::Typed(sender) => f.debug_tuple("Typed").field(sender).finish(),
        }
    }
}

impl SenderKind {
    pub fn queue_name(&self) -> &str {
        match self {
            SenderKind::Queue(sender) => sender.queue_name(),
            SenderKind::Typed(sender) => sender.queue_name(),
        }
    }

    pub async fn send(&self, message: Message) -> std::result::Result<(), TransportError> {
        match self {
            SenderKind::Queue(sender) => sender.send(message).await,
            SenderKind::Typed(sender) => sender.send(message).await,
        }
    }
}

/// Root object: owns the transport and everything built on top of it.
///
/// Startup is `start(specs)`; teardown is one `shutdown()` call.
pub struct QueueBus {
    transport: Arc<dyn Transport>,
    config: Arc<BusConfig>,
    factory: ConnectionFactory,
    pool: ConnectionPool,
    typed_senders: TypedSenderCache,
    // Serializes pool insertions that need transport round-trips.
    provisioning: AsyncMutex<()>,
    shut_down: AtomicBool,
}

impl QueueBus {
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        Self::with_error_sink(transport, config, Arc::new(TracingErrorSink))
    }

    pub fn with_error_sink(transport: Arc<dyn Transport>, config: BusConfig, error_sink: Arc<dyn ErrorSink>) -> Self {
        let config = Arc::new(config);
        Self {
            factory: ConnectionFactory::new(transport.clone(), config.clone(), error_sink),
            typed_senders: TypedSenderCache::new(config.message_type_property.clone()),
            transport,
            config,
            pool: ConnectionPool::new(),
            provisioning: AsyncMutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Connects every handler in `specs`, then provisions the configured senders.
    ///
    /// On failure the queues connected by this call are closed and unpooled,
    /// so `start` can be retried.
    pub async fn start<I>(&self, specs: I) -> Result<()>
    where
        I: IntoIterator<Item = HandlerSpec>,
    {
        let queues = self.register_all(specs).await?;
        if let Err(err) = self.provision_senders().await {
            self.roll_back(&queues).await;
            return Err(err);
        }
        info!(queues = queues.len(), pooled = self.pool.len(), "Queue bus started");
        Ok(())
    }

    /// Groups `specs` per queue, connects each queue and pools it.
    /// Returns the connected queue names in feed order.
    ///
    /// All or nothing: when one queue fails, the ones connected before it are
    /// closed and removed from the pool again.
    pub async fn register_all<I>(&self, specs: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = HandlerSpec>,
    {
        self.ensure_running("bus")?;
        let registrations = explorer::collect(specs, &self.config.separator)?;

        let _guard = self.provisioning.lock().await;
        // Reject every duplicate before the first queue gets connected.
        for registration in &registrations {
            if self.pool.contains(&registration.queue_name) {
                return Err(BusError::DuplicateKey(registration.queue_name.clone()));
            }
        }

        let mut queues = Vec::with_capacity(registrations.len());
        for registration in registrations {
            let queue_name = registration.queue_name.clone();
            if let Err(err) = self.connect_registration(registration).await {
                error!(queue = %queue_name, error = %err, "Queue registration failed");
                self.roll_back(&queues).await;
                return Err(err);
            }
            queues.push(queue_name);
        }
        Ok(queues)
    }

    async fn connect_registration(&self, registration: QueueRegistration) -> Result<()> {
        let QueueRegistration {
            queue_name,
            registry,
            options,
        } = registration;
        let message_types = registry.message_types();

        let connection = self
            .factory
            .create_for_queue(&queue_name, registry, options.as_ref())
            .await?;
        if let Err(err) = self
            .pool
            .add(queue_name.clone(), PoolEntry::QueueConnection(connection.clone()))
        {
            let _ = connection.close().await;
            return Err(err);
        }

        if message_types.is_empty() {
            info!(queue = %queue_name, "Queue handler registered");
            return Ok(());
        }
        let base = match connection.sender() {
            Ok(base) => base,
            Err(err) => {
                self.pool.remove(&queue_name);
                let _ = connection.close().await;
                return Err(err);
            }
        };
        for message_type in &message_types {
            self.typed_senders.get_or_derive(&base, message_type);
        }
        info!(queue = %queue_name, message_types = ?message_types, "Message handlers registered");
        Ok(())
    }

    /// Closes and unpools the connections of `queues`, newest first.
    async fn roll_back(&self, queues: &[String]) {
        for queue_name in queues.iter().rev() {
            self.typed_senders.remove_queue(queue_name);
            if let Some(PoolEntry::QueueConnection(connection)) = self.pool.remove(queue_name) {
                if let Err(err) = connection.close().await {
                    warn!(queue = %queue_name, error = %err, "Failed to close connection during rollback");
                }
            }
        }
        if !queues.is_empty() {
            warn!(queues = ?queues, "Rolled back queue registrations");
        }
    }

    /// Creates the pure senders listed in the configuration. Queues that
    /// already have a pooled entry are reused, and typed senders obey the same
    /// tag rule as [`QueueBus::get_typed_sender`].
    pub async fn provision_senders(&self) -> Result<()> {
        for queue in &self.config.queue_senders {
            self.get_queue_sender(queue).await?;
        }
        for senders in &self.config.message_type_senders {
            self.get_queue_sender(&senders.queue).await?;
            for message_type in &senders.message_types {
                self.get_typed_sender(&senders.queue, message_type).await?;
            }
            debug!(queue = %senders.queue, message_types = ?senders.message_types, "Message type senders provisioned");
        }
        Ok(())
    }

    /// The connection consuming `queue_name`.
    pub fn connection(&self, queue_name: &str) -> Result<Arc<Connection>> {
        match self.pool.get(queue_name)? {
            PoolEntry::QueueConnection(connection) => Ok(connection),
            PoolEntry::PureSender(_) => Err(BusError::NotFound(queue_name.to_string())),
        }
    }

    /// Base sender of `queue_name`, created (and its queue provisioned) on
    /// first use.
    pub async fn get_queue_sender(&self, queue_name: &str) -> Result<SenderHandle> {
        self.ensure_running(queue_name)?;
        match self.pool.get(queue_name) {
            Ok(entry) => return entry.sender(),
            Err(BusError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let _guard = self.provisioning.lock().await;
        if let Ok(entry) = self.pool.get(queue_name) {
            return entry.sender();
        }
        let sender = self.factory.create_queue_sender(queue_name).await?;
        self.pool.add(queue_name, PoolEntry::PureSender(sender.clone()))?;
        Ok(sender)
    }

    /// Sender stamping `message_type` on every message sent to `queue_name`.
    ///
    /// On a queue this process consumes by message type, the tag must be one
    /// of its registered handlers.
    pub async fn get_typed_sender(&self, queue_name: &str, message_type: &str) -> Result<Arc<TypedSender>> {
        self.ensure_running(queue_name)?;
        if let Some(sender) = self.typed_senders.get(queue_name, message_type) {
            return Ok(sender);
        }

        if let Ok(PoolEntry::QueueConnection(connection)) = self.pool.get(queue_name) {
            if connection.is_typed() && !connection.message_types().iter().any(|t| t == message_type) {
                return Err(BusError::UnknownMessageType {
                    queue: queue_name.to_string(),
                    message_type: Some(message_type.to_string()),
                });
            }
        }

        let base = self.get_queue_sender(queue_name).await?;
        Ok(self.typed_senders.get_or_derive(&base, message_type))
    }

    /// A plain sender, or a typed one when `message_type` is given. A queue
    /// consumed by message type always needs the tag.
    pub async fn get_sender(&self, queue_name: &str, message_type: Option<&str>) -> Result<SenderKind> {
        match message_type {
            Some(message_type) => Ok(SenderKind::Typed(
                self.get_typed_sender(queue_name, message_type).await?,
            )),
            None => {
                if let Ok(PoolEntry::QueueConnection(connection)) = self.pool.get(queue_name) {
                    if connection.is_typed() {
                        return Err(BusError::MessageTypeRequired(queue_name.to_string()));
                    }
                }
                Ok(SenderKind::Queue(self.get_queue_sender(queue_name).await?))
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self, queue_name: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(BusError::ConnectionClosed(queue_name.to_string()));
        }
        Ok(())
    }

    /// Closes every pooled connection and sender, then the transport.
    /// Later calls do nothing. Returns the first close failure.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.provisioning.lock().await;
        self.typed_senders.clear();

        let mut first_error: Option<BusError> = None;
        for (queue_name, entry) in self.pool.drain() {
            let result = match entry {
                PoolEntry::QueueConnection(connection) => connection.close().await,
                PoolEntry::PureSender(sender) => sender.close().await.map_err(BusError::from),
            };
            if let Err(err) = result {
                warn!(queue = %queue_name, error = %err, "Failed to close pool entry");
                first_error.get_or_insert(err);
            }
        }

        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "Failed to close transport");
            first_error.get_or_insert(err.into());
        }
        info!("Queue bus shut down");
        first_error.map_or(Ok(()), Err)
    }
}
