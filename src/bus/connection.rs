// src/bus/connection.rs
//! One logical connection per queue.
//!
//! A `Connection` owns the queue's handler registry, its receiver and sender
//! handles, and the state machine
//! `Unconnected -> Connecting -> Connected -> Closed`. Registration is only
//! accepted while `Unconnected`; `connect()` freezes the registry into the
//! [`Dispatcher`] that the transport subscription pushes deliveries into.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use super::errors::{BusError, Result};
use super::handler::HandlerBinding;
use super::registry::HandlerRegistry;
use super::sink::{DispatchFailure, ErrorSink};
use crate::config::ResolvedQueueOptions;
use crate::messaging::{
    MessageListener, ReceivedMessage, ReceiverHandle, SenderHandle, Settlement, Transport,
    TransportError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Makes sure `queue` exists, creating it if needed. Losing a creation race
/// counts as success.
pub(crate) async fn ensure_queue(transport: &dyn Transport, queue: &str) -> Result<()> {
    let exists = transport
        .queue_exists(queue)
        .await
        .map_err(|source| BusError::QueueProvisioning {
            queue: queue.to_string(),
            source,
        })?;
    if exists {
        debug!(queue = %queue, "Queue already exists");
        return Ok(());
    }

    match transport.create_queue(queue).await {
        Ok(()) => {
            info!(queue = %queue, "Queue created successfully");
            Ok(())
        }
        Err(TransportError::QueueAlreadyExists(_)) => {
            debug!(queue = %queue, "Queue was created concurrently");
            Ok(())
        }
        Err(source) => {
            error!(queue = %queue, error = %source, "Unable to create queue");
            Err(BusError::QueueProvisioning {
                queue: queue.to_string(),
                source,
            })
        }
    }
}

pub struct Connection {
    queue_name: String,
    transport: Arc<dyn Transport>,
    options: ResolvedQueueOptions,
    message_type_property: String,
    error_sink: Arc<dyn ErrorSink>,
    state: Mutex<ConnectionState>,
    registry: Mutex<HandlerRegistry>,
    receiver: Mutex<Option<ReceiverHandle>>,
    sender: Mutex<Option<SenderHandle>>,
}

impl Connection {
    pub fn new(
        queue_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        registry: HandlerRegistry,
        options: ResolvedQueueOptions,
        message_type_property: impl Into<String>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            transport,
            options,
            message_type_property: message_type_property.into(),
            error_sink,
            state: Mutex::new(ConnectionState::Unconnected),
            registry: Mutex::new(registry),
            receiver: Mutex::new(None),
            sender: Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_typed(&self) -> bool {
        lock(&self.registry).is_typed()
    }

    pub fn message_types(&self) -> Vec<String> {
        lock(&self.registry).message_types()
    }

    pub fn register_single(&self, binding: HandlerBinding) -> Result<()> {
        let state = lock(&self.state);
        self.ensure_unconnected(*state)?;
        lock(&self.registry).register_single(binding)
    }

    pub fn register_typed(&self, message_type: impl Into<String>, binding: HandlerBinding) -> Result<()> {
        let state = lock(&self.state);
        self.ensure_unconnected(*state)?;
        lock(&self.registry).register_typed(message_type, binding)
    }

    fn ensure_unconnected(&self, state: ConnectionState) -> Result<()> {
        match state {
            ConnectionState::Unconnected => Ok(()),
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(BusError::AlreadyConnected(self.queue_name.clone()))
            }
            ConnectionState::Closed => Err(BusError::ConnectionClosed(self.queue_name.clone())),
        }
    }

    /// Provisions the queue, opens both handles and starts the subscription.
    ///
    /// Fails without touching the transport when the registry is empty or the
    /// connection is past `Unconnected`. Any failure after that rolls the state
    /// back to `Unconnected` and releases whatever was opened.
    pub async fn connect(&self) -> Result<()> {
        let registry = {
            let mut state = lock(&self.state);
            self.ensure_unconnected(*state)?;
            let registry = lock(&self.registry);
            if registry.is_empty() {
                error!(queue = %self.queue_name, "No message handlers registered");
                return Err(BusError::NoHandlersRegistered(self.queue_name.clone()));
            }
            *state = ConnectionState::Connecting;
            Arc::new(registry.clone())
        };

        debug!(queue = %self.queue_name, handlers = registry.len(), "Connecting queue");

        match self.open(registry).await {
            Ok((receiver, sender)) => {
                let closed_meanwhile = {
                    let mut state = lock(&self.state);
                    if *state == ConnectionState::Closed {
                        true
                    } else {
                        *lock(&self.receiver) = Some(receiver.clone());
                        *lock(&self.sender) = Some(sender.clone());
                        *state = ConnectionState::Connected;
                        false
                    }
                };
                if closed_meanwhile {
                    warn!(queue = %self.queue_name, "Connection closed while connecting");
                    let _ = release(&self.queue_name, Some(receiver), Some(sender)).await;
                    return Err(BusError::ConnectionClosed(self.queue_name.clone()));
                }
                info!(queue = %self.queue_name, "Queue connected");
                Ok(())
            }
            Err(err) => {
                let mut state = lock(&self.state);
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Unconnected;
                }
                Err(err)
            }
        }
    }

    async fn open(&self, registry: Arc<HandlerRegistry>) -> Result<(ReceiverHandle, SenderHandle)> {
        ensure_queue(self.transport.as_ref(), &self.queue_name).await?;

        let receiver = self
            .transport
            .create_receiver(&self.queue_name, &self.options.receiver_options)
            .await?;

        let sender = match self.transport.create_sender(&self.queue_name).await {
            Ok(sender) => sender,
            Err(err) => {
                let _ = release(&self.queue_name, Some(receiver), None).await;
                return Err(err.into());
            }
        };

        let dispatcher = Arc::new(Dispatcher {
            queue_name: self.queue_name.clone(),
            registry,
            message_type_property: self.message_type_property.clone(),
            error_sink: self.error_sink.clone(),
        });

        if let Err(err) = receiver
            .subscribe(dispatcher, &self.options.subscribe_options)
            .await
        {
            let _ = release(&self.queue_name, Some(receiver), Some(sender)).await;
            return Err(err.into());
        }

        Ok((receiver, sender))
    }

    /// Base sender of the queue. Only available while connected.
    pub fn sender(&self) -> Result<SenderHandle> {
        self.handle(&self.sender)
    }

    pub fn receiver(&self) -> Result<ReceiverHandle> {
        self.handle(&self.receiver)
    }

    fn handle<T: Clone>(&self, slot: &Mutex<Option<T>>) -> Result<T> {
        match self.state() {
            ConnectionState::Connected => lock(slot)
                .clone()
                .ok_or_else(|| BusError::NotConnected(self.queue_name.clone())),
            ConnectionState::Closed => Err(BusError::ConnectionClosed(self.queue_name.clone())),
            _ => Err(BusError::NotConnected(self.queue_name.clone())),
        }
    }

    /// Moves to `Closed` and releases the transport handles. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }

        let receiver = lock(&self.receiver).take();
        let sender = lock(&self.sender).take();
        let result = release(&self.queue_name, receiver, sender).await;
        info!(queue = %self.queue_name, "Queue connection closed");
        result.map_err(BusError::from)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("queue_name", &self.queue_name)
            .field("state", &self.state())
            .finish()
    }
}

async fn release(
    queue_name: &str,
    receiver: Option<ReceiverHandle>,
    sender: Option<SenderHandle>,
) -> std::result::Result<(), TransportError> {
    let mut first_error = None;
    if let Some(receiver) = receiver {
        if let Err(err) = receiver.close().await {
            warn!(queue = %queue_name, error = %err, "Failed to close receiver");
            first_error.get_or_insert(err);
        }
    }
    if let Some(sender) = sender {
        if let Err(err) = sender.close().await {
            warn!(queue = %queue_name, error = %err, "Failed to close sender");
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Routes deliveries of one queue to their handlers.
///
/// Every failure ends up in the error sink; nothing escapes into the
/// subscription.
pub struct Dispatcher {
    queue_name: String,
    registry: Arc<HandlerRegistry>,
    message_type_property: String,
    error_sink: Arc<dyn ErrorSink>,
}

impl Dispatcher {
    async fn dispatch(&self, message: &ReceivedMessage, receiver: &ReceiverHandle) -> Result<()> {
        let message_type = if self.registry.is_typed() {
            message
                .property(&self.message_type_property)
                .and_then(|value| value.as_str())
        } else {
            None
        };
        let binding = self.registry.resolve(message_type)?;

        debug!(
            queue = %self.queue_name,
            message_id = %message.message.message_id,
            handler = %binding.name(),
            "Dispatching message"
        );

        match AssertUnwindSafe(binding.invoke(message, receiver))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(BusError::Handler {
                handler: binding.name(),
                source,
            }),
            Err(_) => Err(BusError::HandlerPanicked(binding.name())),
        }
    }
}

#[async_trait]
impl MessageListener for Dispatcher {
    async fn on_message(&self, message: ReceivedMessage, receiver: ReceiverHandle) -> Settlement {
        match self.dispatch(&message, &receiver).await {
            Ok(()) => Settlement::Complete,
            Err(error) => {
                self.error_sink.report(DispatchFailure {
                    queue: self.queue_name.clone(),
                    message_id: Some(message.message.message_id.clone()),
                    error,
                });
                Settlement::Abandon
            }
        }
    }

    async fn on_error(&self, error: TransportError) {
        self.error_sink.report(DispatchFailure {
            queue: self.queue_name.clone(),
            message_id: None,
            error: BusError::Transport(error),
        });
    }
}
