// src/messaging/memory.rs
//! In-process transport used for local development and tests.
//!
//! Each queue is an unbounded tokio channel. A subscription holds the lock on
//! the consuming half, so a queue feeds one subscription at a time; closing the
//! receiver hands the queue back with its pending messages.
//! Settled deliveries and call counts are recorded so tests can observe what
//! the layer above asked the broker to do.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::TransportError;
use super::transport::{
    MessageListener, Receiver, ReceiverHandle, Sender, SenderHandle, Transport,
};
use super::types::{
    Message, ReceiveMode, ReceivedMessage, ReceiverOptions, Settlement, SubscribeOptions,
};

struct MemoryQueue {
    tx: mpsc::UnboundedSender<ReceivedMessage>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<ReceivedMessage>>>,
    errors: Option<mpsc::UnboundedSender<TransportError>>,
    history: Vec<Message>,
    completed: Vec<String>,
    abandoned: Vec<String>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            errors: None,
            history: Vec::new(),
            completed: Vec::new(),
            abandoned: Vec::new(),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    exists_calls: HashMap<String, usize>,
    create_queue_calls: HashMap<String, usize>,
    create_sender_calls: HashMap<String, usize>,
    create_receiver_calls: HashMap<String, usize>,
    racing: HashSet<String>,
    failing: HashMap<String, TransportError>,
}

struct Broker {
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
}

impl Broker {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, queue_name: &str, message: Message) -> Result<(), TransportError> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| TransportError::QueueNotFound(queue_name.to_string()))?;
        queue.history.push(message.clone());
        queue
            .tx
            .send(ReceivedMessage::new(message, tag))
            .map_err(|_| TransportError::Closed(queue_name.to_string()))
    }

    fn record(&self, queue_name: &str, message: &ReceivedMessage, settlement: Settlement) {
        let mut state = self.lock();
        if let Some(queue) = state.queues.get_mut(queue_name) {
            let id = message.message.message_id.clone();
            match settlement {
                Settlement::Complete => queue.completed.push(id),
                Settlement::Abandon => queue.abandoned.push(id),
            }
        }
    }
}

/// A broker living entirely inside the current process.
pub struct InMemoryTransport {
    broker: Arc<Broker>,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker {
                state: Mutex::new(BrokerState::default()),
                next_tag: AtomicU64::new(0),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Next `create_queue(name)` loses a race: `queue_exists` keeps answering
    /// false, while creation answers "already exists".
    pub fn simulate_create_race(&self, name: &str) {
        self.broker.lock().racing.insert(name.to_string());
    }

    /// Every `create_queue(name)` fails with `error`.
    pub fn fail_create_queue(&self, name: &str, error: TransportError) {
        self.broker.lock().failing.insert(name.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.broker.lock();
        state.failing.clear();
        state.racing.clear();
    }

    /// Pushes a transport fault into the active subscription on `name`.
    /// Returns false when nothing is subscribed.
    pub fn inject_error(&self, name: &str, error: TransportError) -> bool {
        let state = self.broker.lock();
        state
            .queues
            .get(name)
            .and_then(|queue| queue.errors.as_ref())
            .map(|errors| errors.send(error).is_ok())
            .unwrap_or(false)
    }

    /// Delivers a message as if an external producer had sent it.
    pub fn deliver(&self, name: &str, message: Message) -> Result<(), TransportError> {
        self.broker.enqueue(name, message)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.broker.lock().queues.contains_key(name)
    }

    pub fn queue_exists_calls(&self, name: &str) -> usize {
        self.broker.lock().exists_calls.get(name).copied().unwrap_or(0)
    }

    pub fn create_queue_calls(&self, name: &str) -> usize {
        self.broker.lock().create_queue_calls.get(name).copied().unwrap_or(0)
    }

    pub fn create_sender_calls(&self, name: &str) -> usize {
        self.broker.lock().create_sender_calls.get(name).copied().unwrap_or(0)
    }

    pub fn create_receiver_calls(&self, name: &str) -> usize {
        self.broker.lock().create_receiver_calls.get(name).copied().unwrap_or(0)
    }

    /// Every message ever enqueued on `name`, in send order.
    pub fn sent_messages(&self, name: &str) -> Vec<Message> {
        self.broker
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.history.clone())
            .unwrap_or_default()
    }

    pub fn completed(&self, name: &str) -> Vec<String> {
        self.broker
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.completed.clone())
            .unwrap_or_default()
    }

    pub fn abandoned(&self, name: &str) -> Vec<String> {
        self.broker
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.abandoned.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed("in-memory transport".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn queue_exists(&self, name: &str) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        *state.exists_calls.entry(name.to_string()).or_default() += 1;
        if state.racing.contains(name) {
            return Ok(false);
        }
        Ok(state.queues.contains_key(name))
    }

    async fn create_queue(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        *state.create_queue_calls.entry(name.to_string()).or_default() += 1;

        if let Some(error) = state.failing.get(name) {
            return Err(error.clone());
        }
        if state.racing.remove(name) {
            // The competing creator wins.
            state.queues.entry(name.to_string()).or_insert_with(MemoryQueue::new);
            return Err(TransportError::QueueAlreadyExists(name.to_string()));
        }
        if state.queues.contains_key(name) {
            return Err(TransportError::QueueAlreadyExists(name.to_string()));
        }

        state.queues.insert(name.to_string(), MemoryQueue::new());
        debug!(queue = %name, "In-memory queue created");
        Ok(())
    }

    async fn create_receiver(
        &self,
        name: &str,
        options: &ReceiverOptions,
    ) -> Result<ReceiverHandle, TransportError> {
        self.ensure_open()?;
        {
            let mut state = self.broker.lock();
            *state.create_receiver_calls.entry(name.to_string()).or_default() += 1;
            if !state.queues.contains_key(name) {
                return Err(TransportError::QueueNotFound(name.to_string()));
            }
        }

        let broker = self.broker.clone();
        let options = options.clone();
        let name = name.to_string();
        let receiver: Arc<MemoryReceiver> = Arc::new_cyclic(|me| MemoryReceiver {
            me: me.clone(),
            queue_name: name,
            broker,
            options,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Ok(receiver)
    }

    async fn create_sender(&self, name: &str) -> Result<SenderHandle, TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        *state.create_sender_calls.entry(name.to_string()).or_default() += 1;
        if !state.queues.contains_key(name) {
            return Err(TransportError::QueueNotFound(name.to_string()));
        }
        Ok(Arc::new(MemorySender {
            queue_name: name.to_string(),
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryReceiver {
    me: Weak<MemoryReceiver>,
    queue_name: String,
    broker: Arc<Broker>,
    options: ReceiverOptions,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryReceiver {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.queue_name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Receiver for MemoryReceiver {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn subscribe(
        &self,
        listener: Arc<dyn MessageListener>,
        options: &SubscribeOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let handle: ReceiverHandle = self
            .me
            .upgrade()
            .ok_or_else(|| TransportError::Closed(self.queue_name.clone()))?;

        let (mut messages, mut errors) = {
            let mut state = self.broker.lock();
            let queue = state
                .queues
                .get_mut(&self.queue_name)
                .ok_or_else(|| TransportError::QueueNotFound(self.queue_name.clone()))?;
            let messages = queue
                .rx
                .clone()
                .try_lock_owned()
                .map_err(|_| TransportError::AlreadySubscribed(self.queue_name.clone()))?;
            let (error_tx, error_rx) = mpsc::unbounded_channel();
            queue.errors = Some(error_tx);
            (messages, error_rx)
        };

        let settle = self.options.receive_mode == ReceiveMode::PeekLock
            && options.auto_complete_messages;
        let permits = Arc::new(Semaphore::new(options.max_concurrent_calls.max(1)));
        let broker = self.broker.clone();
        let queue_name = self.queue_name.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(message) = messages.recv() => {
                        let permit = match permits.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let listener = listener.clone();
                        let handle = handle.clone();
                        let broker = broker.clone();
                        let queue_name = queue_name.clone();
                        tokio::spawn(async move {
                            let settlement = listener.on_message(message.clone(), handle).await;
                            if settle {
                                broker.record(&queue_name, &message, settlement);
                            }
                            drop(permit);
                        });
                    }
                    Some(error) = errors.recv() => {
                        listener.on_error(error).await;
                    }
                    else => break,
                }
            }
            debug!(queue = %queue_name, "In-memory subscription finished");
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.record(&self.queue_name, message, Settlement::Complete);
        Ok(())
    }

    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.record(&self.queue_name, message, Settlement::Abandon);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            // Dropping the aborted loop releases the queue for the next subscriber.
            let _ = task.await;
        }
        let mut state = self.broker.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue_name) {
            queue.errors = None;
        } else {
            warn!(queue = %self.queue_name, "Closing receiver for a queue that no longer exists");
        }
        Ok(())
    }
}

struct MemorySender {
    queue_name: String,
    broker: Arc<Broker>,
    closed: AtomicBool,
}

#[async_trait]
impl Sender for MemorySender {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.queue_name.clone()));
        }
        self.broker.enqueue(&self.queue_name, message)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
