// src/rabbitmq/amqp_client.rs
//! `Transport` over an AMQP 0-9-1 broker.
//!
//! Queues are addressed through the default exchange, so a queue name is also
//! its routing key. Every handle owns its own channel.

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::headers;
use crate::config::BusConfig;
use crate::messaging::{
    Message, MessageListener, ReceiveMode, ReceivedMessage, Receiver, ReceiverHandle,
    ReceiverOptions, Sender, SenderHandle, Settlement, SubscribeOptions, Transport,
    TransportError,
};

const DEFAULT_EXCHANGE: &str = "";
const REPLY_SUCCESS: u16 = 200;

// Passive declares of a missing queue fail with 404 and close the channel.
fn is_not_found(error: &lapin::Error) -> bool {
    let text = error.to_string();
    text.contains("NOT_FOUND") || text.contains("404")
}

pub struct AmqpTransport {
    connection: Connection,
    closed: AtomicBool,
}

impl AmqpTransport {
    /// Connects with the retry policy from `config`.
    pub async fn connect(config: &BusConfig) -> Result<Self, TransportError> {
        let connection = ConnectionManager::from_config(config).connect().await?;
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection,
            closed: AtomicBool::new(false),
        }
    }

    async fn open_channel(&self) -> Result<Channel, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("amqp transport".to_string()));
        }
        self.connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to create channel: {}", e)))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn queue_exists(&self, name: &str) -> Result<bool, TransportError> {
        let channel = self.open_channel().await?;
        let passive = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        match channel.queue_declare(name, passive, FieldTable::default()).await {
            Ok(queue) => {
                debug!(queue = %name, messages = queue.message_count(), "Queue found");
                let _ = channel.close(REPLY_SUCCESS, "Queue check done").await;
                Ok(true)
            }
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // AMQP declares are idempotent, so a concurrent creator never surfaces
    // as QueueAlreadyExists here.
    async fn create_queue(&self, name: &str) -> Result<(), TransportError> {
        let channel = self.open_channel().await?;
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(name, durable, FieldTable::default())
            .await?;
        let _ = channel.close(REPLY_SUCCESS, "Queue declared").await;
        info!(queue = %name, "AMQP queue declared");
        Ok(())
    }

    async fn create_receiver(
        &self,
        name: &str,
        options: &ReceiverOptions,
    ) -> Result<ReceiverHandle, TransportError> {
        let channel = self.open_channel().await?;
        if options.prefetch_count > 0 {
            channel
                .basic_qos(options.prefetch_count, BasicQosOptions::default())
                .await?;
        }

        let name = name.to_string();
        let options = options.clone();
        let receiver: Arc<AmqpReceiver> = Arc::new_cyclic(|me| AmqpReceiver {
            me: me.clone(),
            consumer_tag: format!("{}-{}", name, &Uuid::new_v4().to_string()[..8]),
            queue_name: name,
            channel,
            options,
            task: Mutex::new(None),
            subscribed: AtomicBool::new(false),
        });
        Ok(receiver)
    }

    async fn create_sender(&self, name: &str) -> Result<SenderHandle, TransportError> {
        let channel = self.open_channel().await?;
        Ok(Arc::new(AmqpSender {
            queue_name: name.to_string(),
            channel,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing AMQP connection gracefully");
        self.connection
            .close(REPLY_SUCCESS, "Closing queue bus")
            .await
            .map_err(TransportError::from)
    }
}

struct AmqpReceiver {
    me: Weak<AmqpReceiver>,
    queue_name: String,
    consumer_tag: String,
    channel: Channel,
    options: ReceiverOptions,
    task: Mutex<Option<JoinHandle<()>>>,
    subscribed: AtomicBool,
}

async fn settle(channel: &Channel, message: &ReceivedMessage, settlement: Settlement) -> Result<(), TransportError> {
    let result = match settlement {
        Settlement::Complete => {
            channel
                .basic_ack(message.delivery_tag, BasicAckOptions::default())
                .await
        }
        Settlement::Abandon => {
            // One redelivery, then the broker dead-letters or drops it.
            let requeue = message.delivery_count < 2;
            channel
                .basic_nack(
                    message.delivery_tag,
                    BasicNackOptions {
                        requeue,
                        ..BasicNackOptions::default()
                    },
                )
                .await
        }
    };
    result.map_err(|e| TransportError::Settlement(e.to_string()))
}

#[async_trait]
impl Receiver for AmqpReceiver {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn subscribe(
        &self,
        listener: Arc<dyn MessageListener>,
        options: &SubscribeOptions,
    ) -> Result<(), TransportError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadySubscribed(self.queue_name.clone()));
        }
        let handle: ReceiverHandle = self
            .me
            .upgrade()
            .ok_or_else(|| TransportError::Closed(self.queue_name.clone()))?;

        let no_ack = self.options.receive_mode == ReceiveMode::ReceiveAndDelete;
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                self.subscribed.store(false, Ordering::SeqCst);
                TransportError::Consume(e.to_string())
            })?;

        let auto_settle = !no_ack && options.auto_complete_messages;
        let permits = Arc::new(Semaphore::new(options.max_concurrent_calls.max(1)));
        let channel = self.channel.clone();
        let queue_name = self.queue_name.clone();
        info!(queue = %queue_name, consumer = %self.consumer_tag, "AMQP consumer started");

        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(queue = %queue_name, error = %err, "Error receiving message");
                        listener.on_error(TransportError::Consume(err.to_string())).await;
                        continue;
                    }
                };
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let message = headers::from_delivery(&delivery);
                let listener = listener.clone();
                let handle = handle.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    let settlement = listener.on_message(message.clone(), handle).await;
                    if auto_settle {
                        if let Err(err) = settle(&channel, &message, settlement).await {
                            listener.on_error(err).await;
                        }
                    }
                    drop(permit);
                });
            }
            debug!(queue = %queue_name, "AMQP consumer stream ended");
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        settle(&self.channel, message, Settlement::Complete).await
    }

    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        settle(&self.channel, message, Settlement::Abandon).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.subscribed.load(Ordering::SeqCst) {
            if let Err(err) = self
                .channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(queue = %self.queue_name, error = %err, "Failed to cancel consumer");
            }
        }
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "Closing receiver")
                .await
                .map_err(|e| TransportError::Channel(e.to_string()))?;
        }
        Ok(())
    }
}

struct AmqpSender {
    queue_name: String,
    channel: Channel,
}

#[async_trait]
impl Sender for AmqpSender {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let properties = headers::to_properties(&message);
        self.channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                &self.queue_name,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        debug!(queue = %self.queue_name, message_id = %message.message_id, "Message published");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "Closing sender")
                .await
                .map_err(|e| TransportError::Channel(e.to_string()))?;
        }
        Ok(())
    }
}
