// src/bus/handler.rs
//! Handler bindings invoked by the dispatcher.
//!
//! `MessageHandler` is the object-safe shape the registry stores. Closures go
//! through [`handler_fn`]; handlers that want a decoded payload implement
//! [`TypedMessageHandler`] and are wrapped in a [`JsonHandler`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::messaging::{ReceivedMessage, ReceiverHandle};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ReceivedMessage, receiver: &ReceiverHandle) -> anyhow::Result<()>;
}

/// `(owner, method)` pair bound to a queue or message type.
#[derive(Clone)]
pub struct HandlerBinding {
    owner: String,
    method: String,
    handler: Arc<dyn MessageHandler>,
}

impl HandlerBinding {
    pub fn new<H>(owner: impl Into<String>, method: impl Into<String>, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        Self::from_arc(owner, method, Arc::new(handler))
    }

    pub fn from_arc(
        owner: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            owner: owner.into(),
            method: method.into(),
            handler,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `owner::method`, used in logs and error reports.
    pub fn name(&self) -> String {
        format!("{}::{}", self.owner, self.method)
    }

    pub async fn invoke(&self, message: &ReceivedMessage, receiver: &ReceiverHandle) -> anyhow::Result<()> {
        self.handler.handle(message, receiver).await
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("owner", &self.owner)
            .field("method", &self.method)
            .finish()
    }
}

pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure taking `(message, receiver)`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ReceivedMessage, ReceiverHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ReceivedMessage, ReceiverHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &ReceivedMessage, receiver: &ReceiverHandle) -> anyhow::Result<()> {
        (self.f)(message.clone(), receiver.clone()).await
    }
}

/// A handler for one payload type.
#[async_trait]
pub trait TypedMessageHandler<T>: Send + Sync {
    async fn handle(&self, payload: T, message: &ReceivedMessage, receiver: &ReceiverHandle) -> anyhow::Result<()>;
}

/// Decodes the JSON body into `T` before calling the typed handler.
pub struct JsonHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> JsonHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: TypedMessageHandler<T>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> MessageHandler for JsonHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: TypedMessageHandler<T>,
{
    async fn handle(&self, message: &ReceivedMessage, receiver: &ReceiverHandle) -> anyhow::Result<()> {
        let payload: T = message
            .message
            .decode()
            .map_err(|e| anyhow::anyhow!("json decode: {e}"))?;
        self.handler.handle(payload, message, receiver).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InMemoryTransport, Message, ReceiverOptions, Transport};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Deserialize)]
    struct Charge {
        amount: i64,
    }

    struct ChargeHandler {
        total: Arc<AtomicI64>,
    }

    #[async_trait]
    impl TypedMessageHandler<Charge> for ChargeHandler {
        async fn handle(&self, payload: Charge, _message: &ReceivedMessage, _receiver: &ReceiverHandle) -> anyhow::Result<()> {
            self.total.fetch_add(payload.amount, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn receiver() -> ReceiverHandle {
        let transport = InMemoryTransport::new();
        transport.create_queue("Q").await.unwrap();
        transport.create_receiver("Q", &ReceiverOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn json_handler_decodes_payload() {
        let total = Arc::new(AtomicI64::new(0));
        let binding = HandlerBinding::new(
            "Billing",
            "charge",
            JsonHandler::new(ChargeHandler { total: total.clone() }),
        );
        let message = ReceivedMessage::new(Message::new(r#"{"amount": 42}"#), 1);

        binding.invoke(&message, &receiver().await).await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 42);
        assert_eq!(binding.name(), "Billing::charge");
    }

    #[tokio::test]
    async fn json_handler_reports_bad_payload() {
        let binding = HandlerBinding::new(
            "Billing",
            "charge",
            JsonHandler::new(ChargeHandler { total: Arc::new(AtomicI64::new(0)) }),
        );
        let message = ReceivedMessage::new(Message::new("not json"), 1);

        let err = binding.invoke(&message, &receiver().await).await.unwrap_err();
        assert!(err.to_string().starts_with("json decode"));
    }

    #[tokio::test]
    async fn closures_can_be_bound() {
        let binding = HandlerBinding::new(
            "Orders",
            "create",
            handler_fn(|message: ReceivedMessage, _receiver: ReceiverHandle| async move {
                anyhow::ensure!(!message.body().is_empty(), "empty body");
                Ok(())
            }),
        );
        let receiver = receiver().await;
        assert!(binding.invoke(&ReceivedMessage::new(Message::new("x"), 1), &receiver).await.is_ok());
        assert!(binding.invoke(&ReceivedMessage::new(Message::new(""), 2), &receiver).await.is_err());
    }
}
