// src/lib.rs
// Handler routing, per-queue connections and sender pooling over a message-queue transport

pub mod bus;
pub mod config;
pub mod env;
pub mod messaging;
pub mod rabbitmq;

pub use bus::{
    handler_fn, BusError, Connection, ConnectionState, HandlerBinding, HandlerSpec, QueueBus,
    SenderKind, TypedSender,
};
pub use config::BusConfig;
pub use messaging::{InMemoryTransport, Message, ReceivedMessage, ReceiverHandle, Transport};
