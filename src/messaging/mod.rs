// src/messaging/mod.rs
// Transport-agnostic boundary: message model, transport traits and errors

pub mod error;
pub mod memory;
pub mod transport;
pub mod types;

pub use error::TransportError;
pub use memory::InMemoryTransport;
pub use transport::{MessageListener, Receiver, ReceiverHandle, Sender, SenderHandle, Transport};
pub use types::{
    Message, PropertyValue, ReceiveMode, ReceivedMessage, ReceiverOptions, Settlement,
    SubscribeOptions,
};
