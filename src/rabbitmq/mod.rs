// src/rabbitmq/mod.rs
// RabbitMQ implementation of the messaging transport

pub mod connection;       // Connection setup with retry policy
pub mod headers;          // Message <-> AMQP properties

mod amqp_client;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::AmqpTransport;
pub use connection::ConnectionManager;
