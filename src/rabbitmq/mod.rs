// src/rabbitmq/mod.rs
// Resilient RabbitMQ connection management for the profile queue

pub mod errors;
pub mod broker;
pub mod connection;
pub mod mock;

mod amqp_client;
mod channel_manager;
mod consumer;
mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinBroker;
pub use broker::{Delivery, QueueInfo};
pub use channel_manager::ChannelConfig;
pub use connection::{ConnectionManager, ManagerState, QueueSettings};
pub use consumer::{DeliveryHandler, HandlerFuture};
pub use errors::{RabbitMQError, Result};
pub use publisher::Publisher;
