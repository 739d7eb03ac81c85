// src/lib.rs
//! Moves profile records from HTTP into a durable RabbitMQ queue and from
//! the queue into PostgreSQL, surviving broker outages by reconnecting.

pub mod acceptor;
pub mod config;
pub mod env;
pub mod logging;
pub mod message;
pub mod rabbitmq;
pub mod shutdown;
pub mod worker;

pub use config::RelayConfig;
pub use message::Profile;
pub use rabbitmq::{ConnectionManager, DeliveryHandler, Publisher, QueueSettings, RabbitMQError};
