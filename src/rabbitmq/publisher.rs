// src/rabbitmq/publisher.rs

use async_trait::async_trait;

use super::broker::Broker;
use super::connection::ConnectionManager;
use super::errors::Result;

/// What a producer needs from the queue: a fail-fast publish and a readiness
/// probe. Lets the HTTP side be tested without a broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, data: &[u8]) -> Result<()>;

    fn is_ready(&self) -> bool;
}

#[async_trait]
impl<B: Broker> Publisher for ConnectionManager<B> {
    async fn publish(&self, data: &[u8]) -> Result<()> {
        ConnectionManager::publish(self, data).await
    }

    fn is_ready(&self) -> bool {
        ConnectionManager::is_ready(self)
    }
}
