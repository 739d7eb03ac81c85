// src/rabbitmq/broker.rs
//! The seam between the connection manager and a concrete AMQP client.
//!
//! [`ConnectionManager`](super::ConnectionManager) only talks to these traits,
//! so the same state machine drives lapin in production
//! ([`LapinBroker`](super::LapinBroker)) and the in-process
//! [`MockBroker`](super::mock::MockBroker) in tests.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::oneshot;

use super::channel_manager::ChannelConfig;
use super::errors::Result;

/// Inbound deliveries of one subscription. The stream ends (or yields an
/// error) when the channel or connection carrying it goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message pulled from the queue, together with the means to settle it.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        data: Vec<u8>,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker: Box::new(acker),
        }
    }

    /// Removes the message from the broker permanently.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Hands the message back; with `requeue` it will be delivered again.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Sending half of a [`ClosureSignal`]. Cheap to clone so the connection and
/// the channel of one generation can share it; only the first `fire` counts.
#[derive(Clone)]
pub struct ClosureTrigger {
    tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl ClosureTrigger {
    /// Returns `false` if the signal had already fired.
    pub fn fire(&self, reason: impl Into<String>) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(tx) => {
                // The receiving side may already be gone (teardown); that is fine.
                let _ = tx.send(reason.into());
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for ClosureTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureTrigger")
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// One-shot notification that a connection generation was lost.
///
/// Consumed by value when awaited, so a signal can never be re-armed for a
/// later generation.
#[derive(Debug)]
pub struct ClosureSignal {
    rx: oneshot::Receiver<String>,
}

impl ClosureSignal {
    /// Resolves with the closure reason. A trigger dropped without firing
    /// means the resources that held it are gone, which is also a closure.
    pub async fn closed(self) -> String {
        match self.rx.await {
            Ok(reason) => reason,
            Err(_) => "closure trigger dropped".to_string(),
        }
    }
}

/// Creates a fresh trigger/signal pair for one connection generation.
pub fn closure_signal() -> (ClosureTrigger, ClosureSignal) {
    let (tx, rx) = oneshot::channel();
    (
        ClosureTrigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ClosureSignal { rx },
    )
}

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Opens a channel and applies QoS / confirm settings from `config`.
    async fn create_channel(&self, config: &ChannelConfig) -> Result<Self::Channel>;

    /// Arranges for `trigger` to fire when the connection is lost.
    fn on_close(&self, trigger: ClosureTrigger);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Arranges for `trigger` to fire when the channel is lost.
    fn on_close(&self, trigger: ClosureTrigger);

    /// Declares `queue` durable, non-exclusive and non-auto-delete.
    async fn queue_declare(&self, queue: &str) -> Result<QueueInfo>;

    /// Subscribes to `queue` with manual acknowledgement.
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Publishes `payload` persistently through the default exchange with
    /// `queue` as routing key.
    async fn basic_publish(&self, queue: &str, payload: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
