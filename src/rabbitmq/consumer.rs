// src/rabbitmq/consumer.rs

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::broker::DeliveryStream;

/// Future returned by a [`DeliveryHandler`].
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Caller-supplied processing function, registered once when the
/// [`ConnectionManager`](super::ConnectionManager) is built.
///
/// `Ok(())` acknowledges the message, any error requeues it.
#[derive(Clone)]
pub struct DeliveryHandler {
    handler: Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>,
}

impl DeliveryHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |payload| handler(payload).boxed()),
        }
    }

    pub async fn handle(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        (self.handler)(payload).await
    }
}

impl fmt::Debug for DeliveryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeliveryHandler")
    }
}

/// Applies `handler` to every message of one connection generation, in
/// broker order, until the subscription stream ends.
///
/// Ending here never triggers a reconnect; that is driven solely by the
/// generation's closure signal.
pub(crate) async fn run_delivery_loop(
    mut deliveries: DeliveryStream,
    handler: DeliveryHandler,
    nack_delay: Duration,
    generation: u64,
) {
    info!(generation, "Delivery loop started");

    while let Some(next) = deliveries.next().await {
        let mut delivery = match next {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(generation, error = %err, "Delivery stream failed");
                break;
            }
        };

        let delivery_tag = delivery.delivery_tag;
        let payload = std::mem::take(&mut delivery.data);

        match handler.handle(payload).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(generation, delivery_tag, "Failed to acknowledge message: {}", e);
                } else {
                    debug!(generation, delivery_tag, "Message acknowledged");
                }
            }
            Err(err) => {
                warn!(
                    generation,
                    delivery_tag,
                    redelivered = delivery.redelivered,
                    "Error processing message, requeueing: {:#}",
                    err
                );
                // Keeps a persistently failing dependency from spinning redeliveries.
                if !nack_delay.is_zero() {
                    sleep(nack_delay).await;
                }
                if let Err(e) = delivery.nack(true).await {
                    error!(generation, delivery_tag, "Failed to negatively acknowledge message: {}", e);
                }
            }
        }
    }

    info!(generation, "Delivery loop ended");
}
