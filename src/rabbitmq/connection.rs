// src/rabbitmq/connection.rs
//! Resilient connection manager.
//!
//! A [`ConnectionManager`] owns exactly one live connection generation at a
//! time: a connection, a channel on it, the declared queue and (when a
//! [`DeliveryHandler`] is registered) a consumer subscription. The whole set is
//! kept in an immutable [`BrokerHandle`] that is swapped in and out as a unit,
//! so publishers either see a complete handle or none at all.
//!
//! ```text
//!  CONNECTING ──(connect, channel, declare, consume)──▶ READY
//!      ▲                                                  │
//!      └────────────(closure signal fires)────────────────┘
//!
//!  shutdown() from any state ──▶ CLOSED
//! ```
//!
//! A failure at any connect step tears down what was opened so far and the
//! sequence restarts after a fixed delay, forever, until it succeeds or the
//! manager is shut down.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::amqp_client::LapinBroker;
use super::broker::{
    closure_signal, Broker, BrokerChannel, BrokerConnection, ClosureSignal, DeliveryStream,
    QueueInfo,
};
use super::channel_manager::ChannelConfig;
use super::consumer::{run_delivery_loop, DeliveryHandler};
use super::errors::{RabbitMQError, Result};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_NACK_DELAY: Duration = Duration::from_secs(1);

/// Everything needed to (re)build a connection generation.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub uri: String,
    pub queue: String,
    /// Fixed pause between failed connect attempts. There is no cap on the
    /// number of attempts.
    pub reconnect_delay: Duration,
    /// Pause before requeueing a message whose handler failed.
    pub nack_delay: Duration,
    pub channel: ChannelConfig,
}

impl QueueSettings {
    pub fn new(uri: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            queue: queue.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            nack_delay: DEFAULT_NACK_DELAY,
            channel: ChannelConfig::default(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_nack_delay(mut self, delay: Duration) -> Self {
        self.nack_delay = delay;
        self
    }

    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Connecting,
    Ready,
    Closed,
}

type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

/// The live resources of one connection generation. Never mutated after
/// construction; replaced wholesale on reconnect.
struct BrokerHandle<B: Broker> {
    generation: u64,
    connection: B::Connection,
    channel: ChannelOf<B>,
    queue: QueueInfo,
}

impl<B: Broker> BrokerHandle<B> {
    /// Channel first, then connection. Errors are expected when the
    /// generation already died and are only logged.
    async fn close(&self) {
        teardown(Some(&self.channel), &self.connection).await;
        debug!(generation = self.generation, "Connection generation closed");
    }
}

async fn teardown<C: BrokerConnection>(channel: Option<&C::Channel>, connection: &C) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            debug!("Ignoring channel close error: {}", e);
        }
    }
    if let Err(e) = connection.close().await {
        debug!("Ignoring connection close error: {}", e);
    }
}

/// A fully opened but not yet installed generation.
struct PendingGeneration<B: Broker> {
    handle: BrokerHandle<B>,
    signal: ClosureSignal,
    deliveries: Option<DeliveryStream>,
}

struct Inner<B: Broker> {
    broker: B,
    settings: QueueSettings,
    handler: Option<DeliveryHandler>,
    current: RwLock<Option<Arc<BrokerHandle<B>>>>,
    ready: AtomicBool,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Cheaply cloneable handle to the shared connection state.
pub struct ConnectionManager<B: Broker = LapinBroker> {
    inner: Arc<Inner<B>>,
}

impl<B: Broker> Clone for ConnectionManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Broker> fmt::Debug for ConnectionManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("queue", &self.inner.settings.queue)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("consumer", &self.inner.handler.is_some())
            .finish()
    }
}

impl ConnectionManager<LapinBroker> {
    /// Connects to RabbitMQ through lapin. Does not return before the queue
    /// is usable; see [`ConnectionManager::with_broker`].
    pub async fn new(settings: QueueSettings, handler: Option<DeliveryHandler>) -> Self {
        Self::with_broker(LapinBroker::new(), settings, handler).await
    }
}

impl<B: Broker> ConnectionManager<B> {
    /// Builds the first connection generation, retrying until it succeeds,
    /// then starts the reconnect watcher in the background.
    ///
    /// Callers that must not block on an unreachable broker should run this
    /// on a separate task and gate their own readiness on it.
    pub async fn with_broker(
        broker: B,
        settings: QueueSettings,
        handler: Option<DeliveryHandler>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            broker,
            settings,
            handler,
            current: RwLock::new(None),
            ready: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            shutdown,
        });

        if let Some(signal) = inner.reconnect().await {
            tokio::spawn(inner.clone().maintain(signal));
        }

        Self { inner }
    }

    /// Publishes `data` persistently to the managed queue.
    ///
    /// Fails fast with [`RabbitMQError::NotReady`] when no generation is
    /// installed; nothing is buffered or retried. Broker errors are returned
    /// as they are.
    pub async fn publish(&self, data: &[u8]) -> Result<()> {
        let handle = self
            .inner
            .current
            .read()
            .await
            .clone()
            .ok_or(RabbitMQError::NotReady)?;

        handle
            .channel
            .basic_publish(&self.inner.settings.queue, data)
            .await
    }

    /// Stops reconnecting and releases the current channel and connection.
    /// Safe to call any number of times.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            debug!(queue = %self.inner.settings.queue, "Shutdown already requested");
            return;
        }

        info!(queue = %self.inner.settings.queue, "Shutting down connection manager");
        let handle = {
            let mut current = self.inner.current.write().await;
            self.inner.ready.store(false, Ordering::SeqCst);
            current.take()
        };
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ManagerState {
        if self.inner.is_shutdown() {
            ManagerState::Closed
        } else if self.is_ready() {
            ManagerState::Ready
        } else {
            ManagerState::Connecting
        }
    }

    /// Number of the most recently installed generation, starting at 1.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.settings.queue
    }

    /// Declaration result of the current generation, if any.
    pub async fn queue_info(&self) -> Option<QueueInfo> {
        self.inner
            .current
            .read()
            .await
            .as_ref()
            .map(|handle| handle.queue.clone())
    }
}

impl<B: Broker> Inner<B> {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Watches one generation's closure signal at a time and rebuilds the
    /// connection when it fires.
    async fn maintain(self: Arc<Self>, mut signal: ClosureSignal) {
        loop {
            let reason = tokio::select! {
                // A closure that fired is seen before a shutdown that is also
                // pending, so the shutdown check below decides.
                biased;
                reason = signal.closed() => reason,
                _ = wait_for_shutdown(self.shutdown.subscribe()) => {
                    debug!(queue = %self.settings.queue, "Reconnect watcher stopped");
                    return;
                }
            };

            if self.is_shutdown() {
                debug!(reason = %reason, "Connection closed after shutdown; not reconnecting");
                return;
            }

            warn!(
                queue = %self.settings.queue,
                generation = self.generation.load(Ordering::SeqCst),
                reason = %reason,
                "Connection to RabbitMQ closed"
            );

            let stale = {
                let mut current = self.current.write().await;
                self.ready.store(false, Ordering::SeqCst);
                current.take()
            };
            if let Some(stale) = stale {
                stale.close().await;
            }

            match self.reconnect().await {
                Some(next) => signal = next,
                None => return,
            }
        }
    }

    /// Retries [`Self::open_generation`] on a fixed delay until it succeeds.
    /// Returns `None` only when shutdown was requested in the meantime.
    async fn reconnect(&self) -> Option<ClosureSignal> {
        let mut attempt: u64 = 0;

        loop {
            if self.is_shutdown() {
                return None;
            }
            attempt += 1;

            match self.open_generation().await {
                Ok(pending) => return self.install(pending).await,
                Err(err) => {
                    error!(
                        queue = %self.settings.queue,
                        attempt,
                        kind = err.kind(),
                        "Failed to connect to RabbitMQ: {}",
                        err
                    );
                    tokio::select! {
                        _ = sleep(self.settings.reconnect_delay) => {}
                        _ = wait_for_shutdown(self.shutdown.subscribe()) => return None,
                    }
                }
            }
        }
    }

    /// Connection, channel, queue declaration and optional subscription, in
    /// that order. Anything opened before a failing step is closed again.
    async fn open_generation(&self) -> Result<PendingGeneration<B>> {
        let settings = &self.settings;
        let generation = self.generation.load(Ordering::SeqCst) + 1;

        info!(uri = %redact(&settings.uri), attempt_generation = generation, "Attempting to connect to RabbitMQ");
        let connection = self.broker.connect(&settings.uri).await?;

        // Fresh per generation; the previous signal has already been consumed.
        let (trigger, signal) = closure_signal();
        connection.on_close(trigger.clone());

        let channel = match connection.create_channel(&settings.channel).await {
            Ok(channel) => channel,
            Err(err) => {
                teardown::<B::Connection>(None, &connection).await;
                return Err(err);
            }
        };
        channel.on_close(trigger);

        let queue = match channel.queue_declare(&settings.queue).await {
            Ok(queue) => queue,
            Err(err) => {
                teardown(Some(&channel), &connection).await;
                return Err(err);
            }
        };

        let deliveries = match self.handler {
            Some(_) => {
                let consumer_tag = settings.channel.consumer_tag(generation);
                match channel.basic_consume(&settings.queue, &consumer_tag).await {
                    Ok(deliveries) => Some(deliveries),
                    Err(err) => {
                        teardown(Some(&channel), &connection).await;
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        Ok(PendingGeneration {
            handle: BrokerHandle {
                generation,
                connection,
                channel,
                queue,
            },
            signal,
            deliveries,
        })
    }

    /// Makes `pending` the current generation and starts its delivery loop.
    /// A shutdown that raced with the connect wins: the generation is closed
    /// instead of installed.
    async fn install(&self, pending: PendingGeneration<B>) -> Option<ClosureSignal> {
        let PendingGeneration {
            handle,
            signal,
            deliveries,
        } = pending;
        let handle = Arc::new(handle);

        {
            let mut current = self.current.write().await;
            if self.is_shutdown() {
                drop(current);
                handle.close().await;
                return None;
            }
            *current = Some(handle.clone());
            self.generation.store(handle.generation, Ordering::SeqCst);
            self.ready.store(true, Ordering::SeqCst);
        }

        info!(
            queue = %handle.queue.name,
            generation = handle.generation,
            messages = handle.queue.message_count,
            consumers = handle.queue.consumer_count,
            "Connection to RabbitMQ established"
        );

        if let (Some(handler), Some(deliveries)) = (&self.handler, deliveries) {
            tokio::spawn(run_delivery_loop(
                deliveries,
                handler.clone(),
                self.settings.nack_delay,
                handle.generation,
            ));
        }

        Some(signal)
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens once the
    // manager itself has been dropped.
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Hides the password part of an AMQP URI for logging.
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let userinfo = &uri[scheme_end + 3..at];
            match userinfo.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &uri[..scheme_end + 3],
                    &userinfo[..colon],
                    &uri[at..]
                ),
                None => uri.to_string(),
            }
        }
        _ => uri.to_string(),
    }
}
