// src/rabbitmq/mock.rs
//! In-process broker for tests and local development.
//!
//! [`MockBroker`] implements the broker traits over a single in-memory queue
//! with RabbitMQ's delivery semantics where they matter to the connection
//! manager:
//!
//! - manual acknowledgement: a delivered message stays unacked until it is
//!   acked (removed) or nacked (dropped, or requeued at the head and marked
//!   redelivered)
//! - a connection or channel going away returns its unacked messages to the
//!   queue and ends the subscription stream
//! - [`MockBroker::sever`] kills the live connection the way a network
//!   failure would, firing its closure triggers
//! - [`MockBroker::fire_on_close`] makes a deliberate close report an error
//!   as well, as when the peer drops the socket during the close handshake
//!
//! Every connect step can be made to fail on demand, and all traffic is
//! recorded for assertions. All routing keys land in the one queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, ClosureTrigger, Delivery,
    DeliveryStream, QueueInfo,
};
use super::channel_manager::ChannelConfig;
use super::errors::{RabbitMQError, Result};

/// The steps a connection generation goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStep {
    Connect,
    Channel,
    Declare,
    Consume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub connection_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub connection_id: u64,
}

/// Resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub connect_attempts: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
}

struct StoredMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    connection_id: u64,
    message: StoredMessage,
}

struct ConnectionSlot {
    open: bool,
    triggers: Vec<ClosureTrigger>,
    /// Triggers that already fired, kept so tests can fire them again.
    fired: Vec<ClosureTrigger>,
}

impl ConnectionSlot {
    /// Marks the connection closed and fires its triggers with `reason`.
    fn fail(&mut self, reason: &str) {
        self.open = false;
        for trigger in std::mem::take(&mut self.triggers) {
            trigger.fire(reason);
            self.fired.push(trigger);
        }
    }
}

struct ConsumerSlot {
    connection_id: u64,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct MockState {
    next_connection_id: u64,
    next_delivery_tag: u64,
    failures: HashMap<ConnectStep, u32>,
    refuse_connections: bool,
    publish_failure: Option<String>,
    close_failure: Option<String>,
    connections: HashMap<u64, ConnectionSlot>,
    queue: VecDeque<StoredMessage>,
    consumer: Option<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    declared: Vec<String>,
    consumer_tags: Vec<String>,
    channel_configs: Vec<ChannelConfig>,
    published: Vec<PublishedMessage>,
    delivered: Vec<DeliveryRecord>,
    acked: Vec<Vec<u8>>,
    nacked: Vec<(Vec<u8>, bool)>,
    stats: MockStats,
}

impl MockState {
    fn take_failure(&mut self, step: ConnectStep) -> bool {
        match self.failures.get_mut(&step) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn is_open(&self, connection_id: u64) -> bool {
        self.connections
            .get(&connection_id)
            .map(|slot| slot.open)
            .unwrap_or(false)
    }

    /// Ends the subscription owned by `connection_id` and puts its unacked
    /// messages back at the head of the queue, oldest first.
    fn release_connection(&mut self, connection_id: u64) {
        if self
            .consumer
            .as_ref()
            .map(|consumer| consumer.connection_id == connection_id)
            .unwrap_or(false)
        {
            self.consumer = None;
        }

        let mut returned: Vec<(u64, StoredMessage)> = Vec::new();
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                returned.push((tag, entry.message));
            }
        }
        returned.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in returned.into_iter().rev() {
            message.redelivered = true;
            self.queue.push_front(message);
        }
    }
}

/// Cloning shares the same broker state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    /// Makes the next `times` attempts at `step` fail.
    pub fn fail_next(&self, step: ConnectStep, times: u32) {
        *self.lock().failures.entry(step).or_insert(0) += times;
    }

    /// While set, every connection attempt is refused.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// While set, every publish fails with this broker error text.
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.lock().publish_failure = reason.map(str::to_string);
    }

    /// While set, closing a connection also fires its closure triggers with
    /// this reason instead of dropping them silently.
    pub fn fire_on_close(&self, reason: Option<&str>) {
        self.lock().close_failure = reason.map(str::to_string);
    }

    /// Drops every open connection as a network failure would. Returns the
    /// number of connections severed.
    pub fn sever(&self, reason: &str) -> usize {
        let mut state = self.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, slot)| slot.open)
            .map(|(id, _)| *id)
            .collect();

        for id in &open {
            if let Some(slot) = state.connections.get_mut(id) {
                slot.fail(reason);
            }
            state.release_connection(*id);
            debug!(connection_id = id, reason, "Mock connection severed");
        }
        open.len()
    }

    /// Fires again every trigger that connection `connection_id` has already
    /// fired, as a late error callback from a dead connection would. Returns
    /// how many of them actually delivered a closure.
    pub fn refire_closed(&self, connection_id: u64, reason: &str) -> usize {
        let triggers = self
            .lock()
            .connections
            .get(&connection_id)
            .map(|slot| slot.fired.clone())
            .unwrap_or_default();

        triggers
            .iter()
            .filter(|trigger| trigger.fire(reason))
            .count()
    }

    /// Adds a message to the queue as if another producer had published it.
    pub fn enqueue(&self, payload: &[u8]) {
        let mut state = self.lock();
        state.queue.push_back(StoredMessage {
            payload: payload.to_vec(),
            redelivered: false,
        });
        dispatch(&self.state, &mut state);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn delivered(&self) -> Vec<DeliveryRecord> {
        self.lock().delivered.clone()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    /// Nacked payloads with their requeue flag.
    pub fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.lock().nacked.clone()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|slot| slot.open)
            .count()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.lock().declared.clone()
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.lock().consumer_tags.clone()
    }

    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        self.lock().channel_configs.clone()
    }

    pub fn has_consumer(&self) -> bool {
        self.lock().consumer.is_some()
    }

    pub fn stats(&self) -> MockStats {
        self.lock().stats
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockBroker")
            .field("queued", &state.queue.len())
            .field("unacked", &state.unacked.len())
            .field("stats", &state.stats)
            .finish()
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pushes queued messages to the active consumer, if there is one.
fn dispatch(shared: &Arc<Mutex<MockState>>, state: &mut MockState) {
    while let Some(consumer) = state.consumer.as_ref() {
        let connection_id = consumer.connection_id;
        let tx = consumer.tx.clone();
        let Some(message) = state.queue.pop_front() else {
            return;
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let delivery = Delivery::new(
            delivery_tag,
            message.redelivered,
            message.payload.clone(),
            MockAcker {
                state: shared.clone(),
                delivery_tag,
            },
        );

        if tx.send(Ok(delivery)).is_err() {
            // Subscriber went away without its channel closing.
            state.queue.push_front(message);
            state.consumer = None;
            return;
        }

        trace!(delivery_tag, connection_id, "Mock delivery dispatched");
        state.delivered.push(DeliveryRecord {
            delivery_tag,
            payload: message.payload.clone(),
            redelivered: message.redelivered,
            connection_id,
        });
        state.unacked.insert(
            delivery_tag,
            Unacked {
                connection_id,
                message,
            },
        );
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Connection = MockConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection> {
        let mut state = self.lock();
        state.stats.connect_attempts += 1;
        if state.refuse_connections || state.take_failure(ConnectStep::Connect) {
            return Err(RabbitMQError::connection(format!(
                "connection refused: {}",
                uri
            )));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            ConnectionSlot {
                open: true,
                triggers: Vec::new(),
                fired: Vec::new(),
            },
        );
        state.stats.connections_opened += 1;

        Ok(MockConnection {
            id,
            state: self.state.clone(),
        })
    }
}

pub struct MockConnection {
    id: u64,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    fn register(&self, trigger: ClosureTrigger) {
        let mut state = lock_state(&self.state);
        match state.connections.get_mut(&self.id) {
            Some(slot) if slot.open => slot.triggers.push(trigger),
            _ => {
                trigger.fire("connection already closed");
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    type Channel = MockChannel;

    async fn create_channel(&self, config: &ChannelConfig) -> Result<Self::Channel> {
        let mut state = lock_state(&self.state);
        if state.take_failure(ConnectStep::Channel) {
            return Err(RabbitMQError::channel("channel open refused"));
        }
        if !state.is_open(self.id) {
            return Err(RabbitMQError::channel("connection is closed"));
        }
        state.stats.channels_opened += 1;
        state.channel_configs.push(config.clone());

        Ok(MockChannel {
            connection: MockConnection {
                id: self.id,
                state: self.state.clone(),
            },
            closed: AtomicBool::new(false),
        })
    }

    fn on_close(&self, trigger: ClosureTrigger) {
        self.register(trigger);
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock_state(&self.state);
        let close_failure = state.close_failure.clone();
        let was_open = match state.connections.get_mut(&self.id) {
            Some(slot) if slot.open => {
                match close_failure {
                    Some(reason) => slot.fail(&reason),
                    None => {
                        // A deliberate close does not fire the triggers;
                        // dropping them resolves any signal still being watched.
                        slot.open = false;
                        slot.triggers.clear();
                    }
                }
                true
            }
            _ => false,
        };
        if !was_open {
            return Err(RabbitMQError::connection("connection already closed"));
        }
        state.stats.connections_closed += 1;
        state.release_connection(self.id);
        dispatch(&self.state, &mut state);
        Ok(())
    }
}

pub struct MockChannel {
    connection: MockConnection,
    closed: AtomicBool,
}

impl MockChannel {
    fn ensure_usable(&self, state: &MockState) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !state.is_open(self.connection.id) {
            return Err(RabbitMQError::channel("channel is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn on_close(&self, trigger: ClosureTrigger) {
        self.connection.register(trigger);
    }

    async fn queue_declare(&self, queue: &str) -> Result<QueueInfo> {
        let mut state = lock_state(&self.connection.state);
        if state.take_failure(ConnectStep::Declare) {
            return Err(RabbitMQError::declare("PRECONDITION_FAILED - inequivalent arg 'durable'"));
        }
        self.ensure_usable(&state)?;
        state.declared.push(queue.to_string());

        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: state.queue.len() as u32,
            consumer_count: u32::from(state.consumer.is_some()),
        })
    }

    async fn basic_consume(&self, _queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = lock_state(&self.connection.state);
        if state.take_failure(ConnectStep::Consume) {
            return Err(RabbitMQError::consume("consume refused"));
        }
        self.ensure_usable(&state)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.consumer = Some(ConsumerSlot {
            connection_id: self.connection.id,
            tx,
        });
        state.consumer_tags.push(consumer_tag.to_string());
        dispatch(&self.connection.state, &mut state);

        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn basic_publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut state = lock_state(&self.connection.state);
        if let Err(err) = self.ensure_usable(&state) {
            return Err(RabbitMQError::publish(err));
        }
        if let Some(reason) = state.publish_failure.clone() {
            return Err(RabbitMQError::publish(reason));
        }

        state.published.push(PublishedMessage {
            routing_key: queue.to_string(),
            payload: payload.to_vec(),
            persistent: true,
            connection_id: self.connection.id,
        });
        state.queue.push_back(StoredMessage {
            payload: payload.to_vec(),
            redelivered: false,
        });
        dispatch(&self.connection.state, &mut state);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RabbitMQError::channel("channel already closed"));
        }
        let mut state = lock_state(&self.connection.state);
        state.stats.channels_closed += 1;
        state.release_connection(self.connection.id);
        dispatch(&self.connection.state, &mut state);
        Ok(())
    }
}

struct MockAcker {
    state: Arc<Mutex<MockState>>,
    delivery_tag: u64,
}

impl MockAcker {
    fn settle(&self, state: &mut MockState) -> Result<StoredMessage> {
        let connection_id = state
            .unacked
            .get(&self.delivery_tag)
            .map(|entry| entry.connection_id)
            .ok_or_else(|| {
                RabbitMQError::ack(format!("unknown delivery tag {}", self.delivery_tag))
            })?;
        if !state.is_open(connection_id) {
            return Err(RabbitMQError::ack("channel is closed"));
        }
        state
            .unacked
            .remove(&self.delivery_tag)
            .map(|entry| entry.message)
            .ok_or_else(|| RabbitMQError::ack("delivery already settled"))
    }
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = lock_state(&self.state);
        let message = self.settle(&mut state)?;
        state.acked.push(message.payload);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = lock_state(&self.state);
        let mut message = self.settle(&mut state)?;
        state.nacked.push((message.payload.clone(), requeue));
        if requeue {
            message.redelivered = true;
            state.queue.push_front(message);
            dispatch(&self.state, &mut state);
        }
        Ok(())
    }
}
