// src/rabbitmq/amqp_client.rs
//! lapin-backed implementation of the broker traits.

use amq_protocol_types::{ShortShortUInt, ShortUInt};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::debug;

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, ClosureTrigger, Delivery,
    DeliveryStream, QueueInfo,
};
use super::channel_manager::ChannelConfig;
use super::errors::{RabbitMQError, Result};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: ShortUInt = 200;

/// AMQP delivery mode 2: the broker writes the message to disk.
const PERSISTENT: ShortShortUInt = 2;

/// Default exchange; routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Default)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    type Connection = LapinConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(RabbitMQError::connection)?;
        Ok(LapinConnection { inner: connection })
    }
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn create_channel(&self, config: &ChannelConfig) -> Result<Self::Channel> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(RabbitMQError::channel)?;

        if let Err(err) = configure_channel(&channel, config).await {
            let _ = channel.close(REPLY_SUCCESS, "channel configuration failed").await;
            return Err(err);
        }

        debug!(channel_id = %config.id, "Channel created and configured");
        Ok(LapinChannel {
            inner: channel,
            confirm_mode: config.confirm_mode,
        })
    }

    fn on_close(&self, trigger: ClosureTrigger) {
        self.inner.on_error(move |err| {
            trigger.fire(format!("connection error: {}", err));
        });
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(RabbitMQError::connection)
    }
}

async fn configure_channel(channel: &Channel, config: &ChannelConfig) -> Result<()> {
    if config.prefetch_count > 0 {
        debug!("Setting channel QoS to {}", config.prefetch_count);
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::channel(format!("Failed to set QoS: {}", e)))?;
    }

    if config.confirm_mode {
        debug!("Enabling confirm mode for channel {}", config.id);
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::channel(format!("Failed to enable confirm mode: {}", e))
            })?;
    }

    Ok(())
}

pub struct LapinChannel {
    inner: Channel,
    confirm_mode: bool,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn on_close(&self, trigger: ClosureTrigger) {
        self.inner.on_error(move |err| {
            trigger.fire(format!("channel error: {}", err));
        });
    }

    async fn queue_declare(&self, queue: &str) -> Result<QueueInfo> {
        let declared = self
            .inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(RabbitMQError::declare)?;

        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(RabbitMQError::consume)?;

        let deliveries = consumer.map(|result| {
            result
                .map(LapinAcker::into_delivery)
                .map_err(RabbitMQError::consume)
        });
        Ok(deliveries.boxed())
    }

    async fn basic_publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let confirm = self
            .inner
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(RabbitMQError::publish)?;

        // Without confirm mode this resolves immediately to NotRequested.
        let confirmation = confirm.await.map_err(RabbitMQError::publish)?;
        if self.confirm_mode && confirmation.is_nack() {
            return Err(RabbitMQError::PublishNacked);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(RabbitMQError::channel)
    }
}

/// Keeps the lapin delivery (and its acker) once the payload has been moved out.
struct LapinAcker {
    delivery: LapinDelivery,
}

impl LapinAcker {
    fn into_delivery(mut delivery: LapinDelivery) -> Delivery {
        let data = std::mem::take(&mut delivery.data);
        Delivery::new(
            delivery.delivery_tag,
            delivery.redelivered,
            data,
            LapinAcker { delivery },
        )
    }
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(RabbitMQError::ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(RabbitMQError::ack)
    }
}
