// src/rabbitmq/errors.rs

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RabbitMQError {
    /// No connection generation is installed; the manager is (re)connecting.
    #[error("queue not ready")]
    NotReady,

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ queue declare error: {0}")]
    DeclareError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ broker rejected the published message")]
    PublishNacked,

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub fn connection(msg: impl ToString) -> Self {
        Self::ConnectionError(msg.to_string())
    }

    pub fn channel(msg: impl ToString) -> Self {
        Self::ChannelError(msg.to_string())
    }

    pub fn declare(msg: impl ToString) -> Self {
        Self::DeclareError(msg.to_string())
    }

    pub fn consume(msg: impl ToString) -> Self {
        Self::ConsumeError(msg.to_string())
    }

    pub fn publish(msg: impl ToString) -> Self {
        Self::PublishError(msg.to_string())
    }

    pub fn ack(msg: impl ToString) -> Self {
        Self::AckError(msg.to_string())
    }

    /// Infrastructure failures that the reconnect loop absorbs. Everything
    /// else is either a caller-visible outcome or a terminal state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotReady
                | Self::ConnectionError(_)
                | Self::ChannelError(_)
                | Self::DeclareError(_)
                | Self::ConsumeError(_)
        )
    }

    /// Short label used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::ConnectionError(_) => "connection",
            Self::ChannelError(_) => "channel",
            Self::DeclareError(_) => "declare",
            Self::ConsumeError(_) => "consume",
            Self::PublishError(_) => "publish",
            Self::PublishNacked => "publish_nacked",
            Self::AckError(_) => "ack",
        }
    }
}
