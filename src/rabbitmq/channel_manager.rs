// src/rabbitmq/channel_manager.rs

use uuid::Uuid;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: false,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_confirm_mode(mut self, confirm_mode: bool) -> Self {
        self.confirm_mode = confirm_mode;
        self
    }

    /// Consumer tag for the subscription opened in `generation`.
    pub fn consumer_tag(&self, generation: u64) -> String {
        format!("{}-consumer-{}", self.id, generation)
    }
}
