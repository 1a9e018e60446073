use crate::models::channel::ChannelType;

/// Routing key used for jobs published to the delayed exchange.
pub const SCHEDULED_ROUTING_KEY: &str = "scheduled";

/// Message header the delayed-message exchange reads the delay from.
pub const DELAY_HEADER: &str = "x-delay";

/// Names of every exchange and queue the engine declares.
#[derive(Debug, Clone)]
pub struct BrokerTopology {
    pub routing_exchange: String,
    pub delayed_exchange: String,
    pub channel_queue_prefix: String,
    pub scheduled_queue: String,
    pub failed_queue: String,
    pub dead_letter_queue: String,
}

impl BrokerTopology {
    pub fn channel_queue(&self, channel: ChannelType) -> String {
        format!("{}.{}", self.channel_queue_prefix, channel.as_str())
    }

    pub fn channel_queues(&self) -> Vec<(ChannelType, String)> {
        ChannelType::ALL
            .into_iter()
            .map(|channel| (channel, self.channel_queue(channel)))
            .collect()
    }

    /// Every queue name, channel queues first.
    pub fn all_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .channel_queues()
            .into_iter()
            .map(|(_, queue)| queue)
            .collect();
        queues.push(self.scheduled_queue.clone());
        queues.push(self.failed_queue.clone());
        queues.push(self.dead_letter_queue.clone());
        queues
    }

    pub fn is_known_queue(&self, name: &str) -> bool {
        self.all_queues().iter().any(|queue| queue == name)
    }
}

impl Default for BrokerTopology {
    fn default() -> Self {
        Self {
            routing_exchange: "notifications.direct".to_string(),
            delayed_exchange: "notifications.delayed".to_string(),
            channel_queue_prefix: "notifications".to_string(),
            scheduled_queue: "notifications.scheduled".to_string(),
            failed_queue: "notifications.failed".to_string(),
            dead_letter_queue: "notifications.dlq".to_string(),
        }
    }
}
