use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;

use crate::error::BrokerError;

/// A message ready to hand to the broker. `delay_ms` is only honoured by the
/// delayed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub delay_ms: Option<u64>,
    pub headers: BTreeMap<String, String>,
    pub persistent: bool,
}

impl OutboundMessage {
    pub fn new(exchange: &str, routing_key: &str, payload: Vec<u8>) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            message_id: None,
            priority: None,
            delay_ms: None,
            headers: BTreeMap::new(),
            persistent: true,
        }
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

/// Identifies a consumed message. AMQP delivery tags restart on every channel,
/// so a tag is only meaningful together with the connection generation whose
/// channel delivered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub generation: u64,
    pub tag: u64,
}

impl DeliveryTag {
    pub const fn new(generation: u64, tag: u64) -> Self {
        Self { generation, tag }
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.generation, self.tag)
    }
}

/// Publish and settlement operations the publisher and retry controller need.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Returns the broker's immediate accept signal; does not wait for
    /// downstream delivery.
    async fn publish(&self, message: OutboundMessage) -> Result<bool, BrokerError>;

    /// Fails with `Unavailable` when the delivery's channel has been replaced.
    async fn ack(&self, delivery: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, delivery: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}
