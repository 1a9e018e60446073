use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Sms,
    Push,
    InApp,
    Webhook,
}

impl ChannelType {
    pub const ALL: [ChannelType; 5] = [
        ChannelType::Email,
        ChannelType::Sms,
        ChannelType::Push,
        ChannelType::InApp,
        ChannelType::Webhook,
    ];

    /// Routing key on the direct exchange and suffix of the channel queue name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Sms => "sms",
            ChannelType::Push => "push",
            ChannelType::InApp => "in_app",
            ChannelType::Webhook => "webhook",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.as_str() == s)
    }
}

impl Display for ChannelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// AMQP message priority. Channel queues are declared with `x-max-priority` 10.
    pub fn amqp_priority(&self) -> u8 {
        match self {
            Priority::Urgent => 10,
            Priority::High => 7,
            Priority::Normal => 5,
            Priority::Low => 1,
        }
    }

    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::Urgent)
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}
