use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a delivery rule evaluation. A block is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRule {
    pub can_deliver: bool,
    pub reason: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_allowed_delivery: Option<DateTime<Utc>>,
}

impl DeliveryRule {
    pub fn allow() -> Self {
        Self {
            can_deliver: true,
            reason: "Delivery permitted".to_string(),
            next_allowed_delivery: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            can_deliver: false,
            reason: reason.into(),
            next_allowed_delivery: None,
        }
    }

    pub fn block_until(reason: impl Into<String>, next_allowed: DateTime<Utc>) -> Self {
        Self {
            can_deliver: false,
            reason: reason.into(),
            next_allowed_delivery: Some(next_allowed),
        }
    }
}
