use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::channel::{ChannelType, Priority};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A unit of delivery work. Serialized as camelCase JSON on the wire; all maps
/// are ordered so a job re-serializes to the same bytes it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub id: String,
    pub channel: ChannelType,
    pub recipient_id: String,
    pub organization_id: String,
    pub payload: NotificationPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    /// Destination addresses: email addresses, phone numbers, device tokens or URLs.
    #[serde(default)]
    pub to: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NotificationJob {
    pub fn new(
        channel: ChannelType,
        recipient_id: impl Into<String>,
        organization_id: impl Into<String>,
        payload: NotificationPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel,
            recipient_id: recipient_id.into(),
            organization_id: organization_id.into(),
            payload,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: Utc::now(),
            scheduled_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn priority(&self) -> Priority {
        self.payload.priority
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Terminal record written to the failed-notifications queue once a job has
/// used up its attempt budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedNotification {
    #[serde(flatten)]
    pub job: NotificationJob,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedNotification {
    pub fn new(job: NotificationJob, last_error: String, failed_at: DateTime<Utc>) -> Self {
        Self {
            job,
            last_error,
            failed_at,
        }
    }
}
