//! Storage seams for the engine: the durable preference repository and the
//! ephemeral counter store that holds frequency timestamps, rate counters and
//! cancellation flags. Redis and Postgres implementations live in `clients`;
//! the in-memory ones back tests and single-process deployments.

pub mod cache;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{error::StoreError, models::preference::NotificationPreference};

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn find(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<NotificationPreference>, StoreError>;

    /// Upsert keyed by (user, organization). Last write wins.
    async fn save(&self, preference: &NotificationPreference) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Counter primitives. Every write is atomic at the storage layer so workers
/// sharing a store cannot race past a ceiling (small overshoot aside).
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn last_sent(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn mark_sent(&self, key: &str, at: DateTime<Utc>, ttl: Duration)
    -> Result<(), StoreError>;

    async fn count(&self, key: &str) -> Result<u32, StoreError>;

    /// Increments the counter, starting a fixed window of `window` when the key
    /// does not exist yet. Returns the new count.
    async fn increment(&self, key: &str, window: Duration) -> Result<u32, StoreError>;

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn has_flag(&self, key: &str) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub mod keys {
    use crate::models::{channel::ChannelType, preference::FrequencyBucket};

    pub fn frequency(
        user_id: &str,
        organization_id: &str,
        channel: ChannelType,
        bucket: FrequencyBucket,
    ) -> String {
        format!(
            "notify:freq:{}:{}:{}:{}",
            organization_id,
            user_id,
            channel.as_str(),
            bucket.as_str()
        )
    }

    pub fn rate(user_id: &str, organization_id: &str, channel: ChannelType) -> String {
        format!(
            "notify:rate:{}:{}:{}",
            organization_id,
            user_id,
            channel.as_str()
        )
    }

    pub fn cancelled(job_id: &str) -> String {
        format!("notify:cancelled:{}", job_id)
    }
}
