use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    error::EngineError,
    models::{
        channel::{ChannelType, Priority},
        message::NotificationJob,
        preference::{FrequencyBucket, NotificationPreference, PreferenceUpdate},
        rule::DeliveryRule,
    },
    services::{
        preferences::PreferenceStore,
        publisher::{PublishOptions, Publisher},
        rules::DeliveryRuleEngine,
    },
    store::{CounterStore, keys},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Queued,
    Blocked(DeliveryRule),
    /// The broker refused the publish.
    Rejected,
}

/// Entry point for upstream services. Callers evaluate before enqueueing, or
/// use `submit` to do both.
pub struct NotificationEngine {
    preferences: Arc<PreferenceStore>,
    rules: Arc<DeliveryRuleEngine>,
    publisher: Publisher,
    counters: Arc<dyn CounterStore>,
    cancellation_ttl: Duration,
    default_max_attempts: u32,
}

impl NotificationEngine {
    pub fn new(
        preferences: Arc<PreferenceStore>,
        rules: Arc<DeliveryRuleEngine>,
        publisher: Publisher,
        counters: Arc<dyn CounterStore>,
        cancellation_ttl: Duration,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            preferences,
            rules,
            publisher,
            counters,
            cancellation_ttl,
            default_max_attempts,
        }
    }

    pub async fn evaluate(
        &self,
        user_id: &str,
        organization_id: &str,
        channel: ChannelType,
        category: Option<&str>,
        priority: Priority,
    ) -> DeliveryRule {
        self.rules
            .evaluate(user_id, organization_id, channel, category, priority)
            .await
    }

    /// Publishes a job that already passed evaluation. An accepted publish is
    /// recorded against the user's frequency and rate counters exactly once;
    /// a failure to record is logged and does not fail the enqueue.
    pub async fn enqueue(&self, mut job: NotificationJob) -> Result<bool, EngineError> {
        if job.max_attempts == 0 {
            job.max_attempts = self.default_max_attempts;
        }

        let accepted = self.publisher.publish(&job, PublishOptions::default()).await?;
        if !accepted {
            warn!(job_id = %job.id, channel = %job.channel, "Broker refused notification");
            return Ok(false);
        }

        let bucket = self.frequency_bucket(&job).await;
        if let Err(e) = self
            .rules
            .record_delivery(&job.recipient_id, &job.organization_id, job.channel, bucket)
            .await
        {
            warn!(
                job_id = %job.id,
                channel = %job.channel,
                error = %e,
                "Failed to record delivery counters"
            );
        }

        Ok(true)
    }

    /// Evaluates the job's delivery rule and enqueues it when permitted.
    pub async fn submit(&self, job: NotificationJob) -> Result<SubmitOutcome, EngineError> {
        let rule = self
            .evaluate(
                &job.recipient_id,
                &job.organization_id,
                job.channel,
                job.payload.category.as_deref(),
                job.priority(),
            )
            .await;

        if !rule.can_deliver {
            info!(
                job_id = %job.id,
                channel = %job.channel,
                reason = %rule.reason,
                "Notification blocked by delivery rules"
            );
            return Ok(SubmitOutcome::Blocked(rule));
        }

        match self.enqueue(job).await? {
            true => Ok(SubmitOutcome::Queued),
            false => Ok(SubmitOutcome::Rejected),
        }
    }

    /// Marks a job so its channel consumer drops it instead of delivering.
    /// Nothing is retracted from the delayed exchange; the job still comes
    /// due and is discarded on arrival.
    pub async fn cancel_scheduled(&self, job_id: &str) -> Result<(), EngineError> {
        self.counters
            .set_flag(&keys::cancelled(job_id), self.cancellation_ttl)
            .await?;

        info!(job_id, "Scheduled notification cancelled");
        Ok(())
    }

    pub async fn get_preferences(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<NotificationPreference, EngineError> {
        Ok(self.preferences.get(user_id, organization_id).await?)
    }

    pub async fn update_preferences(
        &self,
        user_id: &str,
        organization_id: &str,
        update: PreferenceUpdate,
    ) -> Result<NotificationPreference, EngineError> {
        self.preferences
            .update(user_id, organization_id, update)
            .await
    }

    async fn frequency_bucket(&self, job: &NotificationJob) -> Option<FrequencyBucket> {
        match self
            .preferences
            .get(&job.recipient_id, &job.organization_id)
            .await
        {
            Ok(preference) => preference
                .channel(job.channel)
                .and_then(|settings| settings.frequency.bucket()),
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "No preference for frequency bucket");
                None
            }
        }
    }
}
