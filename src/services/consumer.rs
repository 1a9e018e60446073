use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    broker::{DeliveryTag, MessageBroker},
    error::{BrokerError, EngineError},
    models::{
        channel::ChannelType,
        message::{FailedNotification, NotificationJob},
        retry::RetryConfig,
        status::JobOutcome,
    },
    services::publisher::{PublishOptions, Publisher},
    store::{CounterStore, keys},
};

/// Channel transport (SMTP, SMS gateway, push provider, webhook caller).
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, job: &NotificationJob) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ChannelType, Arc<dyn DeliveryHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, channel: ChannelType, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handlers.insert(channel, handler);
        self
    }

    pub fn get(&self, channel: ChannelType) -> Option<&Arc<dyn DeliveryHandler>> {
        self.handlers.get(&channel)
    }
}

/// Handler that only logs the job. Stands in for a channel until its
/// transport is wired up.
pub struct LogOnlyHandler;

#[async_trait]
impl DeliveryHandler for LogOnlyHandler {
    async fn deliver(&self, job: &NotificationJob) -> anyhow::Result<()> {
        info!(
            job_id = %job.id,
            channel = %job.channel,
            recipient_id = %job.recipient_id,
            destinations = job.payload.to.len(),
            "No transport configured, notification logged only"
        );
        Ok(())
    }
}

/// Drives a consumed message to one of its outcomes. Retries never rely on
/// broker redelivery: a failed job is republished as a delayed clone and the
/// original is nacked without requeue, so the attempt count is exact.
pub struct RetryController {
    broker: Arc<dyn MessageBroker>,
    publisher: Publisher,
    handlers: HandlerRegistry,
    counters: Arc<dyn CounterStore>,
    retry: RetryConfig,
}

impl RetryController {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        publisher: Publisher,
        handlers: HandlerRegistry,
        counters: Arc<dyn CounterStore>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            broker,
            publisher,
            handlers,
            counters,
            retry,
        }
    }

    pub async fn handle_delivery(
        &self,
        data: &[u8],
        delivery: DeliveryTag,
    ) -> Result<JobOutcome, EngineError> {
        self.handle_delivery_at(data, delivery, Utc::now()).await
    }

    pub async fn handle_delivery_at(
        &self,
        data: &[u8],
        delivery: DeliveryTag,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, EngineError> {
        let mut job = match serde_json::from_slice::<NotificationJob>(data) {
            Ok(job) => job,
            Err(e) => return self.dead_letter(data, delivery, &e.to_string()).await,
        };

        if job.max_attempts == 0 {
            job.max_attempts = self.retry.max_attempts;
        }

        if self.is_cancelled(&job.id).await {
            self.broker.ack(delivery).await?;
            info!(job_id = %job.id, channel = %job.channel, "Cancelled notification dropped");
            return Ok(JobOutcome::Cancelled);
        }

        let error = match self.deliver(&job).await {
            Ok(()) => {
                self.broker.ack(delivery).await?;
                info!(
                    job_id = %job.id,
                    channel = %job.channel,
                    attempts = job.attempts,
                    "Notification delivered"
                );
                return Ok(JobOutcome::Delivered);
            }
            Err(e) => e,
        };

        if job.attempts < job.max_attempts {
            job.attempts += 1;
        }

        if job.attempts_exhausted() {
            self.fail(job, error, delivery, now).await
        } else {
            self.schedule_retry(job, error, delivery, now).await
        }
    }

    async fn deliver(&self, job: &NotificationJob) -> anyhow::Result<()> {
        let handler = self
            .handlers
            .get(job.channel)
            .ok_or_else(|| anyhow!("No delivery handler registered for {}", job.channel))?;

        handler.deliver(job).await
    }

    async fn schedule_retry(
        &self,
        job: NotificationJob,
        error: anyhow::Error,
        delivery: DeliveryTag,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, EngineError> {
        let delay = self.retry.delay_for_attempt(job.attempts);
        let retry_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
        let retry_job = job.with_scheduled_at(retry_at);

        warn!(
            job_id = %retry_job.id,
            channel = %retry_job.channel,
            attempts = retry_job.attempts,
            max_attempts = retry_job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Delivery failed, retry scheduled"
        );

        let republished = self
            .publisher
            .publish_at(&retry_job, PublishOptions::default(), now)
            .await;

        self.settle(delivery, republished, &retry_job.id, JobOutcome::Retrying)
            .await
    }

    async fn fail(
        &self,
        job: NotificationJob,
        error: anyhow::Error,
        delivery: DeliveryTag,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, EngineError> {
        error!(
            job_id = %job.id,
            channel = %job.channel,
            attempts = job.attempts,
            error = %error,
            "Delivery attempts exhausted, moving to failed queue"
        );

        let job_id = job.id.clone();
        let failed = FailedNotification::new(job, error.to_string(), now);
        let published = self.publisher.publish_failed(&failed).await;

        self.settle(delivery, published, &job_id, JobOutcome::Failed)
            .await
    }

    /// Nacks the original once its successor (retry clone or failed record) is
    /// safely published. Otherwise it goes back on the queue so the job is not
    /// lost.
    async fn settle(
        &self,
        delivery: DeliveryTag,
        published: Result<bool, EngineError>,
        job_id: &str,
        outcome: JobOutcome,
    ) -> Result<JobOutcome, EngineError> {
        match published {
            Ok(true) => {
                self.broker.nack(delivery, false).await?;
                Ok(outcome)
            }
            Ok(false) => {
                self.broker.nack(delivery, true).await?;
                Err(EngineError::Broker(BrokerError::Unavailable(
                    format!("Broker refused {} publish for job {}", outcome, job_id),
                )))
            }
            Err(e) => {
                error!(job_id, error = %e, "Republish failed, requeueing original");
                if let Err(nack_err) = self.broker.nack(delivery, true).await {
                    warn!(job_id, error = %nack_err, "Requeue nack failed");
                }
                Err(e)
            }
        }
    }

    /// Moves a job that came due on the scheduled queue onto its channel queue.
    pub async fn forward_scheduled(
        &self,
        data: &[u8],
        delivery: DeliveryTag,
    ) -> Result<JobOutcome, EngineError> {
        let job = match serde_json::from_slice::<NotificationJob>(data) {
            Ok(job) => job,
            Err(e) => return self.dead_letter(data, delivery, &e.to_string()).await,
        };

        match self.publisher.publish_immediate(&job).await {
            Ok(true) => {
                self.broker.ack(delivery).await?;
                debug!(job_id = %job.id, channel = %job.channel, "Scheduled notification forwarded");
                Ok(JobOutcome::Forwarded)
            }
            other => {
                self.broker.nack(delivery, true).await?;
                match other {
                    Err(e) => Err(e),
                    _ => Err(EngineError::Broker(BrokerError::Unavailable(
                        format!("Broker refused forward of job {}", job.id),
                    ))),
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        data: &[u8],
        delivery: DeliveryTag,
        reason: &str,
    ) -> Result<JobOutcome, EngineError> {
        error!(
            %delivery,
            bytes = data.len(),
            reason,
            "Undecodable message, dead-lettering"
        );

        if let Err(e) = self.publisher.publish_dead_letter(data, reason).await {
            warn!(error = %e, "Failed to copy message to dead-letter queue");
        }

        self.broker.nack(delivery, false).await?;

        Ok(JobOutcome::DeadLettered)
    }

    /// Cancellation flags fail open: if the lookup errors the job is delivered.
    async fn is_cancelled(&self, job_id: &str) -> bool {
        match self.counters.has_flag(&keys::cancelled(job_id)).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(job_id, error = %e, "Cancellation lookup failed, delivering");
                false
            }
        }
    }
}
