use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{
    broker::{MessageBroker, OutboundMessage},
    error::EngineError,
    models::{
        channel::Priority,
        message::{FailedNotification, NotificationJob},
        topology::{BrokerTopology, SCHEDULED_ROUTING_KEY},
    },
};

pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Overrides the priority carried in the job payload.
    pub priority: Option<Priority>,
}

/// Serializes jobs and routes them to the direct exchange, or to the delayed
/// exchange when they are scheduled for later.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn MessageBroker>,
    topology: BrokerTopology,
}

impl Publisher {
    pub fn new(broker: Arc<dyn MessageBroker>, topology: BrokerTopology) -> Self {
        Self { broker, topology }
    }

    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }

    pub async fn publish(
        &self,
        job: &NotificationJob,
        options: PublishOptions,
    ) -> Result<bool, EngineError> {
        self.publish_at(job, options, Utc::now()).await
    }

    pub async fn publish_at(
        &self,
        job: &NotificationJob,
        options: PublishOptions,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let priority = options.priority.unwrap_or(job.priority());

        let message = match job.scheduled_at.filter(|at| *at > now) {
            Some(scheduled_at) => {
                let delay_ms = (scheduled_at - now).num_milliseconds().max(1) as u64;

                debug!(
                    job_id = %job.id,
                    channel = %job.channel,
                    delay_ms,
                    "Publishing scheduled notification"
                );

                self.job_message(
                    job,
                    &self.topology.delayed_exchange,
                    SCHEDULED_ROUTING_KEY,
                    priority,
                )?
                .with_delay_ms(delay_ms)
            }
            None => self.job_message(
                job,
                &self.topology.routing_exchange,
                job.channel.as_str(),
                priority,
            )?,
        };

        let accepted = self.broker.publish(message).await?;

        info!(
            job_id = %job.id,
            channel = %job.channel,
            priority = %priority,
            attempts = job.attempts,
            accepted,
            "Notification published"
        );

        Ok(accepted)
    }

    /// Routes a job straight to its channel queue, ignoring `scheduled_at`.
    /// Used when a delayed job comes due.
    pub async fn publish_immediate(&self, job: &NotificationJob) -> Result<bool, EngineError> {
        let message = self.job_message(
            job,
            &self.topology.routing_exchange,
            job.channel.as_str(),
            job.priority(),
        )?;

        Ok(self.broker.publish(message).await?)
    }

    pub async fn publish_failed(&self, failed: &FailedNotification) -> Result<bool, EngineError> {
        let payload = serde_json::to_vec(failed)?;
        let message = OutboundMessage::new("", &self.topology.failed_queue, payload)
            .with_message_id(&failed.job.id);

        Ok(self.broker.publish(message).await?)
    }

    /// Copies an undecodable message verbatim into the dead-letter queue.
    pub async fn publish_dead_letter(&self, raw: &[u8], reason: &str) -> Result<bool, EngineError> {
        let message = OutboundMessage::new("", &self.topology.dead_letter_queue, raw.to_vec())
            .with_header(DEAD_LETTER_REASON_HEADER, reason);

        Ok(self.broker.publish(message).await?)
    }

    fn job_message(
        &self,
        job: &NotificationJob,
        exchange: &str,
        routing_key: &str,
        priority: Priority,
    ) -> Result<OutboundMessage, EngineError> {
        let payload = serde_json::to_vec(job)?;

        Ok(OutboundMessage::new(exchange, routing_key, payload)
            .with_message_id(&job.id)
            .with_priority(priority.amqp_priority()))
    }
}
