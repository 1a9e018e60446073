use anyhow::Result;
use chrono::{TimeDelta, Utc};
use notification_engine::{
    broker::DeliveryTag,
    models::{
        message::{FailedNotification, NotificationJob},
        status::JobOutcome,
        topology::{BrokerTopology, SCHEDULED_ROUTING_KEY},
    },
    services::publisher::{DEAD_LETTER_REASON_HEADER, PublishOptions},
    store::{CounterStore, keys},
};
use tokio_test::assert_err;

use crate::common::{ControllerHarness, ScriptedHandler, email_job};

const TAG: DeliveryTag = DeliveryTag::new(1, 7);

/// Test: A successful delivery is acked and nothing is republished
#[tokio::test]
async fn test_successful_delivery_is_acked() -> Result<()> {
    let handler = ScriptedHandler::succeeding();
    let harness = ControllerHarness::new(handler.clone());
    let bytes = serde_json::to_vec(&email_job())?;

    let outcome = harness.controller.handle_delivery(&bytes, TAG).await?;

    assert_eq!(outcome, JobOutcome::Delivered);
    assert_eq!(harness.broker.acks(), vec![TAG]);
    assert!(harness.broker.nacks().is_empty());
    assert!(harness.broker.published().is_empty());
    assert_eq!(handler.calls(), 1);

    Ok(())
}

/// Test: A failed delivery republishes a delayed clone and drops the original
#[tokio::test]
async fn test_failure_schedules_backoff_retry() -> Result<()> {
    let harness = ControllerHarness::new(ScriptedHandler::failing(1));
    let job = email_job();
    let bytes = serde_json::to_vec(&job)?;
    let now = Utc::now();

    let outcome = harness
        .controller
        .handle_delivery_at(&bytes, TAG, now)
        .await?;

    assert_eq!(outcome, JobOutcome::Retrying);
    assert_eq!(harness.broker.nacks(), vec![(TAG, false)]);
    assert!(harness.broker.acks().is_empty());

    let retry = harness.broker.last_published().unwrap();
    assert_eq!(retry.routing_key, SCHEDULED_ROUTING_KEY);
    // 1000ms * 2^1
    assert_eq!(retry.delay_ms, Some(2_000));

    let clone: NotificationJob = serde_json::from_slice(&retry.payload)?;
    assert_eq!(clone.id, job.id);
    assert_eq!(clone.attempts, 1);
    assert_eq!(clone.scheduled_at, Some(now + TimeDelta::seconds(2)));
    assert_eq!(clone.payload, job.payload);

    Ok(())
}

/// Test: Attempts rise by one per failure and the job lands in the failed queue exactly once
#[tokio::test]
async fn test_exhausted_job_moves_to_failed_queue_once() -> Result<()> {
    let handler = ScriptedHandler::always_failing();
    let harness = ControllerHarness::new(handler.clone());
    let topology = BrokerTopology::default();

    let job = email_job();
    let mut bytes = serde_json::to_vec(&job)?;
    let mut seen_attempts = Vec::new();

    for tag in 1..=3u64 {
        let outcome = harness
            .controller
            .handle_delivery(&bytes, DeliveryTag::new(1, tag))
            .await?;
        let last = harness.broker.last_published().unwrap();

        if outcome == JobOutcome::Retrying {
            let retry: NotificationJob = serde_json::from_slice(&last.payload)?;
            seen_attempts.push(retry.attempts);
            bytes = last.payload;
        } else {
            assert_eq!(outcome, JobOutcome::Failed);
            assert_eq!(tag, 3);
        }
    }

    assert_eq!(seen_attempts, vec![1, 2]);
    assert_eq!(handler.calls(), 3);

    let failed = harness.broker.published_to(&topology.failed_queue);
    assert_eq!(failed.len(), 1);

    let record: FailedNotification = serde_json::from_slice(&failed[0].payload)?;
    assert_eq!(record.job.id, job.id);
    assert_eq!(record.job.attempts, record.job.max_attempts);
    assert!(record.last_error.contains("smtp timeout on call 3"));
    assert!(record.failed_at >= job.created_at);

    // Every original was dropped, none requeued.
    assert_eq!(
        harness.broker.nacks(),
        vec![
            (DeliveryTag::new(1, 1), false),
            (DeliveryTag::new(1, 2), false),
            (DeliveryTag::new(1, 3), false),
        ]
    );

    Ok(())
}

/// Test: The failed-queue record carries the job fields flat with lastError and failedAt
#[tokio::test]
async fn test_failed_record_wire_format() -> Result<()> {
    let harness = ControllerHarness::new(ScriptedHandler::always_failing());
    let job = email_job().with_max_attempts(1);
    let bytes = serde_json::to_vec(&job)?;

    let outcome = harness.controller.handle_delivery(&bytes, TAG).await?;
    assert_eq!(outcome, JobOutcome::Failed);

    let wire: serde_json::Value =
        serde_json::from_slice(&harness.broker.last_published().unwrap().payload)?;
    assert_eq!(wire["id"], serde_json::json!(job.id));
    assert_eq!(wire["attempts"], serde_json::json!(1));
    assert!(wire["lastError"].is_string());
    assert!(wire["failedAt"].is_string());

    Ok(())
}

/// Test: Undecodable bytes are copied to the DLQ and dropped
#[tokio::test]
async fn test_garbage_is_dead_lettered() -> Result<()> {
    let handler = ScriptedHandler::succeeding();
    let harness = ControllerHarness::new(handler.clone());
    let topology = BrokerTopology::default();
    let garbage = b"{not json".to_vec();

    let outcome = harness.controller.handle_delivery(&garbage, TAG).await?;

    assert_eq!(outcome, JobOutcome::DeadLettered);
    assert_eq!(harness.broker.nacks(), vec![(TAG, false)]);
    assert_eq!(handler.calls(), 0);

    let dead = harness.broker.published_to(&topology.dead_letter_queue);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, garbage);
    assert!(dead[0].headers.contains_key(DEAD_LETTER_REASON_HEADER));

    Ok(())
}

/// Test: A cancelled job is acked without calling the handler
#[tokio::test]
async fn test_cancelled_job_is_dropped() -> Result<()> {
    let handler = ScriptedHandler::succeeding();
    let harness = ControllerHarness::new(handler.clone());
    let job = email_job();

    harness
        .counters
        .set_flag(&keys::cancelled(&job.id), std::time::Duration::from_secs(60))
        .await?;

    let outcome = harness
        .controller
        .handle_delivery(&serde_json::to_vec(&job)?, TAG)
        .await?;

    assert_eq!(outcome, JobOutcome::Cancelled);
    assert_eq!(harness.broker.acks(), vec![TAG]);
    assert_eq!(handler.calls(), 0);

    Ok(())
}

/// Test: If the retry clone cannot be published the original is requeued
#[tokio::test]
async fn test_republish_failure_requeues_original() -> Result<()> {
    let harness = ControllerHarness::new(ScriptedHandler::always_failing());
    let bytes = serde_json::to_vec(&email_job())?;

    harness.broker.fail_publishes(true);
    assert_err!(harness.controller.handle_delivery(&bytes, TAG).await);

    assert_eq!(harness.broker.nacks(), vec![(TAG, true)]);
    assert!(harness.broker.published().is_empty());

    Ok(())
}

/// Test: A job for a channel without a handler is treated as a failed delivery
#[tokio::test]
async fn test_missing_handler_counts_as_failure() -> Result<()> {
    let harness = ControllerHarness::new(ScriptedHandler::succeeding());
    let mut job = email_job();
    job.channel = notification_engine::models::channel::ChannelType::Webhook;

    let outcome = harness
        .controller
        .handle_delivery(&serde_json::to_vec(&job)?, TAG)
        .await?;

    assert_eq!(outcome, JobOutcome::Retrying);

    Ok(())
}

/// Test: Due jobs on the scheduled queue are forwarded to their channel queue
#[tokio::test]
async fn test_scheduled_job_is_forwarded() -> Result<()> {
    let harness = ControllerHarness::new(ScriptedHandler::succeeding());
    let topology = BrokerTopology::default();
    let now = Utc::now();
    let job = email_job().with_scheduled_at(now + TimeDelta::minutes(5));

    harness
        .publisher
        .publish_at(&job, PublishOptions::default(), now)
        .await?;
    let scheduled = harness.broker.last_published().unwrap();
    assert_eq!(scheduled.routing_key, SCHEDULED_ROUTING_KEY);

    let outcome = harness
        .controller
        .forward_scheduled(&scheduled.payload, TAG)
        .await?;

    assert_eq!(outcome, JobOutcome::Forwarded);
    assert_eq!(harness.broker.acks(), vec![TAG]);

    let forwarded = harness.broker.last_published().unwrap();
    assert_eq!(forwarded.exchange, topology.routing_exchange);
    assert_eq!(forwarded.routing_key, "email");
    assert_eq!(forwarded.payload, scheduled.payload);

    Ok(())
}

/// Test: A job without an attempt budget gets the configured one before any bookkeeping
#[tokio::test]
async fn test_zero_budget_job_uses_configured_attempts() -> Result<()> {
    let harness = ControllerHarness::new(ScriptedHandler::always_failing());
    let topology = BrokerTopology::default();
    let job = email_job().with_max_attempts(0);

    let outcome = harness
        .controller
        .handle_delivery(&serde_json::to_vec(&job)?, TAG)
        .await?;

    assert_eq!(outcome, JobOutcome::Retrying);
    assert!(harness.broker.published_to(&topology.failed_queue).is_empty());

    let retry: NotificationJob =
        serde_json::from_slice(&harness.broker.last_published().unwrap().payload)?;
    assert_eq!(retry.attempts, 1);
    assert_eq!(retry.max_attempts, 3);

    Ok(())
}

/// Test: Settlements carry the connection generation the message arrived on
#[tokio::test]
async fn test_settlement_keeps_delivery_generation() -> Result<()> {
    let harness = ControllerHarness::new(ScriptedHandler::failing(1));
    let bytes = serde_json::to_vec(&email_job())?;
    let first = DeliveryTag::new(4, 1);
    let second = DeliveryTag::new(5, 1);

    harness.controller.handle_delivery(&bytes, first).await?;
    harness.controller.handle_delivery(&bytes, second).await?;

    assert_eq!(harness.broker.nacks(), vec![(first, false)]);
    assert_eq!(harness.broker.acks(), vec![second]);

    Ok(())
}
