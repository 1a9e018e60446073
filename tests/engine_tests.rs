use anyhow::Result;
use notification_engine::{
    models::{
        channel::{ChannelType, Priority},
        preference::PreferenceUpdate,
    },
    services::engine::SubmitOutcome,
    store::{CounterStore, keys},
};
use tokio_test::assert_ok;

use crate::common::{EngineHarness, ORG, USER, email_job, job_with_priority};

/// Test: An accepted enqueue is counted against the rate window once
#[tokio::test]
async fn test_enqueue_records_delivery() -> Result<()> {
    let harness = EngineHarness::new();

    assert!(harness.engine.enqueue(email_job()).await?);

    let count = harness
        .counters
        .count(&keys::rate(USER, ORG, ChannelType::Email))
        .await?;
    assert_eq!(count, 1);

    Ok(())
}

/// Test: A refused enqueue is not counted
#[tokio::test]
async fn test_refused_enqueue_is_not_recorded() -> Result<()> {
    let harness = EngineHarness::new();
    harness.broker.refuse_publishes(true);

    assert!(!harness.engine.enqueue(email_job()).await?);

    let count = harness
        .counters
        .count(&keys::rate(USER, ORG, ChannelType::Email))
        .await?;
    assert_eq!(count, 0);

    Ok(())
}

/// Test: Jobs without an attempt budget get the configured default
#[tokio::test]
async fn test_enqueue_fills_default_max_attempts() -> Result<()> {
    let harness = EngineHarness::new();

    harness
        .engine
        .enqueue(email_job().with_max_attempts(0))
        .await?;

    let job: notification_engine::models::message::NotificationJob =
        serde_json::from_slice(&harness.broker.last_published().unwrap().payload)?;
    assert_eq!(job.max_attempts, 3);

    Ok(())
}

/// Test: Submit publishes permitted jobs and reports blocked ones without publishing
#[tokio::test]
async fn test_submit_evaluates_before_publishing() -> Result<()> {
    let harness = EngineHarness::new();

    assert_eq!(
        harness.engine.submit(email_job()).await?,
        SubmitOutcome::Queued
    );

    let sms = job_with_priority(ChannelType::Sms, Priority::Normal);
    match harness.engine.submit(sms).await? {
        SubmitOutcome::Blocked(rule) => {
            assert_eq!(rule.reason, "sms notifications are disabled")
        }
        other => panic!("expected block, got {:?}", other),
    }

    assert_eq!(harness.broker.published().len(), 1);

    Ok(())
}

/// Test: Opted-out users never reach the broker, even for urgent jobs
#[tokio::test]
async fn test_opted_out_user_is_never_published() -> Result<()> {
    let harness = EngineHarness::new();
    harness
        .engine
        .update_preferences(
            USER,
            ORG,
            PreferenceUpdate {
                global_opt_out: Some(true),
                ..Default::default()
            },
        )
        .await?;

    let outcome = harness
        .engine
        .submit(job_with_priority(ChannelType::Email, Priority::Urgent))
        .await?;

    assert!(matches!(outcome, SubmitOutcome::Blocked(_)));
    assert!(harness.broker.published().is_empty());

    Ok(())
}

/// Test: Cancelling writes the flag the channel consumer checks
#[tokio::test]
async fn test_cancel_scheduled_sets_flag() -> Result<()> {
    let harness = EngineHarness::new();
    let job = email_job();

    assert_ok!(harness.engine.cancel_scheduled(&job.id).await);

    assert!(harness.counters.has_flag(&keys::cancelled(&job.id)).await?);

    Ok(())
}

/// Test: Preference reads go through the facade with defaults applied
#[tokio::test]
async fn test_get_preferences_returns_defaults() -> Result<()> {
    let harness = EngineHarness::new();

    let preference = harness.engine.get_preferences(USER, ORG).await?;

    assert_eq!(preference.user_id, USER);
    assert_eq!(preference.timezone, "UTC");

    Ok(())
}
