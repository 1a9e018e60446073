use std::{sync::Arc, time::Duration};

use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, warn};

use crate::{
    error::StoreError,
    models::{
        channel::{ChannelType, Priority},
        preference::{FrequencyBucket, FrequencyPolicy, LocalTime, NotificationPreference},
        rule::DeliveryRule,
    },
    services::preferences::PreferenceStore,
    store::{CounterStore, keys},
};

const RATE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Per-channel ceilings on deliveries per user per hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    pub email: u32,
    pub sms: u32,
    pub push: u32,
    pub in_app: u32,
    pub webhook: u32,
}

impl RateLimits {
    pub fn ceiling(&self, channel: ChannelType) -> u32 {
        match channel {
            ChannelType::Email => self.email,
            ChannelType::Sms => self.sms,
            ChannelType::Push => self.push,
            ChannelType::InApp => self.in_app,
            ChannelType::Webhook => self.webhook,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            email: 50,
            sms: 10,
            push: 100,
            in_app: 200,
            webhook: 100,
        }
    }
}

/// Decides whether a (user, channel, category, priority) delivery may go out
/// right now. Evaluation only reads; `record_delivery` is the single write.
pub struct DeliveryRuleEngine {
    preferences: Arc<PreferenceStore>,
    counters: Arc<dyn CounterStore>,
    limits: RateLimits,
}

impl DeliveryRuleEngine {
    pub fn new(
        preferences: Arc<PreferenceStore>,
        counters: Arc<dyn CounterStore>,
        limits: RateLimits,
    ) -> Self {
        Self {
            preferences,
            counters,
            limits,
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
        self.evaluate_at(
            user_id,
            organization_id,
            channel,
            category,
            priority,
            Utc::now(),
        )
        .await
    }

    /// Checks run in a fixed order and the first block wins: opt-out, channel
    /// switch, category override, frequency, quiet hours, rate limit. Urgent
    /// priority skips only the frequency and quiet-hours checks.
    pub async fn evaluate_at(
        &self,
        user_id: &str,
        organization_id: &str,
        channel: ChannelType,
        category: Option<&str>,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> DeliveryRule {
        let preference = match self.preferences.get(user_id, organization_id).await {
            Ok(preference) => preference,
            Err(e) => return fail_closed(user_id, organization_id, &e),
        };

        let rule = self
            .check_preference(&preference, channel, category, priority, now)
            .await;
        if !rule.can_deliver {
            debug!(
                user_id,
                organization_id,
                channel = %channel,
                reason = %rule.reason,
                "Delivery blocked"
            );
            return rule;
        }

        let rule = self
            .check_rate_limit(user_id, organization_id, channel)
            .await;
        if !rule.can_deliver {
            debug!(user_id, organization_id, channel = %channel, "Delivery rate limited");
        }
        rule
    }

    async fn check_preference(
        &self,
        preference: &NotificationPreference,
        channel: ChannelType,
        category: Option<&str>,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> DeliveryRule {
        if preference.global_opt_out {
            return DeliveryRule::block("user has opted out of all notifications");
        }

        let Some(settings) = preference.channel(channel).filter(|s| s.enabled) else {
            return DeliveryRule::block(format!("{} notifications are disabled", channel));
        };

        if let Some(category) = category {
            if preference.category_override(category, channel) == Some(false) {
                return DeliveryRule::block(format!(
                    "{} notifications are disabled for category {}",
                    channel, category
                ));
            }
        }

        if priority.is_urgent() {
            return DeliveryRule::allow();
        }

        let rule = self
            .check_frequency(preference, channel, settings.frequency, now)
            .await;
        if !rule.can_deliver {
            return rule;
        }

        match &settings.quiet_hours {
            Some(quiet_hours) => {
                let tz = resolve_timezone(
                    quiet_hours
                        .timezone
                        .as_deref()
                        .unwrap_or(&preference.timezone),
                );
                let local = now.with_timezone(&tz);
                let minute_of_day =
                    LocalTime::new(local.hour() as u16, local.minute() as u16)
                        .unwrap_or(quiet_hours.end);

                if quiet_hours.contains(minute_of_day) {
                    DeliveryRule::block_until(
                        format!(
                            "quiet hours in effect ({} to {} {})",
                            quiet_hours.start, quiet_hours.end, tz
                        ),
                        next_occurrence(quiet_hours.end, now, tz),
                    )
                } else {
                    DeliveryRule::allow()
                }
            }
            None => DeliveryRule::allow(),
        }
    }

    async fn check_frequency(
        &self,
        preference: &NotificationPreference,
        channel: ChannelType,
        policy: FrequencyPolicy,
        now: DateTime<Utc>,
    ) -> DeliveryRule {
        if policy == FrequencyPolicy::UrgentOnly {
            return DeliveryRule::block(format!(
                "{} notifications are limited to urgent priority",
                channel
            ));
        }

        let Some(bucket) = policy.bucket() else {
            return DeliveryRule::allow();
        };

        let key = keys::frequency(
            &preference.user_id,
            &preference.organization_id,
            channel,
            bucket,
        );

        match self.counters.last_sent(&key).await {
            Ok(Some(last_sent)) if now - last_sent < bucket.window() => {
                DeliveryRule::block_until(
                    format!("{} frequency limit reached", bucket.as_str()),
                    last_sent + bucket.window(),
                )
            }
            Ok(_) => DeliveryRule::allow(),
            Err(e) => fail_open("frequency", &key, &e),
        }
    }

    async fn check_rate_limit(
        &self,
        user_id: &str,
        organization_id: &str,
        channel: ChannelType,
    ) -> DeliveryRule {
        let ceiling = self.limits.ceiling(channel);
        let key = keys::rate(user_id, organization_id, channel);

        match self.counters.count(&key).await {
            Ok(count) if count >= ceiling => DeliveryRule::block(format!(
                "rate limit exceeded: {} {} notifications per hour",
                ceiling, channel
            )),
            Ok(_) => DeliveryRule::allow(),
            Err(e) => fail_open("rate limit", &key, &e),
        }
    }

    pub async fn record_delivery(
        &self,
        user_id: &str,
        organization_id: &str,
        channel: ChannelType,
        bucket: Option<FrequencyBucket>,
    ) -> Result<(), StoreError> {
        self.record_delivery_at(user_id, organization_id, channel, bucket, Utc::now())
            .await
    }

    /// Counts one successful publish against the hourly rate window and, when
    /// the channel has a frequency bucket, stamps its last-sent time.
    pub async fn record_delivery_at(
        &self,
        user_id: &str,
        organization_id: &str,
        channel: ChannelType,
        bucket: Option<FrequencyBucket>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let rate_key = keys::rate(user_id, organization_id, channel);
        let count = self.counters.increment(&rate_key, RATE_WINDOW).await?;

        if let Some(bucket) = bucket {
            let key = keys::frequency(user_id, organization_id, channel, bucket);
            let ttl = bucket.window().to_std().unwrap_or(RATE_WINDOW);
            self.counters.mark_sent(&key, now, ttl).await?;
        }

        debug!(
            user_id,
            organization_id,
            channel = %channel,
            hourly_count = count,
            "Delivery recorded"
        );

        Ok(())
    }
}

/// A preference that cannot be loaded blocks delivery.
fn fail_closed(user_id: &str, organization_id: &str, error: &StoreError) -> DeliveryRule {
    error!(
        user_id,
        organization_id,
        error = %error,
        "Preference lookup failed, blocking delivery"
    );
    DeliveryRule::block("preferences not found")
}

/// A counter that cannot be read allows delivery.
fn fail_open(check: &str, key: &str, error: &StoreError) -> DeliveryRule {
    warn!(
        check,
        key,
        error = %error,
        "Counter lookup failed, allowing delivery"
    );
    DeliveryRule::allow()
}

fn resolve_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = name, "Unknown timezone, falling back to UTC");
        Tz::UTC
    })
}

/// Next instant strictly after `now` at which the local clock in `tz` reads
/// `time`. Skipped local times (DST gaps) resolve to the first valid instant
/// after the gap.
pub fn next_occurrence(time: LocalTime, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let target = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(NaiveTime::MIN);

    let mut date = local.date_naive();
    if local.time() >= target {
        date = date.succ_opt().unwrap_or(date);
    }

    let naive = date.and_time(target);
    let resolved = tz
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
        .unwrap_or_else(|| tz.from_utc_datetime(&naive));

    resolved.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hhmm(value: &str) -> LocalTime {
        LocalTime::try_from(value.to_string()).unwrap()
    }

    #[test]
    fn next_end_after_midnight_rolls_to_next_day() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 23:30 EST
        let now = Utc.with_ymd_and_hms(2025, 1, 16, 4, 30, 0).unwrap();

        let next = next_occurrence(hhmm("06:00"), now, tz);

        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 16, 11, 0, 0).unwrap());
    }

    #[test]
    fn next_end_before_midnight_stays_same_day() {
        let now = Utc.with_ymd_and_hms(2025, 1, 16, 1, 15, 0).unwrap();

        let next = next_occurrence(hhmm("06:00"), now, Tz::UTC);

        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 16, 6, 0, 0).unwrap());
    }

    #[test]
    fn dst_gap_resolves_after_the_gap() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2025-03-09 02:30 does not exist locally; 01:00 EST = 06:00 UTC
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 6, 0, 0).unwrap();

        let next = next_occurrence(hhmm("02:30"), now, tz);

        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 9, 7, 30, 0).unwrap());
    }

    #[test]
    fn default_ceilings() {
        let limits = RateLimits::default();
        assert_eq!(limits.ceiling(ChannelType::Email), 50);
        assert_eq!(limits.ceiling(ChannelType::Sms), 10);
        assert_eq!(limits.ceiling(ChannelType::InApp), 200);
    }
}
