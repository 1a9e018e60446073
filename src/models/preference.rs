use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::EngineError, models::channel::ChannelType};

pub const CATEGORY_MESSAGE_RECEIVED: &str = "message_received";
pub const CATEGORY_MESSAGE_ASSIGNED: &str = "message_assigned";
pub const CATEGORY_URGENT_MESSAGE: &str = "urgent_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyPolicy {
    Immediate,
    Hourly,
    Daily,
    Weekly,
    UrgentOnly,
}

impl FrequencyPolicy {
    /// Bucket the policy limits sends to. `Immediate` and `UrgentOnly` have no
    /// time bucket; the latter is a hard gate on priority instead.
    pub fn bucket(&self) -> Option<FrequencyBucket> {
        match self {
            FrequencyPolicy::Hourly => Some(FrequencyBucket::Hourly),
            FrequencyPolicy::Daily => Some(FrequencyBucket::Daily),
            FrequencyPolicy::Weekly => Some(FrequencyBucket::Weekly),
            FrequencyPolicy::Immediate | FrequencyPolicy::UrgentOnly => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyBucket {
    Hourly,
    Daily,
    Weekly,
}

impl FrequencyBucket {
    pub fn window(&self) -> TimeDelta {
        match self {
            FrequencyBucket::Hourly => TimeDelta::hours(1),
            FrequencyBucket::Daily => TimeDelta::hours(24),
            FrequencyBucket::Weekly => TimeDelta::days(7),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyBucket::Hourly => "hourly",
            FrequencyBucket::Daily => "daily",
            FrequencyBucket::Weekly => "weekly",
        }
    }
}

/// Wall-clock time of day, stored as minutes since local midnight and
/// serialized as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalTime(u16);

impl LocalTime {
    pub fn new(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    pub fn hour(&self) -> u32 {
        u32::from(self.0 / 60)
    }

    pub fn minute(&self) -> u32 {
        u32::from(self.0 % 60)
    }
}

impl TryFrom<String> for LocalTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (hour, minute) = value
            .split_once(':')
            .ok_or_else(|| format!("Invalid time '{}', expected HH:MM", value))?;

        let hour: u16 = hour
            .parse()
            .map_err(|_| format!("Invalid hour in '{}'", value))?;
        let minute: u16 = minute
            .parse()
            .map_err(|_| format!("Invalid minute in '{}'", value))?;

        LocalTime::new(hour, minute).ok_or_else(|| format!("Time out of range: '{}'", value))
    }
}

impl From<LocalTime> for String {
    fn from(value: LocalTime) -> Self {
        value.to_string()
    }
}

impl Display for LocalTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: LocalTime,
    pub end: LocalTime,

    /// Falls back to the preference timezone when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl QuietHours {
    /// Half-open `[start, end)` containment; `start > end` wraps past midnight
    /// and `start == end` is an empty window.
    pub fn contains(&self, local: LocalTime) -> bool {
        let (start, end, now) = (self.start.0, self.end.0, local.0);

        if start < end {
            now >= start && now < end
        } else if start > end {
            now >= start || now < end
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub frequency: FrequencyPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
}

impl ChannelSettings {
    pub fn enabled(frequency: FrequencyPolicy) -> Self {
        Self {
            enabled: true,
            frequency,
            quiet_hours: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            frequency: FrequencyPolicy::Immediate,
            quiet_hours: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: String,
    pub organization_id: String,
    pub global_opt_out: bool,
    pub channels: BTreeMap<ChannelType, ChannelSettings>,

    /// Category name to per-channel switch. A channel absent from a category map
    /// is not overridden.
    #[serde(default)]
    pub categories: BTreeMap<String, BTreeMap<ChannelType, bool>>,

    pub language: String,
    pub timezone: String,
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreference {
    /// Preference materialized the first time an unconfigured user is seen:
    /// email, push and in-app on at immediate frequency, sms and webhook off.
    pub fn default_for(user_id: &str, organization_id: &str) -> Self {
        let channels = BTreeMap::from([
            (
                ChannelType::Email,
                ChannelSettings::enabled(FrequencyPolicy::Immediate),
            ),
            (ChannelType::Sms, ChannelSettings::disabled()),
            (
                ChannelType::Push,
                ChannelSettings::enabled(FrequencyPolicy::Immediate),
            ),
            (
                ChannelType::InApp,
                ChannelSettings::enabled(FrequencyPolicy::Immediate),
            ),
            (ChannelType::Webhook, ChannelSettings::disabled()),
        ]);

        let standard = BTreeMap::from([
            (ChannelType::Email, true),
            (ChannelType::Sms, false),
            (ChannelType::Push, true),
            (ChannelType::InApp, true),
        ]);
        let urgent = BTreeMap::from([
            (ChannelType::Email, true),
            (ChannelType::Sms, true),
            (ChannelType::Push, true),
            (ChannelType::InApp, true),
        ]);

        let categories = BTreeMap::from([
            (CATEGORY_MESSAGE_RECEIVED.to_string(), standard.clone()),
            (CATEGORY_MESSAGE_ASSIGNED.to_string(), standard),
            (CATEGORY_URGENT_MESSAGE.to_string(), urgent),
        ]);

        Self {
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            global_opt_out: false,
            channels,
            categories,
            language: "en".to_string(),
            timezone: "UTC".to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn channel(&self, channel: ChannelType) -> Option<&ChannelSettings> {
        self.channels.get(&channel)
    }

    /// `Some(false)` when the category explicitly switches this channel off.
    pub fn category_override(&self, category: &str, channel: ChannelType) -> Option<bool> {
        self.categories
            .get(category)
            .and_then(|channels| channels.get(&channel))
            .copied()
    }

    pub fn apply(&mut self, update: PreferenceUpdate) -> Result<(), EngineError> {
        update.validate()?;

        if let Some(opt_out) = update.global_opt_out {
            self.global_opt_out = opt_out;
        }

        for (channel, change) in update.channels.unwrap_or_default() {
            let settings = self
                .channels
                .entry(channel)
                .or_insert_with(ChannelSettings::disabled);

            if let Some(enabled) = change.enabled {
                settings.enabled = enabled;
            }
            if let Some(frequency) = change.frequency {
                settings.frequency = frequency;
            }
            if let Some(quiet_hours) = change.quiet_hours {
                settings.quiet_hours = quiet_hours;
            }
        }

        for (category, switches) in update.categories.unwrap_or_default() {
            self.categories.entry(category).or_default().extend(switches);
        }

        if let Some(language) = update.language {
            self.language = language;
        }
        if let Some(timezone) = update.timezone {
            self.timezone = timezone;
        }

        self.updated_at = Utc::now();

        Ok(())
    }
}

/// Partial preference change. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferenceUpdate {
    #[serde(default)]
    pub global_opt_out: Option<bool>,

    #[serde(default)]
    pub channels: Option<BTreeMap<ChannelType, ChannelSettingsUpdate>>,

    #[serde(default)]
    pub categories: Option<BTreeMap<String, BTreeMap<ChannelType, bool>>>,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSettingsUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub frequency: Option<FrequencyPolicy>,

    /// `Some(None)` clears the window; `None` leaves it as is.
    #[serde(default, deserialize_with = "double_option")]
    pub quiet_hours: Option<Option<QuietHours>>,
}

impl PreferenceUpdate {
    fn validate(&self) -> Result<(), EngineError> {
        if let Some(timezone) = &self.timezone {
            parse_timezone(timezone)?;
        }

        let windows = self
            .channels
            .iter()
            .flat_map(|channels| channels.values())
            .filter_map(|change| change.quiet_hours.as_ref().and_then(Option::as_ref));

        for window in windows {
            if let Some(timezone) = &window.timezone {
                parse_timezone(timezone)?;
            }
        }

        Ok(())
    }
}

pub fn parse_timezone(timezone: &str) -> Result<Tz, EngineError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| EngineError::Validation(format!("Invalid timezone: {}", timezone)))
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
