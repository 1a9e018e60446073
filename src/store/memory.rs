use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    error::StoreError,
    models::preference::NotificationPreference,
    store::{CounterStore, PreferenceRepository},
};

#[derive(Default)]
pub struct MemoryPreferenceRepository {
    records: DashMap<(String, String), NotificationPreference>,
}

impl MemoryPreferenceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PreferenceRepository for MemoryPreferenceRepository {
    async fn find(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<NotificationPreference>, StoreError> {
        let key = (user_id.to_string(), organization_id.to_string());
        Ok(self.records.get(&key).map(|record| record.value().clone()))
    }

    async fn save(&self, preference: &NotificationPreference) -> Result<(), StoreError> {
        let key = (
            preference.user_id.clone(),
            preference.organization_id.clone(),
        );
        self.records.insert(key, preference.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: Instant,
}

impl CounterEntry {
    fn new(value: i64, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Expired entries are swept once every this many writes.
const SWEEP_INTERVAL: u64 = 256;

/// Counter store held in process memory. Per-key updates run under the
/// map's shard lock, which gives the same atomicity the Redis store has.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
    writes: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries. Must not be called while holding an entry guard.
    fn sweep(&self) {
        self.entries.retain(|_, entry| entry.is_live());
    }

    fn put(&self, key: &str, entry: CounterEntry) {
        self.entries.insert(key.to_string(), entry);
        self.after_write();
    }

    fn after_write(&self) {
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            self.sweep();
        }
    }

    fn live_value(&self, key: &str) -> Option<i64> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn last_sent(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.live_value(key).map(DateTime::<Utc>::from_timestamp_nanos))
    }

    async fn mark_sent(
        &self,
        key: &str,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let nanos = at
            .timestamp_nanos_opt()
            .ok_or_else(|| StoreError::InvalidValue(format!("{} is out of range", at)))?;

        self.put(key, CounterEntry::new(nanos, ttl));
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<u32, StoreError> {
        Ok(self
            .live_value(key)
            .map(|value| value.max(0) as u32)
            .unwrap_or(0))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u32, StoreError> {
        let count = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| CounterEntry::new(0, window));

            if !entry.is_live() {
                *entry = CounterEntry::new(0, window);
            }
            entry.value += 1;
            entry.value
        };
        self.after_write();

        Ok(count.max(0) as u32)
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.put(key, CounterEntry::new(1, ttl));
        Ok(())
    }

    async fn has_flag(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_value(key).is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
