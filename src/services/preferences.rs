use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{EngineError, StoreError},
    models::preference::{NotificationPreference, PreferenceUpdate},
    store::{PreferenceRepository, cache::TtlCache},
};

type PreferenceKey = (String, String);

/// Read-mostly access to notification preferences: a bounded TTL cache in
/// front of the durable repository.
///
/// Cache misses and updates for the same (user, organization) are serialized
/// through a per-key lock, so a read that raced an update can never put the
/// older record back into the cache.
pub struct PreferenceStore {
    repository: Arc<dyn PreferenceRepository>,
    cache: TtlCache<PreferenceKey, NotificationPreference>,
    locks: DashMap<PreferenceKey, Arc<Mutex<()>>>,
}

impl PreferenceStore {
    pub fn new(
        repository: Arc<dyn PreferenceRepository>,
        cache: TtlCache<PreferenceKey, NotificationPreference>,
    ) -> Self {
        Self {
            repository,
            cache,
            locks: DashMap::new(),
        }
    }

    /// Returns the stored preference, materializing the default on first access.
    /// Errors only when the repository itself fails.
    pub async fn get(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<NotificationPreference, StoreError> {
        let key = (user_id.to_string(), organization_id.to_string());

        if let Some(preference) = self.cache.get(&key).await {
            return Ok(preference);
        }

        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;

            match self.cache.get(&key).await {
                Some(preference) => Ok(preference),
                None => self.load_or_materialize(&key).await,
            }
        };
        drop(lock);
        self.release(&key);

        result
    }

    /// Merges `update` into the current record, persists it and refreshes the
    /// cache before returning.
    pub async fn update(
        &self,
        user_id: &str,
        organization_id: &str,
        update: PreferenceUpdate,
    ) -> Result<NotificationPreference, EngineError> {
        let key = (user_id.to_string(), organization_id.to_string());

        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.merge_and_save(&key, update).await
        };
        drop(lock);
        self.release(&key);

        result
    }

    async fn load_or_materialize(
        &self,
        key: &PreferenceKey,
    ) -> Result<NotificationPreference, StoreError> {
        let (user_id, organization_id) = key;

        let preference = match self.repository.find(user_id, organization_id).await? {
            Some(preference) => preference,
            None => {
                let preference = NotificationPreference::default_for(user_id, organization_id);
                self.repository.save(&preference).await?;
                info!(
                    user_id = %user_id,
                    organization_id = %organization_id,
                    "Default notification preference created"
                );
                preference
            }
        };

        self.cache.insert(key.clone(), preference.clone()).await;
        Ok(preference)
    }

    async fn merge_and_save(
        &self,
        key: &PreferenceKey,
        update: PreferenceUpdate,
    ) -> Result<NotificationPreference, EngineError> {
        let (user_id, organization_id) = key;

        let mut preference = self
            .repository
            .find(user_id, organization_id)
            .await?
            .unwrap_or_else(|| NotificationPreference::default_for(user_id, organization_id));

        preference.apply(update)?;

        if let Err(e) = self.repository.save(&preference).await {
            self.cache.invalidate(key).await;
            return Err(e.into());
        }

        self.cache.insert(key.clone(), preference.clone()).await;

        debug!(
            user_id = %user_id,
            organization_id = %organization_id,
            "Notification preference updated"
        );

        Ok(preference)
    }

    fn lock_for(&self, key: &PreferenceKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &PreferenceKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
