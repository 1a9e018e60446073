use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, types::Json};
use tracing::{debug, error, info};

use crate::{
    error::StoreError,
    models::{preference::NotificationPreference, retry::RetryConfig},
    store::PreferenceRepository,
    utils::retry_with_backoff,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notification_preferences (
    user_id TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    preference JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (user_id, organization_id)
)
"#;

const UPSERT: &str = r#"
INSERT INTO notification_preferences (user_id, organization_id, preference, updated_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (user_id, organization_id)
DO UPDATE SET preference = EXCLUDED.preference, updated_at = EXCLUDED.updated_at
"#;

/// Durable preference records, one JSONB document per (user, organization).
pub struct PostgresPreferenceRepository {
    client: Client,
    write_retry: RetryConfig,
}

impl PostgresPreferenceRepository {
    pub async fn connect(database_url: &str, write_retry: RetryConfig) -> Result<Self, StoreError> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self {
            client,
            write_retry,
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client.batch_execute(SCHEMA).await?;
        debug!("Preference schema ensured");
        Ok(())
    }
}

#[async_trait]
impl PreferenceRepository for PostgresPreferenceRepository {
    async fn find(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<NotificationPreference>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT preference FROM notification_preferences \
                 WHERE user_id = $1 AND organization_id = $2",
                &[&user_id, &organization_id],
            )
            .await?;

        match row {
            Some(row) => {
                let Json(preference) = row.try_get::<_, Json<NotificationPreference>>(0)?;
                Ok(Some(preference))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, preference: &NotificationPreference) -> Result<(), StoreError> {
        let client = &self.client;

        retry_with_backoff(&self.write_retry, || async move {
            client
                .execute(
                    UPSERT,
                    &[
                        &preference.user_id,
                        &preference.organization_id,
                        &Json(preference),
                        &preference.updated_at,
                    ],
                )
                .await
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| {
            error!(
                error = %e,
                user_id = %preference.user_id,
                organization_id = %preference.organization_id,
                "Failed to persist notification preference"
            );
            StoreError::Unavailable(format!("Preference write failed: {}", e))
        })?;

        debug!(
            user_id = %preference.user_id,
            organization_id = %preference.organization_id,
            "Notification preference persisted"
        );

        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
