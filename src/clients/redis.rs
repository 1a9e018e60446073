use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::{
    error::StoreError,
    models::retry::RetryConfig,
    store::CounterStore,
    utils::retry_with_backoff,
};

/// Frequency timestamps, rate counters and cancellation flags kept in Redis
/// with native TTLs.
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
    write_retry: RetryConfig,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str, write_retry: RetryConfig) -> Result<Self, StoreError> {
        info!("Connecting to Redis");

        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            write_retry,
        })
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn last_sent(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.connection.clone();
        let nanos: Option<i64> = conn.get(key).await?;

        Ok(nanos.map(DateTime::<Utc>::from_timestamp_nanos))
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
        let seconds = ttl_seconds(ttl);

        retry_with_backoff(&self.write_retry, || {
            let mut conn = self.connection.clone();
            async move {
                conn.set_ex::<_, _, ()>(key, nanos, seconds)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("mark_sent failed: {}", e)))
    }

    async fn count(&self, key: &str) -> Result<u32, StoreError> {
        let mut conn = self.connection.clone();
        let count: Option<u32> = conn.get(key).await?;

        Ok(count.unwrap_or(0))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u32, StoreError> {
        let mut conn = self.connection.clone();

        // SET NX EX opens the window only for a fresh key; INCR never touches the TTL.
        let (count,): (u32,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(ttl_seconds(window))
            .arg("NX")
            .ignore()
            .incr(key, 1)
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let seconds = ttl_seconds(ttl);

        retry_with_backoff(&self.write_retry, || {
            let mut conn = self.connection.clone();
            async move {
                conn.set_ex::<_, _, ()>(key, 1, seconds)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("set_flag failed: {}", e)))
    }

    async fn has_flag(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(key).await?;

        Ok(exists)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.ping::<String>().await?;

        Ok(())
    }
}
