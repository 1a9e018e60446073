use std::{hash::Hash, time::Duration};

use moka::future::Cache;

/// Process-local cache with a fixed TTL and an upper bound on entries.
#[derive(Clone)]
pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<K, V>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity.max(1))
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: K, value: V) {
        self.cache.insert(key, value).await;
    }

    pub async fn invalidate(&self, key: &K) {
        self.cache.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_millis(50), 10);
        cache.insert("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert("a".to_string(), 1).await;
        cache.insert("a".to_string(), 2).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(2));

        cache.invalidate(&"a".to_string()).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }
}
