//! Bounded, keyed cache with LRU eviction and sliding (idle) expiration.
//!
//! Built on [`moka::future::Cache`]. Moka's `time_to_idle` is exactly
//! sliding expiration: the per-entry timer is rearmed on every access, and
//! `max_capacity` plus an explicit LRU eviction policy bounds entry count.

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use moka::future::Cache as MokaCache;
use moka::policy::EvictionPolicy;

/// A bounded, keyed store of values of type `T`, with LRU eviction and
/// optional sliding expiration.
///
/// `capacity <= 0` disables caching entirely: every operation becomes a
/// no-op and `get` always misses, so callers never need a separate branch
/// for the disabled case.
pub struct TaskCache<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + Debug + 'static,
    T: Clone + Send + Sync + 'static,
{
    inner: Option<MokaCache<K, T>>,
}

impl<K, T> TaskCache<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + Debug + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache bounded to `capacity` entries, evicting idle entries
    /// after `sliding_expiration` (a zero duration disables expiration).
    ///
    /// `capacity <= 0` disables caching: all operations become no-ops.
    pub fn new(capacity: i64, sliding_expiration: Duration) -> Self {
        if capacity <= 0 {
            return Self { inner: None };
        }

        let mut builder = MokaCache::builder()
            .max_capacity(capacity as u64)
            .eviction_policy(EvictionPolicy::lru());

        if !sliding_expiration.is_zero() {
            builder = builder.time_to_idle(sliding_expiration);
        }

        Self {
            inner: Some(builder.build()),
        }
    }

    /// Whether caching is enabled (i.e. `capacity > 0` was used at
    /// construction).
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Fetch a cached value, refreshing its recency on hit. Returns `None`
    /// on miss, expiry, or when caching is disabled.
    pub async fn get(&self, key: &K) -> Option<T> {
        let cache = self.inner.as_ref()?;
        let value = cache.get(key).await;
        log::debug!(
            "cache {} for key {:?}",
            if value.is_some() { "hit" } else { "miss" },
            key
        );
        value
    }

    /// Insert `key` with `init`'s result only if `key` is absent; if
    /// already present, the existing value is returned untouched. Atomic
    /// with respect to concurrent callers racing the same key (moka runs
    /// at most one `init` per key). Returns `None` when caching is
    /// disabled (nothing to store, so there is nothing to return either).
    pub async fn get_or_insert_with<F>(&self, key: K, init: F) -> Option<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let cache = self.inner.as_ref()?;
        Some(cache.get_with(key, init).await)
    }

    /// Insert or overwrite `key`. A no-op when caching is disabled.
    pub async fn set(&self, key: K, value: T) {
        let Some(cache) = self.inner.as_ref() else {
            return;
        };
        cache.insert(key, value).await;
    }

    /// Remove `key` if present. A no-op when caching is disabled.
    pub async fn remove(&self, key: &K) {
        let Some(cache) = self.inner.as_ref() else {
            return;
        };
        cache.invalidate(key).await;
    }

    /// Drop all cached entries. A no-op when caching is disabled.
    pub async fn clear(&self) {
        let Some(cache) = self.inner.as_ref() else {
            return;
        };
        cache.invalidate_all();
        // Moka's invalidate_all is asynchronous under the hood; run
        // pending tasks so a subsequent `len`/`get` sees the clear.
        cache.run_pending_tasks().await;
    }

    /// Current number of entries (best-effort; moka's count is eventually
    /// consistent with in-flight inserts/evictions).
    pub async fn len(&self) -> u64 {
        match &self.inner {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_cache_is_always_a_miss() {
        let cache: TaskCache<String, i32> = TaskCache::new(0, Duration::ZERO);
        assert!(!cache.is_enabled());
        cache.set("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn set_then_get_hits() {
        let cache: TaskCache<String, i32> = TaskCache::new(10, Duration::ZERO);
        cache.set("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn remove_drops_entry() {
        let cache: TaskCache<String, i32> = TaskCache::new(10, Duration::ZERO);
        cache.set("a".to_string(), 1).await;
        cache.remove(&"a".to_string()).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let cache: TaskCache<String, i32> = TaskCache::new(10, Duration::ZERO);
        cache.set("a".to_string(), 1).await;
        cache.set("b".to_string(), 2).await;
        cache.clear().await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.get(&"b".to_string()).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn capacity_bounds_entry_count() {
        let cache: TaskCache<i32, i32> = TaskCache::new(2, Duration::ZERO);
        cache.set(1, 1).await;
        cache.set(2, 2).await;
        cache.set(3, 3).await;
        cache.inner.as_ref().unwrap().run_pending_tasks().await;
        assert!(cache.len().await <= 2);
    }

    #[tokio::test]
    async fn get_or_insert_with_is_a_noop_when_already_present() {
        let cache: TaskCache<&str, i32> = TaskCache::new(10, Duration::ZERO);
        cache.set("a", 1).await;
        let result = cache.get_or_insert_with("a", async { 2 }).await;
        assert_eq!(result, Some(1));
        assert_eq!(cache.get(&"a").await, Some(1));
    }

    #[tokio::test]
    async fn get_or_insert_with_inserts_when_absent() {
        let cache: TaskCache<&str, i32> = TaskCache::new(10, Duration::ZERO);
        let result = cache.get_or_insert_with("a", async { 9 }).await;
        assert_eq!(result, Some(9));
        assert_eq!(cache.get(&"a").await, Some(9));
    }

    #[tokio::test]
    async fn sliding_expiration_evicts_idle_entries() {
        let cache: TaskCache<&str, i32> = TaskCache::new(10, Duration::from_millis(20));
        cache.set("a", 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.inner.as_ref().unwrap().run_pending_tasks().await;
        assert_eq!(cache.get(&"a").await, None);
    }
}
