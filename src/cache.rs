//
// Tagged in-memory cache for event documents, listings and role availability
//

use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, LazyLock,
};
use std::time::{Duration, Instant};

use moka::{future::Cache as MokaCache, Expiry};
use serde_json::Value;

use crate::error::Error;

/// The shared cache for everything keyed on events. Using one instance means
/// one `invalidate_by_tags` call site in the engine covers event details,
/// listings and role-availability entries alike.
pub static EVENT_CACHE: LazyLock<TagCache> = LazyLock::new(|| TagCache::new(10_000));

pub const TAG_EVENTS: &str = "events";
pub const TAG_LISTINGS: &str = "listings";
pub const TAG_ANALYTICS: &str = "analytics";

pub fn event_tag(event_uuid: &str) -> String {
    format!("event:{event_uuid}")
}

#[derive(Clone)]
pub struct CachedValue {
    value: Value,
    tags: Arc<Vec<String>>,
    ttl: Duration,
}

struct PerEntryExpiry;

impl Expiry<String, CachedValue> for PerEntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &CachedValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: u64,
}

pub struct TagCache {
    inner: MokaCache<String, CachedValue>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl TagCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: MokaCache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryExpiry)
                .support_invalidation_closures()
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Expired entries are never returned; moka drops them on access.
    pub async fn get(&self, key: &str) -> Option<Value> {
        match self.inner.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Duration, tags: &[String]) {
        let entry = CachedValue {
            value,
            tags: Arc::new(tags.to_vec()),
            ttl,
        };
        self.inner.insert(key.to_string(), entry).await;
    }

    /// Returns the cached value for `key`, or runs `loader` to produce it.
    /// Concurrent callers for the same key are coalesced behind a single
    /// loader invocation; a failing loader caches nothing and its error is
    /// surfaced to every waiter.
    pub async fn get_or_set<F, Fut>(&self, key: &str, ttl: Duration, tags: &[String], loader: F) -> Result<Value, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, Error>>,
    {
        let loaded = Arc::new(AtomicBool::new(false));
        let loaded_inner = Arc::clone(&loaded);
        let tags: Arc<Vec<String>> = Arc::new(tags.to_vec());

        let result = self
            .inner
            .try_get_with(key.to_string(), async move {
                loaded_inner.store(true, Ordering::Relaxed);
                loader().await.map(|value| CachedValue {
                    value,
                    tags,
                    ttl,
                })
            })
            .await;

        if loaded.load(Ordering::Relaxed) {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        match result {
            Ok(entry) => Ok(entry.value),
            Err(e) => err_silent!(e.to_string(), format!("Cache loader for {key} failed")),
        }
    }

    /// Invalidates every entry carrying at least one of `tags`. Applies to
    /// entries inserted before this call; in-flight loaders finishing later
    /// are not affected.
    pub fn invalidate_by_tags(&self, tags: &[&str]) {
        let wanted: Vec<String> = tags.iter().map(ToString::to_string).collect();
        match self.inner.invalidate_entries_if(move |_key, entry| entry.tags.iter().any(|t| wanted.contains(t))) {
            Ok(_) => {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Failed to invalidate cache tags: {e:?}"),
        }
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.inner.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn no_tags() -> Vec<String> {
        Vec::new()
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let cache = TagCache::new(100);
        cache.set("k", json!({"n": 1}), Duration::from_secs(60), &no_tags()).await;
        assert_eq!(cache.get("k").await, Some(json!({"n": 1})));

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_never_returned() {
        let cache = TagCache::new(100);
        cache.set("k", json!(1), Duration::from_millis(30), &no_tags()).await;
        assert_eq!(cache.get("k").await, Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn tag_invalidation_hits_only_tagged_entries() {
        let cache = TagCache::new(100);
        let ttl = Duration::from_secs(60);
        cache.set("ev", json!(1), ttl, &[TAG_EVENTS.to_string(), event_tag("e1")]).await;
        cache.set("avail", json!(2), ttl, &[event_tag("e1")]).await;
        cache.set("other", json!(3), ttl, &[event_tag("e2")]).await;

        cache.invalidate_by_tags(&[&event_tag("e1")]);

        assert_eq!(cache.get("ev").await, None);
        assert_eq!(cache.get("avail").await, None);
        assert_eq!(cache.get("other").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn get_or_set_coalesces_concurrent_loads() {
        let cache = Arc::new(TagCache::new(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set("k", Duration::from_secs(60), &[], || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(json!("loaded"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), json!("loaded"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache = TagCache::new(100);

        let err = cache
            .get_or_set("k", Duration::from_secs(60), &[], || async { Err(crate::error::Error::new("boom", "boom")) })
            .await;
        assert!(err.is_err());

        let ok = cache.get_or_set("k", Duration::from_secs(60), &[], || async { Ok(json!("recovered")) }).await;
        assert_eq!(ok.unwrap(), json!("recovered"));
    }
}
