pub mod item;

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

pub use crate::cache::item::CacheItem;

const STORE_CAPACITY: u64 = 1000;

/// Outer per-entry age bound. This is a memory safeguard for unused
/// domains; re-resolution cadence is driven by the TTL window inside
/// each item.
const STORE_TTL: Duration = Duration::from_secs(60);

/// Concurrent domain -> `CacheItem` map. Items are shared handles;
/// callers mutate them through their own lock and `set` them back.
#[derive(Clone)]
pub struct Store {
    inner: Cache<String, Arc<CacheItem>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(STORE_CAPACITY)
                .time_to_live(STORE_TTL)
                .build(),
        }
    }

    pub async fn get(&self, domain: &str) -> Option<Arc<CacheItem>> {
        self.inner.get(domain).await
    }

    pub async fn set(&self, domain: impl Into<String>, item: Arc<CacheItem>) {
        self.inner.insert(domain.into(), item).await;
    }

    pub async fn delete(&self, domain: &str) {
        self.inner.invalidate(domain).await;
    }

    /// Walks the live entries; the callback returns `false` to stop.
    pub fn range<F>(&self, mut iter: F)
    where
        F: FnMut(&str, &Arc<CacheItem>) -> bool,
    {
        for (domain, item) in self.inner.iter() {
            if !iter(domain.as_str(), &item) {
                break;
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
