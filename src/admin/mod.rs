use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::CacheItem;

/// Contract the ops layer consumes to inspect and edit the resolver's
/// domain cache. `set` also appends to (or replaces in) the
/// configured-domain list and `delete` removes from it, so edits
/// survive the next tick.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, domain: &str) -> Option<Arc<CacheItem>>;
    async fn set(&self, domain: &str, item: Arc<CacheItem>) -> bool;
    async fn delete(&self, domain: &str);
    async fn list(&self) -> HashMap<String, Arc<CacheItem>>;
}
