use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::fetcher::{FetchError, QueryFetcher};
use crate::types::{CacheEntry, QueryKey};

const INVALIDATION_CAPACITY: usize = 256;

/// The invalidation surface the dispatcher and page consumers write to.
pub trait CacheFacade: Send + Sync {
    /// Marks every resident entry of `class` stale. Returns how many entries
    /// were resident.
    fn invalidate(&self, class: &str) -> usize;

    /// Marks a single entry stale. Returns whether it was resident.
    fn invalidate_key(&self, key: &QueryKey) -> bool;
}

/// Keyed store of fetched query results. Staleness is lazy: an invalidated
/// entry is refetched by the next [`QueryCache::get_or_fetch`].
#[derive(Clone)]
pub struct QueryCache {
    primary: Arc<DashMap<QueryKey, CacheEntry>>,
    class_index: Arc<DashMap<Arc<str>, DashSet<QueryKey>>>,
    epochs: Arc<DashMap<Arc<str>, u64>>,
    refresh_locks: Arc<DashMap<QueryKey, Arc<Mutex<()>>>>,
    invalidations: broadcast::Sender<Arc<str>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            primary: Arc::new(DashMap::new()),
            class_index: Arc::new(DashMap::new()),
            epochs: Arc::new(DashMap::new()),
            refresh_locks: Arc::new(DashMap::new()),
            invalidations,
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.primary.get(key).map(|entry| entry.value().clone())
    }

    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        self.primary.get(key).map(|entry| entry.stale)
    }

    pub fn put(&self, key: QueryKey, result: Value) {
        self.store(key, CacheEntry { result, stale: false });
    }

    fn store(&self, key: QueryKey, entry: CacheEntry) {
        self.class_index
            .entry(key.class.clone())
            .or_default()
            .insert(key.clone());
        self.primary.insert(key, entry);
    }

    /// Returns the cached result when fresh, otherwise fetches and stores a new
    /// one. Concurrent readers of the same key share a single fetch.
    pub async fn get_or_fetch(
        &self,
        key: &QueryKey,
        fetcher: &dyn QueryFetcher,
    ) -> Result<Value, FetchError> {
        if let Some(entry) = self.get(key) {
            if !entry.stale {
                return Ok(entry.result);
            }
        }

        self.with_refresh_lock(key, || async {
            if let Some(entry) = self.get(key) {
                if !entry.stale {
                    return Ok(entry.result);
                }
            }

            let epoch = self.epoch(&key.class);
            let result = fetcher.fetch(key).await?;
            // An invalidation that raced the fetch leaves the result stale.
            let stale = self.epoch(&key.class) != epoch;
            debug!(query = %key, stale, "fetched query");

            self.store(
                key.clone(),
                CacheEntry {
                    result: result.clone(),
                    stale,
                },
            );
            Ok::<_, FetchError>(result)
        })
        .await
    }

    pub async fn with_refresh_lock<F, Fut, T, E>(&self, key: &QueryKey, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let _guard = lock.lock().await;
        f().await
    }

    pub fn remove(&self, key: &QueryKey) {
        self.primary.remove(key);
        if let Some(set) = self.class_index.get(&key.class) {
            set.remove(key);
            if set.is_empty() {
                drop(set);
                self.class_index.remove_if(&key.class, |_, v| v.is_empty());
            }
        }
        self.refresh_locks.remove(key);
    }

    /// Classes invalidated from now on, for views that refetch eagerly.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<Arc<str>> {
        self.invalidations.subscribe()
    }

    fn epoch(&self, class: &str) -> u64 {
        self.epochs.get(class).map(|e| *e).unwrap_or(0)
    }

    fn bump_epoch(&self, class: &str) {
        *self.epochs.entry(Arc::from(class)).or_insert(0) += 1;
    }

    fn mark_stale(&self, key: &QueryKey) -> bool {
        match self.primary.get_mut(key) {
            Some(mut entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }
}

impl CacheFacade for QueryCache {
    fn invalidate(&self, class: &str) -> usize {
        self.bump_epoch(class);

        let keys: Vec<QueryKey> = match self.class_index.get(class) {
            Some(set) => set.iter().map(|k| k.key().clone()).collect(),
            None => Vec::new(),
        };

        let marked = keys.iter().filter(|key| self.mark_stale(key)).count();
        debug!(class, marked, "invalidated query class");
        let _ = self.invalidations.send(Arc::from(class));
        marked
    }

    fn invalidate_key(&self, key: &QueryKey) -> bool {
        self.bump_epoch(&key.class);
        let marked = self.mark_stale(key);
        debug!(query = %key, marked, "invalidated query");
        let _ = self.invalidations.send(key.class.clone());
        marked
    }
}
