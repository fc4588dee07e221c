//! In-RAM object caches keyed by `namespace/name`.
//!
//! [`Store`] mirrors what the watch source currently sees. [`ShadowCache`] keeps the
//! last snapshot of deleted objects, which the live store no longer has by the time
//! a worker gets to them.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock};

use ccop_core::{split_key, StoreError};
use metrics::gauge;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Live indexed cache, written by the watch source and read by workers.
pub struct Store<K> {
    items: RwLock<FxHashMap<String, Arc<K>>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self { items: RwLock::new(FxHashMap::default()) }
    }
}

impl<K> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `key`. Malformed keys and a poisoned cache are errors; absence is not.
    pub fn get_by_key(&self, key: &str) -> Result<Option<Arc<K>>, StoreError> {
        split_key(key)?;
        let items = self.items.read().map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        Ok(items.get(key).cloned())
    }

    /// Insert or replace; returns the previous object for the key.
    pub fn upsert(&self, key: String, obj: Arc<K>) -> Option<Arc<K>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner).insert(key, obj)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<K>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    /// Swap in a full listing; returns what was cached before.
    pub fn replace(&self, items: impl IntoIterator<Item = (String, Arc<K>)>) -> FxHashMap<String, Arc<K>> {
        let next: FxHashMap<_, _> = items.into_iter().collect();
        debug!(count = next.len(), "store replaced");
        std::mem::replace(&mut *self.items.write().unwrap_or_else(PoisonError::into_inner), next)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.items.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last-known snapshots of deleted objects.
///
/// Written on the delete notification path before the work item is queued, so a
/// worker that dequeues a delete always finds its snapshot here.
pub struct ShadowCache<K> {
    items: RwLock<FxHashMap<String, Arc<K>>>,
}

impl<K> Default for ShadowCache<K> {
    fn default() -> Self {
        Self { items: RwLock::new(FxHashMap::default()) }
    }
}

impl<K> ShadowCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: impl Into<String>, obj: Arc<K>) {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.into(), obj);
        gauge!("ccop_shadow_entries", items.len() as f64);
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> Option<Arc<K>> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let old = items.remove(key);
        gauge!("ccop_shadow_entries", items.len() as f64);
        old
    }

    /// Evict `key` only if it still holds `expected`. A newer delete for the same
    /// key keeps its snapshot.
    pub fn delete_if_same(&self, key: &str, expected: &Arc<K>) -> bool {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let same = items.get(key).is_some_and(|cur| Arc::ptr_eq(cur, expected));
        if same {
            items.remove(key);
            gauge!("ccop_shadow_entries", items.len() as f64);
        }
        same
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
