//! Watch source: list+watch a resource into a local [`Store`] and fan changes out
//! to registered [`ResourceEventHandler`]s.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use ccop_core::{handle_error, object_key, ResourceEventHandler, StoreError, WatchSource};
use ccop_store::Store;
use futures::TryStreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `Api` over one namespace, or all of them when `namespace` is `None`.
pub fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Applies watch events to a [`Store`] and notifies handlers.
pub struct Indexer<K> {
    store: Store<K>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<K>>>>,
    synced_tx: watch::Sender<bool>,
}

impl<K> Default for Indexer<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Indexer<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self { store: Store::new(), handlers: RwLock::new(Vec::new()), synced_tx }
    }

    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler<K>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn key_of(obj: &K) -> Option<String> {
        match object_key(obj) {
            Ok(k) => Some(k),
            Err(e) => {
                warn!(error = %e, "dropping event for object without a usable key");
                handle_error(&e);
                None
            }
        }
    }

    /// Apply one watch event.
    pub fn apply(&self, event: Event<K>) {
        match event {
            Event::Applied(obj) => {
                counter!("ccop_watch_events_total", 1u64, "type" => "applied");
                self.applied(Arc::new(obj));
            }
            Event::Deleted(obj) => {
                counter!("ccop_watch_events_total", 1u64, "type" => "deleted");
                let Some(key) = Self::key_of(&obj) else { return };
                self.store.remove(&key);
                let obj = Arc::new(obj);
                for h in self.handlers() {
                    h.on_delete(Arc::clone(&obj));
                }
            }
            Event::Restarted(list) => {
                counter!("ccop_watch_events_total", 1u64, "type" => "restarted");
                self.restarted(list);
            }
        }
    }

    fn applied(&self, obj: Arc<K>) {
        let Some(key) = Self::key_of(&obj) else { return };
        let old = self.store.upsert(key, Arc::clone(&obj));
        for h in self.handlers() {
            match &old {
                Some(old) => h.on_update(Arc::clone(old), Arc::clone(&obj)),
                None => h.on_add(Arc::clone(&obj)),
            }
        }
    }

    fn restarted(&self, list: Vec<K>) {
        let listed: Vec<(String, Arc<K>)> =
            list.into_iter().filter_map(|o| Self::key_of(&o).map(|k| (k, Arc::new(o)))).collect();
        let count = listed.len();
        let mut previous = self.store.replace(listed.iter().map(|(k, o)| (k.clone(), Arc::clone(o))));
        let handlers = self.handlers();
        for (key, obj) in &listed {
            let old = previous.remove(key);
            for h in &handlers {
                match &old {
                    Some(old) => h.on_update(Arc::clone(old), Arc::clone(obj)),
                    None => h.on_add(Arc::clone(obj)),
                }
            }
        }
        // Whatever is left vanished while we were not watching.
        for (key, gone) in previous {
            debug!(key = %key, "object missing from relist; treating as deleted");
            for h in &handlers {
                h.on_delete(Arc::clone(&gone));
            }
        }
        let first = self.synced_tx.send_if_modified(|synced| !std::mem::replace(synced, true));
        if first {
            info!(count, "initial list applied; cache synced");
        } else {
            debug!(count, "relist applied");
        }
    }
}

/// List+watch driver around an [`Indexer`].
pub struct Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    api: Api<K>,
    config: watcher::Config,
    indexer: Indexer<K>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self { api, config, indexer: Indexer::new() }
    }

    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.indexer.add_event_handler(handler);
    }

    pub fn indexer(&self) -> &Indexer<K> {
        &self.indexer
    }
}

#[async_trait::async_trait]
impl<K> WatchSource<K> for Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn run(&self, stop: CancellationToken) {
        let stream = watcher::watcher(self.api.clone(), self.config.clone()).default_backoff();
        futures::pin_mut!(stream);
        info!("watcher started");
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("watcher stopping");
                    break;
                }
                next = stream.try_next() => match next {
                    Ok(Some(ev)) => self.indexer.apply(ev),
                    Ok(None) => {
                        warn!("watcher stream ended");
                        break;
                    }
                    Err(e) => {
                        counter!("ccop_watch_errors_total", 1u64);
                        warn!(error = %e, "watch failed; retrying with backoff");
                    }
                },
            }
        }
    }

    fn has_synced(&self) -> bool {
        self.indexer.has_synced()
    }

    fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.indexer.subscribe_synced()
    }

    fn get_by_key(&self, key: &str) -> Result<Option<Arc<K>>, StoreError> {
        self.indexer.store().get_by_key(key)
    }
}
