//! Reconciliation loop.
//!
//! Watch callbacks turn changes into [`WorkItem`]s (see [`QueueingEventHandler`]);
//! workers pull them from the [`WorkQueue`], resolve the object and dispatch to a
//! [`Handler`]. Only lookup failures are retried; handler failures are logged.

#![forbid(unsafe_code)]

use std::sync::Arc;

use ccop_core::{handle_error, EventKind, Handler, HandlerError, Keyed, StoreError, WatchSource, WorkItem};
use ccop_queue::WorkQueue;
use ccop_store::ShadowCache;
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod events;

pub use events::QueueingEventHandler;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("handler init failed: {0}")]
    HandlerInit(#[source] HandlerError),
    #[error("{name}: stopped before caches synced")]
    CacheSync { name: String },
    #[error("{name}: worker panicked")]
    WorkerPanicked { name: String },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent worker loops over the same queue.
    pub workers: usize,
    /// Lookup failures tolerated per key before it is dropped.
    pub max_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 1, max_retries: 5 }
    }
}

/// Releases the queue's processing marker however the iteration ends.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<WorkItem>,
    item: &'a WorkItem,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.item);
    }
}

pub struct Controller<K, W, H> {
    name: String,
    source: Arc<W>,
    queue: WorkQueue<WorkItem>,
    handler: Arc<H>,
    shadow: Arc<ShadowCache<K>>,
    config: ControllerConfig,
}

impl<K, W, H> Controller<K, W, H>
where
    K: Send + Sync + 'static,
    W: WatchSource<K> + 'static,
    H: Handler<K> + 'static,
{
    /// Build a controller; runs [`Handler::init`] once.
    pub async fn new(
        name: impl Into<String>,
        source: Arc<W>,
        queue: WorkQueue<WorkItem>,
        handler: Arc<H>,
        shadow: Arc<ShadowCache<K>>,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        handler.init().await.map_err(ControllerError::HandlerInit)?;
        Ok(Self { name: name.into(), source, queue, handler, shadow, config })
    }

    pub fn has_synced(&self) -> bool {
        self.source.has_synced()
    }

    /// Run until `stop` is cancelled: start the watch source, wait for its initial
    /// sync, then drive workers. On stop the queue is shut down and drained.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<(), ControllerError> {
        let stop = stop.child_token();
        info!(controller = %self.name, "controller initiating");

        let source_task = tokio::spawn({
            let source = Arc::clone(&self.source);
            let stop = stop.clone();
            async move { source.run(stop).await }
        });

        if !self.wait_for_cache_sync(&stop).await {
            let err = ControllerError::CacheSync { name: self.name.clone() };
            handle_error(&err);
            stop.cancel();
            self.queue.shut_down();
            let _ = source_task.await;
            return Err(err);
        }
        info!(controller = %self.name, "cache sync complete");

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let this = Arc::clone(&self);
            workers.spawn(async move { this.run_worker(id).await });
        }

        let mut panicked = false;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(res) = workers.join_next() => {
                    if self.log_worker_exit(res) {
                        panicked = true;
                        stop.cancel();
                        break;
                    }
                }
            }
        }

        info!(controller = %self.name, pending = self.queue.len(), "draining queue");
        self.queue.shut_down();
        while let Some(res) = workers.join_next().await {
            panicked |= self.log_worker_exit(res);
        }
        if let Err(e) = source_task.await {
            error!(controller = %self.name, error = %e, "watch source task failed");
        }
        info!(controller = %self.name, "controller stopped");

        if panicked {
            return Err(ControllerError::WorkerPanicked { name: self.name.clone() });
        }
        Ok(())
    }

    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> bool {
        info!(controller = %self.name, "waiting for caches to sync");
        let mut synced = self.source.subscribe_synced();
        tokio::select! {
            ok = async { synced.wait_for(|s| *s).await.is_ok() } => ok,
            _ = stop.cancelled() => false,
        }
    }

    /// True when the worker died from a panic.
    fn log_worker_exit(&self, res: Result<(), tokio::task::JoinError>) -> bool {
        match res {
            Ok(()) => false,
            Err(e) if e.is_panic() => {
                error!(controller = %self.name, error = %e, "worker panicked");
                true
            }
            Err(e) => {
                warn!(controller = %self.name, error = %e, "worker cancelled");
                false
            }
        }
    }

    async fn run_worker(&self, id: usize) {
        debug!(controller = %self.name, worker = id, "worker starting");
        while self.process_next_item().await {}
        debug!(controller = %self.name, worker = id, "worker completed");
    }

    /// Handle one queued item. Returns `false` once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };
        let _done = DoneGuard { queue: &self.queue, item: &item };
        let key = item.key();
        // Evicted once this item finishes, so a Deleted item coalesced into a later
        // add does not strand its snapshot. Snapshots stored after this read survive.
        let snapshot = self.shadow.get(key);

        let obj = match self.source.get_by_key(key) {
            Ok(obj) => obj,
            Err(err) => {
                if !self.resolution_failed(&item, err) {
                    self.evict_snapshot(key, snapshot.as_ref());
                }
                return true;
            }
        };

        let kind = item.kind();
        info!(controller = %self.name, key = %key, kind = %kind, "processing item");
        let res = match kind {
            EventKind::Created => self.handler.object_created(obj).await,
            EventKind::Updated => self.handler.object_updated(obj).await,
            EventKind::Deleted => {
                // The live cache no longer has it; use the snapshot taken at delete time.
                if snapshot.is_none() {
                    warn!(controller = %self.name, key = %key, "no shadow snapshot for deleted object");
                }
                self.handler.object_deleted(snapshot.clone()).await
            }
        };
        self.evict_snapshot(key, snapshot.as_ref());
        counter!("ccop_dispatch_total", 1u64, "kind" => kind.as_str());
        if let Err(e) = res {
            counter!("ccop_handler_errors_total", 1u64, "kind" => kind.as_str());
            error!(controller = %self.name, key = %key, kind = %kind, error = %e, "handler failed; not retrying");
        }
        self.queue.forget(&item);
        true
    }

    fn evict_snapshot(&self, key: &str, snapshot: Option<&Arc<K>>) {
        if let Some(snapshot) = snapshot {
            if self.shadow.delete_if_same(key, snapshot) {
                debug!(controller = %self.name, key = %key, "shadow snapshot evicted");
            }
        }
    }

    /// Returns whether the item was requeued.
    fn resolution_failed(&self, item: &WorkItem, err: StoreError) -> bool {
        counter!("ccop_resolution_errors_total", 1u64);
        let requeues = self.queue.num_requeues(item);
        if requeues < self.config.max_retries {
            warn!(controller = %self.name, item = %item, requeues, error = %err, "lookup failed, retrying");
            self.queue.add_rate_limited(item.clone());
            true
        } else {
            error!(controller = %self.name, item = %item, requeues, error = %err, "lookup failed, no more retries");
            self.queue.forget(item);
            handle_error(&err);
            false
        }
    }
}
