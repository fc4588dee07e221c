use std::sync::Arc;

use ccop_core::{handle_error, object_key, EventKind, ResourceEventHandler, WorkItem};
use ccop_queue::WorkQueue;
use ccop_store::ShadowCache;
use tracing::{info, warn};

/// Watch callbacks that feed the work queue.
///
/// Deletes record a shadow snapshot before the item is queued.
pub struct QueueingEventHandler<K> {
    queue: WorkQueue<WorkItem>,
    shadow: Arc<ShadowCache<K>>,
}

impl<K> QueueingEventHandler<K>
where
    K: kube::Resource + Send + Sync + 'static,
{
    pub fn new(queue: WorkQueue<WorkItem>, shadow: Arc<ShadowCache<K>>) -> Self {
        Self { queue, shadow }
    }

    fn key(&self, obj: &K, kind: EventKind) -> Option<String> {
        match object_key(obj) {
            Ok(key) => {
                info!(key = %key, kind = %kind, "customconfig event");
                Some(key)
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "cannot key object; skipping");
                handle_error(&e);
                None
            }
        }
    }
}

impl<K> ResourceEventHandler<K> for QueueingEventHandler<K>
where
    K: kube::Resource + Send + Sync + 'static,
{
    fn on_add(&self, obj: Arc<K>) {
        if let Some(key) = self.key(&obj, EventKind::Created) {
            self.queue.add(WorkItem::created(key));
        }
    }

    fn on_update(&self, _old: Arc<K>, new: Arc<K>) {
        if let Some(key) = self.key(&new, EventKind::Updated) {
            self.queue.add(WorkItem::updated(key));
        }
    }

    fn on_delete(&self, obj: Arc<K>) {
        if let Some(key) = self.key(&obj, EventKind::Deleted) {
            self.shadow.add(key.clone(), obj);
            self.queue.add(WorkItem::deleted(key));
        }
    }
}
