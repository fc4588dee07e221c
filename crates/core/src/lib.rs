//! CustomConfig operator core types, contracts and errors.
//!
//! Everything the reconciliation engine shares across crates lives here: the
//! queued [`WorkItem`], object keys, the [`CustomConfig`] resource and the
//! three seams ([`WatchSource`], [`ResourceEventHandler`], [`Handler`]) that
//! keep the engine independent of the cluster.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub mod crd;
pub mod error;

pub use crd::{CustomConfig, CustomConfigSpec};
pub use error::{HandlerError, KeyError, StoreError};

/// What happened to a resource to make it worth reconciling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything a work queue can coalesce by key.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// A queued unit of work: the resource key and the event that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    key: String,
    kind: EventKind,
}

impl WorkItem {
    pub fn new(key: impl Into<String>, kind: EventKind) -> Self {
        Self { key: key.into(), kind }
    }

    pub fn created(key: impl Into<String>) -> Self { Self::new(key, EventKind::Created) }
    pub fn updated(key: impl Into<String>) -> Self { Self::new(key, EventKind::Updated) }
    pub fn deleted(key: impl Into<String>) -> Self { Self::new(key, EventKind::Deleted) }

    pub fn kind(&self) -> EventKind { self.kind }
}

impl Keyed for WorkItem {
    fn key(&self) -> &str { &self.key }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.key)
    }
}

/// Compute the cache key of an object: `namespace/name`, or `name` when cluster-scoped.
pub fn object_key<K: kube::Resource>(obj: &K) -> Result<String, KeyError> {
    let meta = obj.meta();
    let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)?;
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => Ok(format!("{}/{}", ns, name)),
        _ => Ok(name.to_string()),
    }
}

/// Split a key produced by [`object_key`] back into `(namespace, name)`.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(KeyError::InvalidKey(key.to_string())),
    }
}

/// Process-wide sink for errors nobody else will act on.
pub fn handle_error(err: &dyn std::error::Error) {
    counter!("ccop_errors_total", 1u64);
    error!(error = %err, "unhandled error");
}

/// A list+watch source with a point-in-time cache of the objects it has seen.
#[async_trait::async_trait]
pub trait WatchSource<K>: Send + Sync {
    /// List once, then watch until `stop` is cancelled.
    async fn run(&self, stop: CancellationToken);

    /// True once the initial list has been applied to the cache.
    fn has_synced(&self) -> bool;

    /// Receiver that flips to `true` when the initial list completes.
    fn subscribe_synced(&self) -> watch::Receiver<bool>;

    /// Current cached object for `key`, if any.
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<K>>, StoreError>;
}

/// Callbacks a watch source invokes for every observed change.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: Arc<K>);
    fn on_update(&self, old: Arc<K>, new: Arc<K>);
    fn on_delete(&self, obj: Arc<K>);
}

/// Domain logic that turns resource changes into side effects.
///
/// Objects are `None` when the controller could not resolve them. Errors are
/// logged by the caller and never retried.
#[async_trait::async_trait]
pub trait Handler<K>: Send + Sync {
    async fn init(&self) -> Result<(), HandlerError>;
    async fn object_created(&self, obj: Option<Arc<K>>) -> Result<(), HandlerError>;
    async fn object_updated(&self, obj: Option<Arc<K>>) -> Result<(), HandlerError>;
    async fn object_deleted(&self, obj: Option<Arc<K>>) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn cc(ns: Option<&str>, name: Option<&str>) -> CustomConfig {
        let mut obj = CustomConfig::new("x", CustomConfigSpec::default());
        obj.metadata = ObjectMeta { name: name.map(String::from), namespace: ns.map(String::from), ..Default::default() };
        obj
    }

    #[test]
    fn keys_namespaced_and_cluster_scoped() {
        assert_eq!(object_key(&cc(Some("ns"), Some("a"))).unwrap(), "ns/a");
        assert_eq!(object_key(&cc(None, Some("a"))).unwrap(), "a");
        assert_eq!(object_key(&cc(Some(""), Some("a"))).unwrap(), "a");
        assert!(matches!(object_key(&cc(Some("ns"), None)), Err(KeyError::MissingName)));
    }

    #[test]
    fn split_round_trips_and_rejects_garbage() {
        assert_eq!(split_key("ns/a").unwrap(), (Some("ns"), "a"));
        assert_eq!(split_key("a").unwrap(), (None, "a"));
        for bad in ["", "/a", "ns/", "a/b/c"] {
            assert!(matches!(split_key(bad), Err(KeyError::InvalidKey(_))), "{bad}");
        }
    }

    #[test]
    fn work_item_display() {
        assert_eq!(WorkItem::deleted("ns/b").to_string(), "deleted(ns/b)");
        assert_eq!(WorkItem::created("ns/a").key(), "ns/a");
    }
}
