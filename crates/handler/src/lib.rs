//! ConfigMap handler: each CustomConfig owns one `key: value` entry in the
//! ConfigMap named by `spec.configmapName`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use ccop_core::{CustomConfig, Handler, HandlerError};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    Client,
};
use metrics::counter;
use tracing::{debug, info};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Where a CustomConfig's entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target<'a> {
    pub config_map: &'a str,
    pub key: &'a str,
    pub value: &'a str,
}

pub fn target(cc: &CustomConfig) -> Result<Target<'_>, HandlerError> {
    let config_map = cc
        .spec
        .configmap_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| HandlerError::Invalid("spec.configmapName is required".into()))?;
    if cc.spec.key.is_empty() {
        return Err(HandlerError::Invalid("spec.key is required".into()));
    }
    Ok(Target { config_map, key: &cc.spec.key, value: &cc.spec.value })
}

/// A fresh ConfigMap holding only this CustomConfig's entry.
pub fn desired_config_map(t: &Target<'_>, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(t.config_map.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(t.key.to_string(), t.value.to_string())])),
        ..Default::default()
    }
}

/// Set `key = value`; returns whether anything changed.
pub fn set_entry(cm: &mut ConfigMap, key: &str, value: &str) -> bool {
    let data = cm.data.get_or_insert_with(BTreeMap::new);
    if data.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    data.insert(key.to_string(), value.to_string());
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The key was not there.
    Missing,
    Removed,
    /// The key was the last entry.
    Emptied,
}

pub fn remove_entry(cm: &mut ConfigMap, key: &str) -> Removal {
    let Some(data) = cm.data.as_mut() else { return Removal::Missing };
    if data.remove(key).is_none() {
        return Removal::Missing;
    }
    let binary_empty = cm.binary_data.as_ref().map_or(true, |b| b.is_empty());
    if data.is_empty() && binary_empty {
        Removal::Emptied
    } else {
        Removal::Removed
    }
}

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == code)
}

/// Reconciles CustomConfigs into ConfigMaps in a single namespace.
pub struct ConfigMapHandler {
    api: Api<ConfigMap>,
    namespace: String,
}

impl ConfigMapHandler {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self { api: Api::namespaced(client, &namespace), namespace }
    }

    async fn create(&self, t: &Target<'_>) -> Result<(), HandlerError> {
        let cm = desired_config_map(t, &self.namespace);
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                counter!("ccop_configmap_writes_total", 1u64, "op" => "create");
                info!(ns = %self.namespace, configmap = %t.config_map, key = %t.key, "configmap created");
                Ok(())
            }
            Err(e) if is_status(&e, 409) => {
                debug!(configmap = %t.config_map, "configmap already exists; merging entry");
                self.upsert(t).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert(&self, t: &Target<'_>) -> Result<(), HandlerError> {
        let Some(mut cm) = self.api.get_opt(t.config_map).await? else {
            self.api.create(&PostParams::default(), &desired_config_map(t, &self.namespace)).await?;
            counter!("ccop_configmap_writes_total", 1u64, "op" => "create");
            info!(ns = %self.namespace, configmap = %t.config_map, key = %t.key, "configmap was missing; recreated");
            return Ok(());
        };
        if !set_entry(&mut cm, t.key, t.value) {
            debug!(configmap = %t.config_map, key = %t.key, "entry already up to date");
            return Ok(());
        }
        self.api.replace(t.config_map, &PostParams::default(), &cm).await?;
        counter!("ccop_configmap_writes_total", 1u64, "op" => "update");
        info!(ns = %self.namespace, configmap = %t.config_map, key = %t.key, "configmap entry set");
        Ok(())
    }

    async fn remove(&self, t: &Target<'_>) -> Result<(), HandlerError> {
        let Some(mut cm) = self.api.get_opt(t.config_map).await? else {
            debug!(configmap = %t.config_map, "configmap already gone");
            return Ok(());
        };
        match remove_entry(&mut cm, t.key) {
            Removal::Missing => debug!(configmap = %t.config_map, key = %t.key, "entry already gone"),
            Removal::Removed => {
                self.api.replace(t.config_map, &PostParams::default(), &cm).await?;
                counter!("ccop_configmap_writes_total", 1u64, "op" => "update");
                info!(ns = %self.namespace, configmap = %t.config_map, key = %t.key, "configmap entry removed");
            }
            Removal::Emptied => match self.api.delete(t.config_map, &DeleteParams::default()).await {
                Ok(_) => {
                    counter!("ccop_configmap_writes_total", 1u64, "op" => "delete");
                    info!(ns = %self.namespace, configmap = %t.config_map, "last entry removed; configmap deleted");
                }
                Err(e) if is_status(&e, 404) => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler<CustomConfig> for ConfigMapHandler {
    async fn init(&self) -> Result<(), HandlerError> {
        if self.namespace.is_empty() {
            return Err(HandlerError::Invalid("target namespace is empty".into()));
        }
        info!(ns = %self.namespace, "configmap handler ready");
        Ok(())
    }

    async fn object_created(&self, obj: Option<Arc<CustomConfig>>) -> Result<(), HandlerError> {
        let Some(cc) = obj else {
            debug!("created object no longer cached; skipping");
            return Ok(());
        };
        self.create(&target(&cc)?).await
    }

    async fn object_updated(&self, obj: Option<Arc<CustomConfig>>) -> Result<(), HandlerError> {
        let Some(cc) = obj else {
            debug!("updated object no longer cached; skipping");
            return Ok(());
        };
        self.upsert(&target(&cc)?).await
    }

    async fn object_deleted(&self, obj: Option<Arc<CustomConfig>>) -> Result<(), HandlerError> {
        let Some(cc) = obj else {
            debug!("no snapshot for deleted object; nothing to clean up");
            return Ok(());
        };
        self.remove(&target(&cc)?).await
    }
}
