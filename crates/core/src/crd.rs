//! The CustomConfig resource: one key/value entry destined for a named ConfigMap.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "customconfig.ccop.dev";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(group = "customconfig.ccop.dev", version = "v1", kind = "CustomConfig", plural = "customconfigs", namespaced)]
#[kube(shortname = "cc")]
#[serde(rename_all = "camelCase")]
pub struct CustomConfigSpec {
    pub key: String,
    pub value: String,
    /// ConfigMap that receives the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configmap_name: Option<String>,
}
