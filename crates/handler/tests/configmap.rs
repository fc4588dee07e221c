#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use ccop_core::{CustomConfig, CustomConfigSpec, HandlerError};
use ccop_handler::{desired_config_map, remove_entry, set_entry, target, Removal, Target};

fn cc(key: &str, value: &str, cm: Option<&str>) -> CustomConfig {
    CustomConfig::new(
        "cfg",
        CustomConfigSpec { key: key.into(), value: value.into(), configmap_name: cm.map(String::from) },
    )
}

#[test]
fn target_requires_configmap_name_and_key() {
    let ok = cc("k", "v", Some("app-config"));
    assert_eq!(target(&ok).unwrap(), Target { config_map: "app-config", key: "k", value: "v" });

    assert!(matches!(target(&cc("k", "v", None)), Err(HandlerError::Invalid(_))));
    assert!(matches!(target(&cc("k", "v", Some(""))), Err(HandlerError::Invalid(_))));
    assert!(matches!(target(&cc("", "v", Some("app-config"))), Err(HandlerError::Invalid(_))));
}

#[test]
fn desired_config_map_holds_single_entry() {
    let obj = cc("log.level", "debug", Some("app-config"));
    let cm = desired_config_map(&target(&obj).unwrap(), "prod");
    assert_eq!(cm.metadata.name.as_deref(), Some("app-config"));
    assert_eq!(cm.metadata.namespace.as_deref(), Some("prod"));
    assert_eq!(cm.data, Some(BTreeMap::from([("log.level".to_string(), "debug".to_string())])));
}

#[test]
fn set_entry_reports_changes() {
    let obj = cc("a", "1", Some("cm"));
    let mut cm = desired_config_map(&target(&obj).unwrap(), "default");
    assert!(!set_entry(&mut cm, "a", "1"));
    assert!(set_entry(&mut cm, "a", "2"));
    assert!(set_entry(&mut cm, "b", "3"));
    let data = cm.data.unwrap();
    assert_eq!(data.get("a").map(String::as_str), Some("2"));
    assert_eq!(data.len(), 2);
}

#[test]
fn set_entry_on_empty_config_map() {
    let mut cm = k8s_openapi::api::core::v1::ConfigMap::default();
    assert!(set_entry(&mut cm, "a", "1"));
    assert_eq!(cm.data.unwrap().len(), 1);
}

#[test]
fn remove_entry_distinguishes_last_entry() {
    let obj = cc("a", "1", Some("cm"));
    let mut cm = desired_config_map(&target(&obj).unwrap(), "default");
    set_entry(&mut cm, "b", "2");

    assert_eq!(remove_entry(&mut cm, "missing"), Removal::Missing);
    assert_eq!(remove_entry(&mut cm, "a"), Removal::Removed);
    assert_eq!(remove_entry(&mut cm, "b"), Removal::Emptied);
    assert_eq!(remove_entry(&mut cm, "b"), Removal::Missing);
}

#[test]
fn binary_data_keeps_config_map_alive() {
    let obj = cc("a", "1", Some("cm"));
    let mut cm = desired_config_map(&target(&obj).unwrap(), "default");
    cm.binary_data = Some(BTreeMap::from([(
        "blob".to_string(),
        k8s_openapi::ByteString(vec![1, 2, 3]),
    )]));
    assert_eq!(remove_entry(&mut cm, "a"), Removal::Removed);
}
