use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

pub mod desired;
pub mod diff;
pub mod finalizer;
pub mod status;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "example.dev/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "example-operator";
pub const TEMPLATE_HASH_ANNOTATION: &str = "example.dev/template-hash";

// selector labels are immutable on a Deployment; it is not safe to change these
pub fn selector_labels(workload: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.into(), workload.into()),
        (INSTANCE_LABEL.into(), instance.into()),
    ])
}

// labels applied to every object we create
pub fn mandatory_labels(workload: &str, instance: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(workload, instance);
    labels.insert(MANAGED_BY_LABEL.into(), MANAGED_BY.into());
    labels
}

pub fn label_selector(workload: &str, instance: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(workload, instance)),
        match_expressions: None,
    }
}

pub fn object_meta(namespace: &str, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Whether `meta` carries an owner reference to the object with `uid`
pub fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|orefs| orefs.iter().any(|oref| oref.uid == uid))
}
