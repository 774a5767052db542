use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::LazyLock;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use regex::Regex;

use crate::resources::examples::{Example, ExampleSpec};
use crate::{Error, Result};

use super::{label_selector, mandatory_labels, object_meta, selector_labels, TEMPLATE_HASH_ANNOTATION};

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("DNS label pattern to compile")
});

/// Values used when an Example leaves a field unset
#[derive(Clone, Debug)]
pub struct WorkloadDefaults {
    pub image: String,
}

impl Default for WorkloadDefaults {
    fn default() -> Self {
        Self {
            image: "nginx:1.27".into(),
        }
    }
}

pub fn validate(spec: &ExampleSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(Error::InvalidSpec("spec.name must not be empty".into()));
    }
    if spec.name.len() > 63 || !DNS_LABEL.is_match(&spec.name) {
        return Err(Error::InvalidSpec(format!(
            "spec.name {:?} is not a valid DNS-1123 label",
            spec.name
        )));
    }
    if spec.size < 0 {
        return Err(Error::InvalidSpec(format!(
            "spec.size must not be negative, got {}",
            spec.size
        )));
    }
    if let Some(image) = spec.image.as_deref() {
        if image.trim().is_empty() || image.chars().any(char::is_whitespace) {
            return Err(Error::InvalidSpec(format!(
                "spec.image {image:?} is not a valid image reference"
            )));
        }
    }
    Ok(())
}

/// The children an Example should own, sorted by name.
///
/// Owner references are left to the diff engine. Identical input always yields identical output.
pub fn build(example: &Example, defaults: &WorkloadDefaults) -> Result<Vec<Deployment>> {
    let spec = &example.spec;
    validate(spec)?;

    let namespace = example
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let instance = example.name_any();

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(selector_labels(&spec.name, &instance)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: spec.name.clone(),
                image: Some(
                    spec.image
                        .clone()
                        .unwrap_or_else(|| defaults.image.clone()),
                ),
                resources: spec.resources.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }),
    };

    let mut metadata = object_meta(
        &namespace,
        &spec.name,
        mandatory_labels(&spec.name, &instance),
    );
    metadata.annotations = Some(BTreeMap::from([(
        TEMPLATE_HASH_ANNOTATION.to_owned(),
        template_hash(&template)?,
    )]));

    Ok(vec![Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(spec.size),
            selector: label_selector(&spec.name, &instance),
            template,
            ..Default::default()
        }),
        status: None,
    }])
}

/// Hash of the pod template, stored on the Deployment so that server-side defaulting
/// of the template does not register as drift
pub fn template_hash(template: &PodTemplateSpec) -> Result<String> {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(serde_json::to_string(template)?.as_bytes());

    let hash_bytes = hasher.finish().to_be_bytes();
    let mut first_4: [u8; 4] = [0; 4];
    first_4.clone_from_slice(&hash_bytes[..4]);

    Ok(safe_encode_u32(u32::from_be_bytes(first_4)))
}

// Same alphabet as the pod-template-hash kubernetes puts on ReplicaSets, so names 'look' right.
fn safe_encode_u32(mut val: u32) -> String {
    const NUMBER_MAP: &[char] = &['4', '5', '6', '7', '8', '9', 'b', 'c', 'd', 'f'];

    // 10^10 - 1 > 2^32 - 1
    let mut out = String::with_capacity(10);

    // decimal digits come out in reverse, which is fine for a hash
    while val > 0 {
        let n = val % 10;
        val /= 10;
        out.push(NUMBER_MAP[n as usize]);
    }

    if out.is_empty() {
        out.push(NUMBER_MAP[0]);
    }

    out
}
