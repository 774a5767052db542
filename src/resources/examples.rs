use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static EXAMPLE_FINALIZER: &str = "examples.example.dev/finalizer";

pub const READY_CONDITION: &str = "Ready";

/// Example declares a workload that the operator runs as a Deployment with `size` replicas.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Example",
    group = "example.dev",
    version = "v1",
    namespaced,
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Ready Replicas", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status", "priority": 1, "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ExampleStatus", shortname = "ex")]
#[serde(rename_all = "camelCase")]
pub struct ExampleSpec {
    /// Name of the managed workload. Used as the Deployment name, the container name and the
    /// app.kubernetes.io/name label, so it must be a valid DNS-1123 label.
    #[schemars(length(min = 1, max = 63))]
    pub name: String,

    /// Number of desired replicas.
    #[schemars(range(min = 0))]
    pub size: i32,

    /// Container image. Defaults to the image configured on the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Compute Resources for the container. More info: https://kubernetes.io/docs/concepts/configuration/manage-resources-containers/
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Status of the Example.
/// This is set and managed automatically.
/// Read-only.
/// More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExampleStatus {
    /// Name of the Deployment currently managed for this Example.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The metadata.generation last acted upon by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Total replicas reported by the managed Deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Ready replicas reported by the managed Deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ExampleCondition>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExampleCondition {
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,

    /// Human-readable message indicating details about last transition.
    pub message: Option<String>,

    /// Unique, one-word, CamelCase reason for the condition's last transition.
    pub reason: Option<String>,

    /// Status is the status of the condition. Can be True, False, Unknown.
    pub status: String,

    /// Type of the condition, known values are (`Ready`).
    pub r#type: String,
}

impl ExampleStatus {
    pub fn condition(&self, r#type: &str) -> Option<&ExampleCondition> {
        self.conditions
            .as_ref()
            .and_then(|c| c.iter().find(|cond| cond.r#type == r#type))
    }
}

impl Example {
    pub fn ready_condition(&self) -> Option<&ExampleCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.condition(READY_CONDITION))
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == EXAMPLE_FINALIZER))
    }
}
