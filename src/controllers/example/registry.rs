use std::collections::BTreeMap;
use std::future::Future;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;

use crate::resources::examples::Example;
use crate::Result;

use super::reconcilers::{MANAGED_BY, MANAGED_BY_LABEL};

/// The record kept for every live Example
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub uid: String,
    pub workload: String,
}

/// Registry key of an Example, valid as a ConfigMap data key
pub fn record_key(example: &Example) -> String {
    format!(
        "{}.{}",
        example.namespace().unwrap_or_default(),
        example.name_any()
    )
}

/// Records about Examples kept outside of their namespace.
///
/// Owner references cannot span namespaces, so entries are removed by the finalizer.
pub trait InstanceRegistry: Send + Sync {
    fn lookup(&self, key: &str) -> impl Future<Output = Result<Option<InstanceRecord>>> + Send;

    fn register(
        &self,
        key: &str,
        record: &InstanceRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    fn deregister(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Registry kept in a single ConfigMap in the operator namespace
#[derive(Clone)]
pub struct KubeRegistry {
    api: Api<ConfigMap>,
    name: String,
}

impl KubeRegistry {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }

    async fn data(&self) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .api
            .get_opt(&self.name)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }
}

impl InstanceRegistry for KubeRegistry {
    async fn lookup(&self, key: &str) -> Result<Option<InstanceRecord>> {
        let Some(data) = self.data().await? else {
            return Ok(None);
        };
        match data.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    async fn register(&self, key: &str, record: &InstanceRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        let patch = Patch::Merge(json!({ "data": { key: value } }));
        match self.api.patch(&self.name, &PatchParams::default(), &patch).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!("Creating registry ConfigMap {}", self.name);
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        labels: Some(BTreeMap::from([(
                            MANAGED_BY_LABEL.to_owned(),
                            MANAGED_BY.to_owned(),
                        )])),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(key.to_owned(), value)])),
                    ..Default::default()
                };
                // AlreadyExists surfaces as a Conflict; the next attempt patches instead
                self.api.create(&PostParams::default(), &cm).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn deregister(&self, key: &str) -> Result<()> {
        // a null value removes the key in a merge patch
        let patch = Patch::Merge(json!({ "data": { key: null } }));
        match self.api.patch(&self.name, &PatchParams::default(), &patch).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
