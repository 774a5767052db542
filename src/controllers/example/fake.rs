//! In-memory stand-ins for the API server, used to drive the reconcile loop in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use kube::runtime::events::Event;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use crate::controllers::State;
use crate::resources::examples::{Example, ExampleSpec, ExampleStatus};
use crate::{Error, Metrics, Result};

use super::controller::Context;
use super::events::EventSink;
use super::reconcilers::{INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL};
use super::registry::{InstanceRecord, InstanceRegistry};
use super::store::ResourceStore;
use super::Settings;

pub type FakeContext = Context<FakeStore, FakeRegistry, FakeEvents>;

pub fn context() -> FakeContext {
    context_with(FakeStore::default(), CancellationToken::new())
}

pub fn context_with(store: FakeStore, shutdown: CancellationToken) -> FakeContext {
    Context::new(
        store,
        FakeRegistry::default(),
        FakeEvents::default(),
        Metrics::default(),
        &State::new(Settings::default()),
        shutdown,
    )
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn not_found(kind: &str, name: &str) -> Error {
    api_error(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

fn conflict(kind: &str, name: &str) -> Error {
    api_error(
        409,
        "Conflict",
        format!("Operation cannot be fulfilled on {kind} \"{name}\": the object has been modified"),
    )
}

/// Writes issued against the store, successful or not
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Finalizers(String),
    Status(String),
    Create(String),
    Replace(String),
    Delete(String),
}

type Key = (String, String);

#[derive(Default)]
struct Objects {
    examples: BTreeMap<Key, Example>,
    deployments: BTreeMap<Key, Deployment>,
    writes: Vec<Write>,
    version: u64,
    uids: u64,
    replace_conflicts: u32,
    finalizer_failures: u32,
}

impl Objects {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }

    fn next_uid(&mut self, prefix: &str) -> Option<String> {
        self.uids += 1;
        Some(format!("{prefix}-{}", self.uids))
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_owned(), name.to_owned())
}

fn key_of<K: kube::Resource>(obj: &K) -> Key {
    key(&obj.namespace().unwrap_or_default(), &obj.name_any())
}

/// Examples and Deployments with resourceVersion checks and finalizer-gated deletion
#[derive(Clone, Default)]
pub struct FakeStore {
    objects: Arc<Mutex<Objects>>,
    latency: Duration,
}

impl FakeStore {
    /// Every call waits `latency` first, so concurrent reconciles interleave
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Objects> {
        self.objects.lock().unwrap()
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    pub fn create_example(&self, namespace: &str, name: &str, spec: ExampleSpec) -> Example {
        let mut objects = self.lock();
        let mut example = Example::new(name, spec);
        example.metadata.namespace = Some(namespace.into());
        example.metadata.uid = objects.next_uid("example");
        example.metadata.generation = Some(1);
        example.metadata.resource_version = objects.next_version();
        objects
            .examples
            .insert(key(namespace, name), example.clone());
        example
    }

    /// Change the spec the way a user edit would: new generation and resourceVersion
    pub fn update_spec(
        &self,
        namespace: &str,
        name: &str,
        change: impl FnOnce(&mut ExampleSpec),
    ) -> Example {
        let mut objects = self.lock();
        let version = objects.next_version();
        let example = objects.examples.get_mut(&key(namespace, name)).unwrap();
        change(&mut example.spec);
        example.metadata.generation = example.metadata.generation.map(|g| g + 1);
        example.metadata.resource_version = version;
        example.clone()
    }

    /// Request deletion; the object stays until its finalizers are gone
    pub fn delete_example(&self, namespace: &str, name: &str) -> Option<Example> {
        let mut objects = self.lock();
        let version = objects.next_version();
        let k = key(namespace, name);
        let example = objects.examples.get_mut(&k)?;
        if example.finalizers().is_empty() {
            objects.examples.remove(&k);
            return None;
        }
        example.metadata.deletion_timestamp = Some(Time(Utc::now()));
        example.metadata.resource_version = version;
        Some(example.clone())
    }

    pub fn example(&self, namespace: &str, name: &str) -> Option<Example> {
        self.lock().examples.get(&key(namespace, name)).cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn deployments(&self, namespace: &str) -> Vec<Deployment> {
        self.lock()
            .deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Put a Deployment in place without going through the reconcile loop
    pub fn insert_deployment(&self, mut deployment: Deployment) {
        let mut objects = self.lock();
        deployment.metadata.resource_version = objects.next_version();
        deployment.metadata.uid = objects.next_uid("deployment");
        objects
            .deployments
            .insert(key_of(&deployment), deployment);
    }

    /// Report `ready` of the requested replicas as ready, like the Deployment controller would
    pub fn set_ready(&self, namespace: &str, name: &str, ready: i32) {
        let mut objects = self.lock();
        let version = objects.next_version();
        let deployment = objects.deployments.get_mut(&key(namespace, name)).unwrap();
        let replicas = deployment.spec.as_ref().and_then(|s| s.replicas);
        deployment.status = Some(DeploymentStatus {
            observed_generation: deployment.metadata.generation,
            replicas,
            updated_replicas: replicas,
            ready_replicas: Some(ready),
            ..Default::default()
        });
        deployment.metadata.resource_version = version;
    }

    /// Change a Deployment the way another client would, leaving its status alone
    pub fn edit_deployment(&self, namespace: &str, name: &str, change: impl FnOnce(&mut Deployment)) {
        let mut objects = self.lock();
        let version = objects.next_version();
        let deployment = objects.deployments.get_mut(&key(namespace, name)).unwrap();
        let before = deployment.spec.clone();
        change(deployment);
        if deployment.spec != before {
            deployment.metadata.generation = deployment.metadata.generation.map(|g| g + 1);
        }
        deployment.metadata.resource_version = version;
    }

    /// The next `n` finalizer patches fail with a server error
    pub fn fail_finalizer_patches(&self, n: u32) {
        self.lock().finalizer_failures = n;
    }

    /// The next `n` replaces fail as if someone else wrote the Deployment first
    pub fn fail_replaces_with_conflict(&self, n: u32) {
        self.lock().replace_conflicts = n;
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

impl ResourceStore for FakeStore {
    async fn get_example(&self, namespace: &str, name: &str) -> Result<Option<Example>> {
        self.delay().await;
        Ok(self.example(namespace, name))
    }

    async fn patch_finalizers(&self, example: &Example, finalizers: Vec<String>) -> Result<Example> {
        self.delay().await;
        let mut objects = self.lock();
        let name = example.name_any();
        objects.writes.push(Write::Finalizers(name.clone()));
        if objects.finalizer_failures > 0 {
            objects.finalizer_failures -= 1;
            return Err(api_error(
                503,
                "ServiceUnavailable",
                "the server is currently unable to handle the request".into(),
            ));
        }
        let k = key_of(example);
        let stored = objects
            .examples
            .get(&k)
            .ok_or_else(|| not_found("examples", &name))?;
        if stored.resource_version() != example.resource_version() {
            return Err(conflict("examples", &name));
        }

        let mut updated = stored.clone();
        updated.metadata.finalizers = Some(finalizers);
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.examples.remove(&k);
            return Ok(updated);
        }
        updated.metadata.resource_version = objects.next_version();
        objects.examples.insert(k, updated.clone());
        Ok(updated)
    }

    async fn patch_status(&self, example: &Example, status: &ExampleStatus) -> Result<Example> {
        self.delay().await;
        let mut objects = self.lock();
        let name = example.name_any();
        objects.writes.push(Write::Status(name.clone()));
        let version = objects.next_version();
        let stored = objects
            .examples
            .get_mut(&key_of(example))
            .ok_or_else(|| not_found("examples", &name))?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = version;
        Ok(stored.clone())
    }

    async fn list_children(&self, namespace: &str, instance: &str) -> Result<Vec<Deployment>> {
        self.delay().await;
        Ok(self
            .deployments(namespace)
            .into_iter()
            .filter(|d| {
                let labels = d.labels();
                labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY)
                    && labels.get(INSTANCE_LABEL).map(String::as_str) == Some(instance)
            })
            .collect())
    }

    async fn get_child(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.delay().await;
        Ok(self.deployment(namespace, name))
    }

    async fn create_child(&self, child: &Deployment) -> Result<Deployment> {
        self.delay().await;
        let mut objects = self.lock();
        let name = child.name_any();
        objects.writes.push(Write::Create(name.clone()));
        let k = key_of(child);
        if objects.deployments.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("deployments.apps \"{name}\" already exists"),
            ));
        }
        let mut created = child.clone();
        created.metadata.uid = objects.next_uid("deployment");
        created.metadata.generation = Some(1);
        created.metadata.resource_version = objects.next_version();
        created.status = None;
        objects.deployments.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_child(&self, child: &Deployment) -> Result<Deployment> {
        self.delay().await;
        let mut objects = self.lock();
        let name = child.name_any();
        objects.writes.push(Write::Replace(name.clone()));
        let k = key_of(child);
        let version = objects.next_version();
        if objects.replace_conflicts > 0 {
            if let Some(stored) = objects.deployments.get_mut(&k) {
                stored.metadata.resource_version = version;
                objects.replace_conflicts -= 1;
                return Err(conflict("deployments.apps", &name));
            }
        }
        let stored = objects
            .deployments
            .get_mut(&k)
            .ok_or_else(|| not_found("deployments.apps", &name))?;
        if stored.resource_version() != child.resource_version() {
            return Err(conflict("deployments.apps", &name));
        }

        let mut replaced = child.clone();
        replaced.metadata.uid = stored.metadata.uid.clone();
        replaced.metadata.generation = if replaced.spec != stored.spec {
            stored.metadata.generation.map(|g| g + 1)
        } else {
            stored.metadata.generation
        };
        replaced.metadata.resource_version = version;
        // status is a subresource and survives a replace
        replaced.status = stored.status.clone();
        *stored = replaced.clone();
        Ok(replaced)
    }

    async fn delete_child(&self, namespace: &str, name: &str) -> Result<()> {
        self.delay().await;
        let mut objects = self.lock();
        objects.writes.push(Write::Delete(name.to_owned()));
        objects
            .deployments
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("deployments.apps", name))
    }
}

#[derive(Default)]
struct Records {
    records: BTreeMap<String, InstanceRecord>,
    deregister_failures: u32,
    registrations: u32,
    deregistrations: u32,
}

#[derive(Clone, Default)]
pub struct FakeRegistry {
    records: Arc<Mutex<Records>>,
}

impl FakeRegistry {
    pub fn insert(&self, key: &str, record: InstanceRecord) {
        self.records
            .lock()
            .unwrap()
            .records
            .insert(key.to_owned(), record);
    }

    pub fn records(&self) -> BTreeMap<String, InstanceRecord> {
        self.records.lock().unwrap().records.clone()
    }

    pub fn registrations(&self) -> u32 {
        self.records.lock().unwrap().registrations
    }

    /// Successful deregistrations so far
    pub fn deregistrations(&self) -> u32 {
        self.records.lock().unwrap().deregistrations
    }

    /// The next `n` deregistrations fail with a server error
    pub fn fail_deregister(&self, n: u32) {
        self.records.lock().unwrap().deregister_failures = n;
    }
}

impl InstanceRegistry for FakeRegistry {
    async fn lookup(&self, key: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.records.lock().unwrap().records.get(key).cloned())
    }

    async fn register(&self, key: &str, record: &InstanceRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        records.registrations += 1;
        records.records.insert(key.to_owned(), record.clone());
        Ok(())
    }

    async fn deregister(&self, key: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.deregister_failures > 0 {
            records.deregister_failures -= 1;
            return Err(api_error(
                500,
                "InternalError",
                "etcdserver: request timed out".into(),
            ));
        }
        records.deregistrations += 1;
        records.records.remove(key);
        Ok(())
    }
}

/// Remembers the reason of every published event
#[derive(Clone, Default)]
pub struct FakeEvents {
    reasons: Arc<Mutex<Vec<String>>>,
}

impl FakeEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

impl EventSink for FakeEvents {
    async fn publish(&self, _example: &Example, event: Event) {
        self.reasons.lock().unwrap().push(event.reason);
    }
}
