use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::resources::examples::{Example, ExampleStatus};
use crate::{Error, Result};

use super::reconcilers::{INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL};

pub(crate) const FIELD_MANAGER: &str = "example-operator";

/// Reads and writes of Examples and the Deployments they own.
///
/// Writes that carry a resourceVersion fail with a 409 Conflict when the object changed since it was read.
pub trait ResourceStore: Send + Sync {
    fn get_example(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Example>>> + Send;

    /// Replace the finalizer list, guarded by the Example's resourceVersion
    fn patch_finalizers(
        &self,
        example: &Example,
        finalizers: Vec<String>,
    ) -> impl Future<Output = Result<Example>> + Send;

    fn patch_status(
        &self,
        example: &Example,
        status: &ExampleStatus,
    ) -> impl Future<Output = Result<Example>> + Send;

    /// Deployments labelled as managed for the Example `instance`
    fn list_children(
        &self,
        namespace: &str,
        instance: &str,
    ) -> impl Future<Output = Result<Vec<Deployment>>> + Send;

    fn get_child(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Deployment>>> + Send;

    fn create_child(&self, child: &Deployment) -> impl Future<Output = Result<Deployment>> + Send;

    /// Replace a child; `child` must carry the observed resourceVersion
    fn replace_child(&self, child: &Deployment)
        -> impl Future<Output = Result<Deployment>> + Send;

    fn delete_child(&self, namespace: &str, name: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn examples(&self, namespace: &str) -> Api<Example> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}

fn name_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.name"))
}

impl ResourceStore for KubeStore {
    async fn get_example(&self, namespace: &str, name: &str) -> Result<Option<Example>> {
        Ok(self.examples(namespace).get_opt(name).await?)
    }

    async fn patch_finalizers(&self, example: &Example, finalizers: Vec<String>) -> Result<Example> {
        let api = self.examples(&namespace_of(example)?);
        let patch = Patch::Merge(json!({
            "metadata": {
                "resourceVersion": example.resource_version(),
                "finalizers": finalizers,
            }
        }));
        Ok(api
            .patch(&name_of(example)?, &PatchParams::default(), &patch)
            .await?)
    }

    async fn patch_status(&self, example: &Example, status: &ExampleStatus) -> Result<Example> {
        let api = self.examples(&namespace_of(example)?);
        // always overwrite status object with what we saw
        let patch = Patch::Apply(json!({
            "apiVersion": Example::api_version(&()),
            "kind": Example::kind(&()),
            "status": status,
        }));
        let ps = PatchParams::apply(FIELD_MANAGER).force();
        Ok(api.patch_status(&name_of(example)?, &ps, &patch).await?)
    }

    async fn list_children(&self, namespace: &str, instance: &str) -> Result<Vec<Deployment>> {
        let lp = ListParams::default()
            .labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY},{INSTANCE_LABEL}={instance}"));
        Ok(self.deployments(namespace).list(&lp).await?.items)
    }

    async fn get_child(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn create_child(&self, child: &Deployment) -> Result<Deployment> {
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_owned()),
        };
        Ok(self.deployments(&namespace_of(child)?).create(&pp, child).await?)
    }

    async fn replace_child(&self, child: &Deployment) -> Result<Deployment> {
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_owned()),
        };
        Ok(self
            .deployments(&namespace_of(child)?)
            .replace(&name_of(child)?, &pp, child)
            .await?)
    }

    async fn delete_child(&self, namespace: &str, name: &str) -> Result<()> {
        debug!("Deleting Deployment {name} in namespace {namespace}");
        self.deployments(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }
}

/// Bounds every API call by a timeout and the shutdown signal
#[derive(Clone)]
pub struct ApiCalls {
    timeout: Duration,
    shutdown: CancellationToken,
}

impl ApiCalls {
    pub fn new(timeout: Duration, shutdown: CancellationToken) -> Self {
        Self { timeout, shutdown }
    }

    pub async fn run<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, call) => match res {
                Ok(res) => res,
                Err(_elapsed) => Err(Error::Timeout(self.timeout)),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::examples::ExampleSpec;
    use crate::ErrorKind;
    use http::{Request, Response};
    use kube::client::Body;

    fn mock_store() -> (
        KubeStore,
        tower_test::mock::Handle<Request<Body>, Response<Body>>,
    ) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (KubeStore::new(Client::new(mock_service, "default")), handle)
    }

    fn status_response(code: u16, reason: &str) -> Response<Body> {
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{reason} from the mock apiserver"),
            "reason": reason,
            "code": code,
        });
        Response::builder()
            .status(code)
            .body(Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn missing_example_is_none() {
        let (store, mut handle) = mock_store();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/example.dev/v1/namespaces/apps/examples/demo"
            );
            send.send_response(status_response(404, "NotFound"));
        });

        let example = store.get_example("apps", "demo").await.unwrap();
        assert!(example.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stale_finalizer_patch_is_a_conflict() {
        let (store, mut handle) = mock_store();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.headers().get("content-type").unwrap(),
                "application/merge-patch+json"
            );
            send.send_response(status_response(409, "Conflict"));
        });

        let mut example = Example::new("demo", ExampleSpec::default());
        example.metadata.namespace = Some("apps".into());
        example.metadata.resource_version = Some("7".into());
        let err = store
            .patch_finalizers(&example, vec!["examples.example.dev/finalizer".into()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn children_are_listed_by_managed_labels() {
        let (store, mut handle) = mock_store();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            let query = request.uri().query().unwrap_or_default().to_owned();
            assert!(query.contains("labelSelector="), "{query}");
            assert!(query.contains("example.dev%2Finstance%3Ddemo") || query.contains("example.dev/instance=demo"), "{query}");
            let list = json!({
                "apiVersion": "apps/v1",
                "kind": "DeploymentList",
                "metadata": {"resourceVersion": "1"},
                "items": [],
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
        });

        assert!(store.list_children("apps", "demo").await.unwrap().is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn calls_time_out() {
        let calls = ApiCalls::new(Duration::from_millis(10), CancellationToken::new());
        let err = calls
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn calls_abort_on_shutdown() {
        let token = CancellationToken::new();
        let calls = ApiCalls::new(Duration::from_secs(5), token.clone());
        token.cancel();
        let err = calls.run(async { Ok(1) }).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn calls_pass_results_through() {
        let calls = ApiCalls::new(Duration::from_secs(5), CancellationToken::new());
        assert_eq!(calls.run(async { Ok(3) }).await.unwrap(), 3);
    }
}
