use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::{Event, EventType};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{controller, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource,
};
use serde::Serialize;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::backoff::RetryTracker;
use crate::controllers::{Diagnostics, State};
use crate::resources::examples::{Example, READY_CONDITION};
use crate::{telemetry, Error, ErrorKind, Metrics, Result};

use super::events::{EventSink, KubeEvents};
use super::reconcilers::status::{self, Outcome};
use super::reconcilers::{desired, diff, finalizer, MANAGED_BY, MANAGED_BY_LABEL};
use super::registry::{record_key, InstanceRecord, InstanceRegistry, KubeRegistry};
use super::store::{ApiCalls, KubeStore, ResourceStore};
use super::Settings;

// Context for our reconciler
pub struct Context<S = KubeStore, R = KubeRegistry, E = KubeEvents> {
    /// Examples and their Deployments
    pub store: S,
    /// Records cleaned up by the finalizer
    pub registry: R,
    /// Kubernetes event recorder
    pub events: E,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub settings: Settings,
    /// Timeout and shutdown for every store call
    pub calls: ApiCalls,
    /// Consecutive failures per Example, for backoff
    pub retries: RetryTracker<ObjectRef<Example>>,
}

impl<S, R, E> Context<S, R, E> {
    pub fn new(
        store: S,
        registry: R,
        events: E,
        metrics: Metrics,
        state: &State,
        shutdown: CancellationToken,
    ) -> Self {
        let settings = state.settings().clone();
        Context {
            store,
            registry,
            events,
            diagnostics: state.diagnostics.clone(),
            metrics,
            calls: ApiCalls::new(settings.api_timeout, shutdown),
            retries: RetryTracker::new(settings.retry.clone()),
            settings,
        }
    }
}

impl Context<KubeStore, KubeRegistry, KubeEvents> {
    pub fn for_cluster(
        client: Client,
        metrics: Metrics,
        state: &State,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let settings = state.settings();
        Arc::new(Context::new(
            KubeStore::new(client.clone()),
            KubeRegistry::new(
                client.clone(),
                &settings.registry_namespace,
                settings.registry_name.clone(),
            ),
            KubeEvents::new(client, settings.api_timeout),
            metrics,
            state,
            shutdown,
        ))
    }
}

#[instrument(skip(ctx, example), fields(trace_id))]
pub async fn reconcile<S: ResourceStore, R: InstanceRegistry, E: EventSink>(
    example: Arc<Example>,
    ctx: Arc<Context<S, R, E>>,
) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Example>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = example
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = example.name_any();

    info!("Reconciling Example {name} in namespace {namespace}");
    match ctx.reconcile_request(&namespace, &name).await {
        Ok(action) => {
            ctx.retries.reset(&ObjectRef::from_obj(example.as_ref()));
            Ok(action)
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);
            ctx.metrics.reconcile_failure(example.as_ref(), &err);
            Err(err)
        }
    }
}

pub fn error_policy<S, R, E>(example: Arc<Example>, error: &Error, ctx: Arc<Context<S, R, E>>) -> Action {
    let (attempt, delay) = ctx
        .retries
        .next_delay(ObjectRef::from_obj(example.as_ref()));
    debug!(
        "Retrying Example {} in {delay:?} (attempt {attempt}, {:?}): {error}",
        example.name_any(),
        error.kind()
    );
    ctx.metrics.backoff_requeue(error.kind());
    Action::requeue(delay)
}

impl<S: ResourceStore, R: InstanceRegistry, E: EventSink> Context<S, R, E> {
    /// One pass of the reconcile loop for the Example `namespace/name`.
    ///
    /// The Example is always read fresh; the copy that triggered the request may be stale.
    pub async fn reconcile_request(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(example) = self
            .calls
            .run(self.store.get_example(namespace, name))
            .await?
        else {
            debug!("Example {name} in namespace {namespace} no longer exists");
            return Ok(Action::await_change());
        };

        if example.metadata.deletion_timestamp.is_some() {
            return self.cleanup(&example).await;
        }

        let example = match finalizer::ensure(self, &example).await {
            Ok(Some(updated)) => updated,
            Ok(None) => example,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Action::await_change()),
            Err(err) => return Err(err),
        };

        self.reconcile_status(&example).await
    }

    // Reconcile the children, then persist what we saw. This is the only place status is written
    // for a live Example.
    async fn reconcile_status(&self, example: &Example) -> Result<Action> {
        let (result, observed, outcome) = match self.reconcile_children(example).await {
            Ok(observed) => (Ok(()), Some(observed), Outcome::Reconciled),
            // leave everything as it is, the next leader will pick up from here
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                let outcome = Outcome::from_error(&err);
                (Err(err), None, outcome)
            }
        };

        let new_status = status::project(
            example,
            observed.as_deref(),
            &outcome,
            &Time(Utc::now()),
        );

        if example.status.as_ref() != Some(&new_status) {
            match self
                .calls
                .run(self.store.patch_status(example, &new_status))
                .await
            {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Ok(Action::await_change())
                }
                // the reconcile error is the more useful one to report
                Err(err) => return Err(result.err().unwrap_or(err)),
            }

            if let Some(event) = status::transition_event(
                example.ready_condition(),
                new_status.condition(READY_CONDITION),
            ) {
                self.events.publish(example, event).await;
            }
        }

        match result {
            Ok(()) => {
                let ready = new_status
                    .condition(READY_CONDITION)
                    .is_some_and(|c| c.status == "True");
                if ready {
                    // If no events were received, check back every now and then
                    Ok(Action::requeue(self.settings.resync))
                } else {
                    info!(
                        "Example {} is not yet ready: {}/{} replicas",
                        example.name_any(),
                        new_status.ready_replicas.unwrap_or(0),
                        example.spec.size
                    );
                    Ok(Action::requeue(self.settings.not_ready_requeue))
                }
            }
            Err(err) if err.kind() == ErrorKind::Permanent => {
                warn!(
                    "Example {} cannot be reconciled until it changes: {err}",
                    example.name_any()
                );
                self.metrics.reconcile_failure(example, &err);
                Ok(Action::requeue(self.settings.permanent_error_requeue))
            }
            Err(err) => Err(err),
        }
    }

    // Returns the Deployments observed once all writes went through
    async fn reconcile_children(&self, example: &Example) -> Result<Vec<Deployment>> {
        let namespace = example
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let name = example.name_any();

        let desired = desired::build(example, &self.settings.workload)?;
        let owner = example
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey("metadata.uid"))?;

        let mut observed = self
            .calls
            .run(self.store.list_children(&namespace, &name))
            .await?;
        // a child that lost its labels is only found by name
        for want in &desired {
            let child = want.name_any();
            if observed.iter().any(|have| have.name_any() == child) {
                continue;
            }
            if let Some(have) = self
                .calls
                .run(self.store.get_child(&namespace, &child))
                .await?
            {
                observed.push(have);
            }
        }

        let actions = diff::plan(&owner, &desired, &observed)?;
        if actions.is_empty() {
            debug!("Deployments of Example {name} are up to date");
        } else {
            diff::apply(self, example, &owner, &desired, actions).await?;
            observed = self
                .calls
                .run(self.store.list_children(&namespace, &name))
                .await?;
        }

        let key = record_key(example);
        let record = InstanceRecord {
            uid: owner.uid.clone(),
            workload: example.spec.name.clone(),
        };
        if self.calls.run(self.registry.lookup(&key)).await?.as_ref() != Some(&record) {
            debug!("Registering Example {name} as {key}");
            self.calls
                .run(self.registry.register(&key, &record))
                .await?;
        }

        Ok(observed)
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, example: &Example) -> Result<Action> {
        info!("Cleaning up Example {}", example.name_any());
        match finalizer::finalize(self, example).await {
            Ok(_) => Ok(Action::await_change()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                self.events
                    .publish(
                        example,
                        Event {
                            type_: EventType::Warning,
                            reason: "CleanupFailed".into(),
                            note: Some(err.to_string()),
                            action: "Deleting".into(),
                            secondary: None,
                        },
                    )
                    .await;

                let failed = status::project(
                    example,
                    None,
                    &Outcome::Failed {
                        reason: "CleanupFailed".into(),
                        message: err.to_string(),
                    },
                    &Time(Utc::now()),
                );
                if example.status.as_ref() != Some(&failed) {
                    if let Err(status_err) = self
                        .calls
                        .run(self.store.patch_status(example, &failed))
                        .await
                    {
                        debug!("Could not record the cleanup failure: {status_err}");
                    }
                }
                Err(err)
            }
        }
    }
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State, shutdown: CancellationToken) {
    let examples = Api::<Example>::all(client.clone());
    let deployments = Api::<Deployment>::all(client.clone());

    // all resources we create have this label
    let cfg = Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY}"));

    let deployment_watcher = watcher(deployments, cfg)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let (stop, stopped) = oneshot::channel::<()>();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        trigger.cancelled().await;
        let _ = stop.send(());
    });

    let concurrency = state.settings().concurrency;
    let ctx = Context::for_cluster(client, metrics, &state, shutdown);

    Controller::new(examples, Config::default())
        .owns_stream(deployment_watcher)
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(stopped.map(|_| ()))
        .run(
            reconcile::<KubeStore, KubeRegistry, KubeEvents>,
            error_policy::<KubeStore, KubeRegistry, KubeEvents>,
            ctx,
        )
        .for_each(|res| {
            if let Err(err) = res {
                debug!("Controller error: {err}");
            }
            futures::future::ready(())
        })
        .await;
    info!("Example controller stopped");
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<watcher::Event<K>, E>,
) -> Result<watcher::Event<K>, E> {
    if let Ok(watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    Some(hasher.finish())
}

trait ObservedStatus {
    type Status;

    fn observed_status(&self) -> Option<&Self::Status>;
}

impl ObservedStatus for Deployment {
    type Status = DeploymentStatus;

    fn observed_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

// readiness only shows up in status, which has no generation
fn status_predicate_serde<K: Resource + ObservedStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(key) = obj
        .observed_status()
        .and_then(|s| serde_hashkey::to_key(s).ok())
    {
        key.hash(&mut hasher);
    }
    Some(hasher.finish())
}
