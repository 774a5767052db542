use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::events::{Event, EventType};
use kube::ResourceExt;
use tracing::*;

use crate::controllers::example::controller::Context;
use crate::controllers::example::events::EventSink;
use crate::controllers::example::store::ResourceStore;
use crate::resources::examples::Example;
use crate::{Error, ErrorKind, Result};

use super::{is_owned_by, TEMPLATE_HASH_ANNOTATION};

/// Attempts per child before a run of write conflicts fails the reconcile
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// A single write against a managed Deployment
#[derive(Clone, Debug, PartialEq)]
pub enum ChildAction {
    /// Create the Deployment, already tagged with the owner reference
    Create(Deployment),
    /// Replace the Deployment; carries the observed resourceVersion
    Update(Deployment),
    Delete { namespace: String, name: String },
}

impl ChildAction {
    pub fn name(&self) -> String {
        match self {
            ChildAction::Create(child) | ChildAction::Update(child) => child.name_any(),
            ChildAction::Delete { name, .. } => name.clone(),
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            ChildAction::Create(_) => "create",
            ChildAction::Update(_) => "update",
            ChildAction::Delete { .. } => "delete",
        }
    }

    fn succeeded(&self) -> &'static str {
        match self {
            ChildAction::Create(_) => "Created",
            ChildAction::Update(_) => "Updated",
            ChildAction::Delete { .. } => "Deleted",
        }
    }

    fn failed(&self) -> &'static str {
        match self {
            ChildAction::Create(_) => "CreateFailed",
            ChildAction::Update(_) => "UpdateFailed",
            ChildAction::Delete { .. } => "DeleteFailed",
        }
    }
}

/// Compute the writes that turn `observed` into `desired`.
///
/// Only children owned by `owner` are ever updated or deleted; a desired name that is taken by
/// someone else's Deployment is a [`Error::NameConflict`]. The result is ordered by kind then
/// name, and every child here is a Deployment.
pub fn plan(
    owner: &OwnerReference,
    desired: &[Deployment],
    observed: &[Deployment],
) -> Result<Vec<ChildAction>> {
    let mut actions = Vec::new();

    for want in desired {
        let name = want.name_any();
        match observed.iter().find(|have| have.name_any() == name) {
            None => {
                let mut child = want.clone();
                child.metadata.owner_references = Some(vec![owner.clone()]);
                actions.push(ChildAction::Create(child));
            }
            Some(have) if !is_owned_by(&have.metadata, &owner.uid) => {
                return Err(Error::NameConflict(name));
            }
            Some(have) if drifted(want, have) => {
                actions.push(ChildAction::Update(updated(want, have)));
            }
            Some(_) => {}
        }
    }

    for have in observed {
        let name = have.name_any();
        if desired.iter().any(|want| want.name_any() == name) {
            continue;
        }
        if is_owned_by(&have.metadata, &owner.uid) {
            actions.push(ChildAction::Delete {
                namespace: have.namespace().unwrap_or_default(),
                name,
            });
        } else {
            debug!("Leaving Deployment {name} alone as it is not owned by this Example");
        }
    }

    actions.sort_by_key(|action| action.name());
    Ok(actions)
}

// Only fields we set are compared, so server defaulting never counts as a difference
fn drifted(want: &Deployment, have: &Deployment) -> bool {
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    if replicas(want) != replicas(have) {
        return true;
    }

    if want.annotations().get(TEMPLATE_HASH_ANNOTATION)
        != have.annotations().get(TEMPLATE_HASH_ANNOTATION)
    {
        return true;
    }

    let have_labels = have.labels();
    if want
        .labels()
        .iter()
        .any(|(k, v)| have_labels.get(k) != Some(v))
    {
        return true;
    }

    let template = |d: &Deployment| d.spec.as_ref().map(|s| s.template.clone());
    match (template(want), template(have)) {
        (Some(want), Some(have)) => template_drifted(&want, &have),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

// Someone editing the live template leaves our hash annotation alone, so look at the fields too
fn template_drifted(want: &PodTemplateSpec, have: &PodTemplateSpec) -> bool {
    let labels = |t: &PodTemplateSpec| t.metadata.as_ref().and_then(|m| m.labels.clone());
    let have_labels = labels(have).unwrap_or_default();
    if labels(want)
        .unwrap_or_default()
        .iter()
        .any(|(k, v)| have_labels.get(k) != Some(v))
    {
        return true;
    }

    let containers = |t: &PodTemplateSpec| t.spec.as_ref().map(|s| s.containers.clone());
    let have_containers = containers(have).unwrap_or_default();
    containers(want).unwrap_or_default().iter().any(|want| {
        let Some(have) = have_containers.iter().find(|c| c.name == want.name) else {
            return true;
        };
        // the server stores unset resources as an empty object
        want.image != have.image
            || want.resources.clone().unwrap_or_default()
                != have.resources.clone().unwrap_or_default()
    })
}

// Start from what the server has so that foreign labels, annotations and owners survive
fn updated(want: &Deployment, have: &Deployment) -> Deployment {
    let mut child = have.clone();
    child.status = None;
    child.metadata.managed_fields = None;
    child
        .labels_mut()
        .extend(want.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
    child
        .annotations_mut()
        .extend(want.annotations().iter().map(|(k, v)| (k.clone(), v.clone())));
    child.spec = want.spec.clone();
    child
}

/// Execute `actions` in order, stopping at the first failure.
///
/// A conflicting create or update re-reads that child and plans it again, up to
/// [`MAX_CONFLICT_ATTEMPTS`] times.
pub async fn apply<S: ResourceStore, R, E: EventSink>(
    ctx: &Context<S, R, E>,
    example: &Example,
    owner: &OwnerReference,
    desired: &[Deployment],
    actions: Vec<ChildAction>,
) -> Result<()> {
    for action in actions {
        if let Err(err) = apply_one(ctx, example, owner, desired, action.clone()).await {
            if !matches!(err, Error::Cancelled) {
                ctx.events
                    .publish(
                        example,
                        Event {
                            type_: EventType::Warning,
                            reason: action.failed().into(),
                            note: Some(err.to_string()),
                            action: "Reconciling".into(),
                            secondary: None,
                        },
                    )
                    .await;
            }
            return Err(err);
        }
    }
    Ok(())
}

async fn apply_one<S: ResourceStore, R, E: EventSink>(
    ctx: &Context<S, R, E>,
    example: &Example,
    owner: &OwnerReference,
    desired: &[Deployment],
    mut action: ChildAction,
) -> Result<()> {
    let name = action.name();
    let mut attempt = 1;
    loop {
        let err = match execute(ctx, example, &action).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.kind() != ErrorKind::Conflict || matches!(action, ChildAction::Delete { .. }) {
            return Err(err);
        }
        if attempt >= MAX_CONFLICT_ATTEMPTS {
            return Err(Error::ConflictRetriesExhausted {
                name,
                attempts: attempt,
            });
        }
        attempt += 1;
        ctx.metrics.conflict_retry();

        debug!("Deployment {name} changed underneath us, planning it again");
        let namespace = example.namespace().unwrap_or_default();
        let observed = ctx
            .calls
            .run(ctx.store.get_child(&namespace, &name))
            .await?;
        let want: Vec<Deployment> = desired
            .iter()
            .filter(|d| d.name_any() == name)
            .cloned()
            .collect();
        match plan(owner, &want, observed.as_slice())?.into_iter().next() {
            Some(next) => action = next,
            // someone else already made it look the way we want
            None => return Ok(()),
        }
    }
}

async fn execute<S: ResourceStore, R, E: EventSink>(
    ctx: &Context<S, R, E>,
    example: &Example,
    action: &ChildAction,
) -> Result<()> {
    ctx.metrics.child_action(action.verb());
    match action {
        ChildAction::Create(child) => {
            info!("Creating Deployment {}", child.name_any());
            ctx.calls.run(ctx.store.create_child(child)).await?;
        }
        ChildAction::Update(child) => {
            info!("Updating Deployment {}", child.name_any());
            ctx.calls.run(ctx.store.replace_child(child)).await?;
        }
        ChildAction::Delete { namespace, name } => {
            info!("Deleting Deployment {name}");
            match ctx.calls.run(ctx.store.delete_child(namespace, name)).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("Deployment {name} was already gone");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    ctx.events
        .publish(
            example,
            Event {
                type_: EventType::Normal,
                reason: action.succeeded().into(),
                note: Some(format!("{} Deployment {}", action.succeeded(), action.name())),
                action: "Reconciling".into(),
                secondary: None,
            },
        )
        .await;
    Ok(())
}
