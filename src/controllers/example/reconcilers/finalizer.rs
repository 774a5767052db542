use kube::runtime::events::{Event, EventType};
use kube::ResourceExt;
use tracing::*;

use crate::controllers::example::controller::Context;
use crate::controllers::example::events::EventSink;
use crate::controllers::example::registry::{record_key, InstanceRegistry};
use crate::controllers::example::store::ResourceStore;
use crate::resources::examples::{Example, EXAMPLE_FINALIZER};
use crate::{Error, ErrorKind, Result};

/// Add our finalizer token if it is missing.
///
/// Returns the updated Example when a write happened. The patch is guarded by the
/// resourceVersion, so a stale copy fails with a Conflict rather than dropping other tokens.
pub async fn ensure<S: ResourceStore, R, E>(
    ctx: &Context<S, R, E>,
    example: &Example,
) -> Result<Option<Example>> {
    if example.has_finalizer() {
        return Ok(None);
    }

    debug!("Adding finalizer to Example {}", example.name_any());
    let mut finalizers = example.finalizers().to_vec();
    finalizers.push(EXAMPLE_FINALIZER.into());
    let updated = ctx
        .calls
        .run(ctx.store.patch_finalizers(example, finalizers))
        .await?;
    Ok(Some(updated))
}

/// Clean up after a deleting Example and release it.
///
/// Resumable: the registry entry is only removed while it still names this Example's uid, and
/// a missing entry counts as already cleaned up. Returns `true` once our token is gone. On error
/// the token stays in place.
pub async fn finalize<S: ResourceStore, R: InstanceRegistry, E: EventSink>(
    ctx: &Context<S, R, E>,
    example: &Example,
) -> Result<bool> {
    if !example.has_finalizer() {
        return Ok(true);
    }

    let name = example.name_any();
    let uid = example
        .uid()
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let key = record_key(example);

    match ctx.calls.run(ctx.registry.lookup(&key)).await? {
        Some(record) if record.uid == uid => {
            ctx.calls.run(ctx.registry.deregister(&key)).await?;
            info!("Removed registry entry {key} for Example {name}");
        }
        Some(_) => debug!("Registry entry {key} belongs to a newer Example; leaving it"),
        None => debug!("Registry entry {key} already removed"),
    }

    let finalizers: Vec<String> = example
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != EXAMPLE_FINALIZER)
        .cloned()
        .collect();
    match ctx
        .calls
        .run(ctx.store.patch_finalizers(example, finalizers))
        .await
    {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("Example {name} disappeared while removing the finalizer");
            return Ok(true);
        }
        Err(err) => return Err(err),
    }

    ctx.events
        .publish(
            example,
            Event {
                type_: EventType::Normal,
                reason: "Finalized".into(),
                note: Some(format!("Cleaned up after Example {name}")),
                action: "Deleting".into(),
                secondary: None,
            },
        )
        .await;
    Ok(true)
}
