use std::future::Future;
use std::time::Duration;

use kube::runtime::events::{Event, Recorder};
use kube::{Client, Resource, ResourceExt};
use tracing::*;

use crate::resources::examples::Example;

/// Fire-and-forget notifications attached to an Example
pub trait EventSink: Send + Sync {
    /// Never fails; delivery problems are only logged
    fn publish(&self, example: &Example, event: Event) -> impl Future<Output = ()> + Send;
}

pub struct KubeEvents {
    recorder: Recorder,
    timeout: Duration,
}

impl KubeEvents {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            recorder: Recorder::new(client, "example-operator".into()),
            timeout,
        }
    }
}

impl EventSink for KubeEvents {
    async fn publish(&self, example: &Example, event: Event) {
        let reference = example.object_ref(&());
        match tokio::time::timeout(self.timeout, self.recorder.publish(&event, &reference)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                "Failed to publish {} event for Example {}: {err}",
                event.reason,
                example.name_any()
            ),
            Err(_) => warn!(
                "Timed out publishing {} event for Example {}",
                event.reason,
                example.name_any()
            ),
        }
    }
}
