use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::{Event, EventType};

use crate::resources::examples::{Example, ExampleCondition, ExampleStatus, READY_CONDITION};
use crate::Error;

/// How the reconcile that produced a status ended
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Reconciled,
    InvalidSpec(String),
    Failed { reason: String, message: String },
}

impl Outcome {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::InvalidSpec(message) => Outcome::InvalidSpec(message.clone()),
            Error::NameConflict(_) => Outcome::Failed {
                reason: "NameConflict".into(),
                message: err.to_string(),
            },
            _ => Outcome::Failed {
                reason: "ReconcileFailed".into(),
                message: err.to_string(),
            },
        }
    }
}

/// Derive the status of `example` from its observed children and the reconcile outcome.
///
/// `observed` is `None` when the children could not be read; replica counts are then carried
/// over from the previous status. The stored status is the starting point, so projecting the
/// same inputs twice yields the same value.
pub fn project(
    example: &Example,
    observed: Option<&[Deployment]>,
    outcome: &Outcome,
    now: &Time,
) -> ExampleStatus {
    let mut status = example.status.clone().unwrap_or_default();

    if let Some(children) = observed {
        let (replicas, ready) = children
            .iter()
            .filter_map(|d| d.status.as_ref())
            .fold((0, 0), |(replicas, ready), s| {
                (
                    replicas + s.replicas.unwrap_or(0),
                    ready + s.ready_replicas.unwrap_or(0),
                )
            });
        status.replicas = Some(replicas);
        status.ready_replicas = Some(ready);
    }

    match outcome {
        Outcome::Reconciled => {
            status.observed_generation = example.metadata.generation;
            status.name = Some(example.spec.name.clone());
        }
        // nothing more can be learned from this generation until the spec changes
        Outcome::InvalidSpec(_) => status.observed_generation = example.metadata.generation,
        Outcome::Failed { .. } => {}
    }

    let ready = ready_condition(example, observed, outcome, status.ready_replicas);
    set_condition(status.conditions.get_or_insert_with(Vec::new), ready, now);
    status
}

fn ready_condition(
    example: &Example,
    observed: Option<&[Deployment]>,
    outcome: &Outcome,
    ready_replicas: Option<i32>,
) -> ExampleCondition {
    let (status, reason, message) = match outcome {
        Outcome::InvalidSpec(message) => ("False", "InvalidSpec".to_owned(), message.clone()),
        Outcome::Failed { reason, message } => ("False", reason.clone(), message.clone()),
        Outcome::Reconciled => {
            let size = example.spec.size;
            let ready = ready_replicas.unwrap_or(0);
            let children = observed.unwrap_or_default();
            if children.is_empty() || children.iter().any(|d| d.status.is_none()) {
                (
                    "Unknown",
                    "AwaitingObservation".to_owned(),
                    format!("Waiting for Deployment {} to report status", example.spec.name),
                )
            } else if !children.iter().all(|d| rolled_out(d, size)) {
                (
                    "False",
                    "RolloutInProgress".to_owned(),
                    format!("Deployment {} is rolling out", example.spec.name),
                )
            } else if ready >= size {
                (
                    "True",
                    "ReplicasReady".to_owned(),
                    format!("{ready}/{size} replicas ready"),
                )
            } else {
                (
                    "False",
                    "ReplicasNotReady".to_owned(),
                    format!("{ready}/{size} replicas ready"),
                )
            }
        }
    };

    ExampleCondition {
        last_transition_time: None,
        message: Some(message),
        reason: Some(reason),
        status: status.into(),
        r#type: READY_CONDITION.into(),
    }
}

// The status must describe the latest spec we wrote, with every replica on the new template
fn rolled_out(child: &Deployment, size: i32) -> bool {
    let Some(status) = child.status.as_ref() else {
        return false;
    };
    let current = match (child.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    };
    current && status.updated_replicas.unwrap_or(0) >= size
}

/// Insert or replace the condition of the same type.
///
/// The previous lastTransitionTime is kept unless the status value changed.
pub fn set_condition(conditions: &mut Vec<ExampleCondition>, mut new: ExampleCondition, now: &Time) {
    let existing = conditions.iter().find(|c| c.r#type == new.r#type);
    new.last_transition_time = match existing {
        Some(existing) if existing.status == new.status => existing
            .last_transition_time
            .clone()
            .or_else(|| Some(now.clone())),
        _ => Some(now.clone()),
    };

    conditions.retain(|c| c.r#type != new.r#type);
    conditions.push(new);
    conditions.sort_by(|a, b| a.r#type.cmp(&b.r#type));
}

/// Event announcing that the Ready condition changed status, if it did
pub fn transition_event(
    before: Option<&ExampleCondition>,
    after: Option<&ExampleCondition>,
) -> Option<Event> {
    let after = after?;
    if before.is_some_and(|b| b.status == after.status) {
        return None;
    }
    Some(Event {
        type_: if after.status == "False" {
            EventType::Warning
        } else {
            EventType::Normal
        },
        reason: after.reason.clone().unwrap_or_else(|| after.status.clone()),
        note: after.message.clone(),
        action: "Reconciling".into(),
        secondary: None,
    })
}
