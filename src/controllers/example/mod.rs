use std::time::Duration;

use crate::backoff::RetryPolicy;

use reconcilers::desired::WorkloadDefaults;

pub mod controller;
pub mod events;
pub mod reconcilers;
pub mod registry;
pub mod store;

#[cfg(test)]
mod fake;

pub use controller::run;

/// Tuning of the Example reconcile loop
#[derive(Clone, Debug)]
pub struct Settings {
    /// Maximum number of Examples reconciled at once
    pub concurrency: u16,
    /// Requeue interval once an Example is fully ready
    pub resync: Duration,
    /// Requeue interval while replicas are still coming up
    pub not_ready_requeue: Duration,
    /// Requeue interval after an error that needs a spec change
    pub permanent_error_requeue: Duration,
    /// Upper bound for every API server call
    pub api_timeout: Duration,
    pub retry: RetryPolicy,
    pub workload: WorkloadDefaults,
    /// Where the instance registry ConfigMap lives
    pub registry_namespace: String,
    pub registry_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            resync: Duration::from_secs(5 * 60),
            not_ready_requeue: Duration::from_secs(30),
            permanent_error_requeue: Duration::from_secs(10 * 60),
            api_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            workload: WorkloadDefaults::default(),
            registry_namespace: "default".into(),
            registry_name: "example-operator-registry".into(),
        }
    }
}
