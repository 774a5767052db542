use crate::{Error, ErrorKind};
use kube::ResourceExt;
use prometheus::core::Collector;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

const PREFIX: &str = "example_operator";

/// Operator metrics, cheap to clone and shared by every reconcile worker.
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    /// create, update and delete calls against managed Deployments
    pub child_actions: IntCounterVec,
    pub conflict_retries: IntCounter,
    /// requeues scheduled by the error policy, by error kind
    pub backoff_requeues: IntCounterVec,
}

fn name(metric: &str) -> String {
    format!("{PREFIX}_{metric}")
}

impl Default for Metrics {
    fn default() -> Self {
        // the names and labels are static, so construction only fails on a programming error
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                name("reconcile_duration_seconds"),
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(name("reconciliation_errors_total"), "reconciliation errors"),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let child_actions = IntCounterVec::new(
            opts!(
                name("child_actions_total"),
                "calls issued against managed Deployments"
            ),
            &["action"],
        )
        .unwrap();
        let backoff_requeues = IntCounterVec::new(
            opts!(
                name("backoff_requeues_total"),
                "reconciles requeued with backoff after an error"
            ),
            &["error_kind"],
        )
        .unwrap();
        Metrics {
            reconciliations: IntCounter::new(name("reconciliations_total"), "reconciliations")
                .unwrap(),
            failures,
            reconcile_duration,
            child_actions,
            conflict_retries: IntCounter::new(
                name("conflict_retries_total"),
                "writes planned again after a resourceVersion conflict",
            )
            .unwrap(),
            backoff_requeues,
        }
    }
}

impl Metrics {
    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.reconcile_duration.clone()),
            Box::new(self.failures.clone()),
            Box::new(self.reconciliations.clone()),
            Box::new(self.child_actions.clone()),
            Box::new(self.conflict_retries.clone()),
            Box::new(self.backoff_requeues.clone()),
        ]
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        for collector in self.collectors() {
            registry.register(collector)?;
        }
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, rc: &T, e: &Error) {
        self.failures
            .with_label_values(&[
                T::kind(&()).as_ref(),
                rc.name_any().as_ref(),
                e.metric_label(),
            ])
            .inc()
    }

    pub fn child_action(&self, action: &str) {
        self.child_actions.with_label_values(&[action]).inc()
    }

    pub fn conflict_retry(&self) {
        self.conflict_retries.inc()
    }

    pub fn backoff_requeue(&self, kind: ErrorKind) {
        let label = match kind {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        };
        self.backoff_requeues.with_label_values(&[label]).inc()
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Observes the reconcile duration for `T` when dropped
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
