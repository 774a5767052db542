use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{Error, ErrorKind, Result};

/// What a candidate should do with the lease it just read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold it, keep it alive
    Renew,
    /// Free or expired, take it over
    Acquire,
    /// Someone else holds a live lease
    Standby,
}

pub fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(spec) = spec else {
        return LeaseDecision::Acquire;
    };
    match spec.holder_identity.as_deref() {
        Some(holder) if holder == identity => return LeaseDecision::Renew,
        None | Some("") => return LeaseDecision::Acquire,
        Some(_) => {}
    }
    let Some(MicroTime(renewed)) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return LeaseDecision::Acquire;
    };
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    if *renewed + duration < now {
        LeaseDecision::Acquire
    } else {
        LeaseDecision::Standby
    }
}

/// Keeps a coordination Lease for this replica and reports leadership on a watch channel.
pub struct LeaderElection {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_period: Duration,
}

impl LeaderElection {
    pub fn new(
        client: Client,
        namespace: &str,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
        lease_duration: Duration,
        renew_period: Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration,
            renew_period,
        }
    }

    /// Acquire and renew until `shutdown` fires, then release if held
    pub async fn run(self, leader: watch::Sender<bool>, shutdown: CancellationToken) {
        let mut last_renewed: Option<Instant> = None;
        loop {
            let is_leader = match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renewed = Some(Instant::now());
                    true
                }
                Ok(false) => false,
                Err(err) => {
                    warn!("Failed to renew lease {}: {err}", self.lease_name);
                    // keep leading only while our last renewal is still within the lease
                    last_renewed.is_some_and(|at| at.elapsed() < self.lease_duration)
                }
            };
            if !is_leader {
                last_renewed = None;
            }
            if leader.send_replace(is_leader) != is_leader {
                info!(identity = %self.identity, is_leader, "Leadership changed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.renew_period) => {}
            }
        }

        if *leader.borrow() {
            if let Err(err) = self.release().await {
                warn!("Failed to release lease {}: {err}", self.lease_name);
            }
            leader.send_replace(false);
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(self.acquired_spec(now, 0)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(err) => lost_race(err.into()),
            };
        };

        let spec = match decide(lease.spec.as_ref(), &self.identity, now) {
            LeaseDecision::Standby => return Ok(false),
            LeaseDecision::Renew => {
                let mut spec = lease.spec.take().unwrap_or_default();
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                spec
            }
            LeaseDecision::Acquire => {
                let transitions = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0);
                info!(identity = %self.identity, "Taking over lease {}", self.lease_name);
                self.acquired_spec(now, transitions.saturating_add(1))
            }
        };
        lease.spec = Some(spec);

        // the fetched resourceVersion guards against a concurrent takeover
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => lost_race(err.into()),
        }
    }

    async fn release(&self) -> Result<()> {
        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        if decide(lease.spec.as_ref(), &self.identity, Utc::now()) != LeaseDecision::Renew {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        self.api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        info!(identity = %self.identity, "Released lease {}", self.lease_name);
        Ok(())
    }

    fn acquired_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_seconds()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

// another replica wrote the lease between our read and write
fn lost_race(err: Error) -> Result<bool> {
    match err.kind() {
        ErrorKind::Conflict => Ok(false),
        _ => Err(err),
    }
}
