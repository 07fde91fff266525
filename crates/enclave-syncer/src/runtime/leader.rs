//! Lease-based leader election.
//!
//! When the syncer runs with HA replicas, only the leader reconciles;
//! followers keep their informer caches warm so failover starts from a
//! populated state. The lease lives in the host namespace the syncer owns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use enclave_common::constants::FIELD_MANAGER;
use enclave_common::Error;

/// Leader election over a coordination.k8s.io Lease.
pub struct LeaderElection {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElection {
    /// Election over `lease_name` in the given host namespace. `identity`
    /// must be unique per replica (pod name).
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
        }
    }

    /// Block until this replica holds the lease or `cancel` fires.
    /// Returns `false` when cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<bool, Error> {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            match self.try_acquire().await {
                Ok(true) => {
                    info!(lease = %self.lease_name, identity = %self.identity, "became leader");
                    return Ok(true);
                }
                Ok(false) => {
                    debug!(lease = %self.lease_name, "lease held elsewhere, waiting");
                }
                Err(e) => {
                    warn!(error = %e, "lease acquisition attempt failed");
                }
            }

            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            let delay = Duration::from_secs_f64(self.retry_interval.as_secs_f64() * jitter);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Renew the lease until cancelled. Cancels `lost` when renewal fails
    /// past the lease duration, which stops every controller sharing that
    /// token; a follower will take over.
    pub async fn keep(&self, cancel: CancellationToken, lost: CancellationToken) {
        let mut last_renewed = Utc::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.renew_interval) => {}
            }

            match self.try_acquire().await {
                Ok(true) => {
                    last_renewed = Utc::now();
                }
                Ok(false) => {
                    warn!(lease = %self.lease_name, "lease taken by another replica");
                    lost.cancel();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal failed");
                    let deadline = last_renewed
                        + chrono::Duration::from_std(self.lease_duration)
                            .unwrap_or_else(|_| chrono::Duration::seconds(15));
                    if Utc::now() > deadline {
                        warn!(lease = %self.lease_name, "lease expired during renewal failures");
                        lost.cancel();
                        break;
                    }
                }
            }
        }

        // release on clean shutdown so failover does not wait out the lease
        if !lost.is_cancelled() {
            if let Err(e) = self.release().await {
                debug!(error = %e, "lease release failed");
            }
        }
    }

    /// One acquisition/renewal attempt. `Ok(false)` means another live
    /// holder owns the lease.
    async fn try_acquire(&self) -> Result<bool, Error> {
        let now = MicroTime(Utc::now());

        match self.api.get(&self.lease_name).await {
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let lease = self.fresh_lease(&now, 0);
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // lost the creation race
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
            Ok(current) => {
                let spec = current.spec.clone().unwrap_or_default();
                let held_by_us = spec.holder_identity.as_deref() == Some(&self.identity);

                if !held_by_us && !lease_expired(&spec, Utc::now()) {
                    return Ok(false);
                }

                let transitions = if held_by_us {
                    spec.lease_transitions.unwrap_or(0)
                } else {
                    spec.lease_transitions.unwrap_or(0) + 1
                };

                let mut lease = self.fresh_lease(&now, transitions);
                if held_by_us {
                    // keep the original acquisition timestamp across renewals
                    if let (Some(lease_spec), Some(acquired)) =
                        (lease.spec.as_mut(), spec.acquire_time)
                    {
                        lease_spec.acquire_time = Some(acquired);
                    }
                }
                lease.metadata.resource_version = current.metadata.resource_version;

                match self.api.replace(&self.lease_name, &PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // someone else moved first; let them have it
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn release(&self) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": null,
            }
        });
        self.api
            .patch(&self.lease_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        info!(lease = %self.lease_name, "lease released");
        Ok(())
    }

    fn fresh_lease(&self, now: &MicroTime, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

/// Whether a lease's last renewal is older than its advertised duration.
/// A lease without a renew time or holder is free for the taking.
fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    if spec.holder_identity.is_none() {
        return true;
    }
    let Some(renewed) = &spec.renew_time else {
        return true;
    };
    let duration = spec.lease_duration_seconds.unwrap_or(15) as i64;
    now - renewed.0 > chrono::Duration::seconds(duration)
}
