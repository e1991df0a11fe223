use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::core::ObjectMeta;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::LeaseConfig;
use crate::k8s::K8sOps;
use crate::util::errors::Error;

/// Lease-based single-writer election.
///
/// Publishes leadership edges on a watch channel the controller subscribes
/// to; repeated same-state renewals are not re-published.
pub struct LeaderElection {
    k8s: Arc<dyn K8sOps>,
    config: LeaseConfig,
    identity: String,
}

impl LeaderElection {
    pub fn spawn(
        k8s: Arc<dyn K8sOps>,
        config: LeaseConfig,
        identity: String,
    ) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let election = LeaderElection {
            k8s,
            config,
            identity,
        };
        let join = tokio::spawn(election.run(tx));
        (rx, join)
    }

    async fn run(self, tx: watch::Sender<bool>) {
        let renew_deadline = Duration::from_secs(self.config.renew_deadline_seconds);
        let mut leader = false;
        loop {
            let holding = match timeout(renew_deadline, self.try_acquire(leader)).await {
                Ok(holding) => holding,
                Err(_) => {
                    warn!("lease renewal timed out");
                    false
                }
            };
            if holding != leader {
                leader = holding;
                info!(leader, identity = %self.identity, "leadership changed");
                if tx.send(leader).is_err() {
                    return;
                }
            }
            let delay = if leader {
                Duration::from_secs(self.config.lease_duration_seconds / 2)
            } else {
                Duration::from_secs(self.config.retry_period_seconds)
            };
            sleep(delay).await;
        }
    }

    /// One acquire/renew attempt. Any conflict or error means not-leader.
    async fn try_acquire(&self, currently_leader: bool) -> bool {
        let ns = &self.config.namespace;
        let name = &self.config.name;
        match self.k8s.get_lease(ns, name).await {
            Ok(None) => {
                let lease = self.fresh_lease();
                match self.k8s.create_lease(ns, name, &lease).await {
                    Ok(_) => true,
                    Err(Error::LeaseConflict(holder)) => {
                        info!(holder = %holder, "lease created concurrently elsewhere");
                        false
                    }
                    Err(e) => {
                        warn!("lease create failed: {e}");
                        false
                    }
                }
            }
            Ok(Some(mut lease)) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.clone().unwrap_or_default();
                if holder == self.identity {
                    self.write_renewal(&mut lease, false);
                    self.push_lease(&lease, "renew").await
                } else if self.lease_expired(&spec) {
                    info!(previous = %holder, "lease expired, taking over");
                    self.write_renewal(&mut lease, true);
                    self.push_lease(&lease, "takeover").await
                } else {
                    if currently_leader {
                        warn!(holder = %holder, "lease stolen by another holder");
                    }
                    false
                }
            }
            Err(e) => {
                warn!("lease read failed: {e}");
                false
            }
        }
    }

    fn fresh_lease(&self) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration_seconds as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        }
    }

    /// Update holder and times in place; a takeover also bumps the
    /// transition counter.
    fn write_renewal(&self, lease: &mut Lease, takeover: bool) {
        let now = MicroTime(Utc::now());
        let spec = lease.spec.get_or_insert_with(Default::default);
        if takeover {
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
            spec.acquire_time = Some(now.clone());
            spec.holder_identity = Some(self.identity.clone());
        }
        spec.lease_duration_seconds = Some(self.config.lease_duration_seconds as i32);
        spec.renew_time = Some(now);
    }

    async fn push_lease(&self, lease: &Lease, what: &str) -> bool {
        match self
            .k8s
            .update_lease(&self.config.namespace, &self.config.name, lease)
            .await
        {
            Ok(_) => true,
            Err(Error::LeaseConflict(holder)) => {
                warn!(holder = %holder, "lease {what} conflicted, stepping down");
                false
            }
            Err(e) => {
                warn!("lease {what} failed, stepping down: {e}");
                false
            }
        }
    }

    fn lease_expired(&self, spec: &LeaseSpec) -> bool {
        let Some(MicroTime(renewed)) = &spec.renew_time else {
            return true;
        };
        let duration = spec
            .lease_duration_seconds
            .map(|s| s as i64)
            .unwrap_or(self.config.lease_duration_seconds as i64);
        (Utc::now() - *renewed).num_seconds() > duration
    }
}
