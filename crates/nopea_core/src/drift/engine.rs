use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::api::v1::{HealPolicy, SUSPEND_HEAL_ANNOTATION};
use crate::drift::normalize::{normalize, normalized_hash};
use crate::events::EventEmitter;
use crate::k8s::K8sOps;
use crate::model::{Manifest, RepositorySpec, ResourceKey};
use crate::store::StateStore;
use crate::util::errors::Result;
use crate::util::metrics::Metrics;

/// Outcome of comparing `last_applied`, `desired` and `live` for one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftKind {
    NoDrift,
    GitChange,
    ManualDrift,
    Conflict,
    NewResource,
    NeedsApply,
}

impl DriftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftKind::NoDrift => "no_drift",
            DriftKind::GitChange => "git_change",
            DriftKind::ManualDrift => "manual_drift",
            DriftKind::Conflict => "conflict",
            DriftKind::NewResource => "new_resource",
            DriftKind::NeedsApply => "needs_apply",
        }
    }
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Three-way comparison over normalized-manifest hashes.
pub fn three_way(last_applied: &Manifest, desired: &Manifest, live: &Manifest) -> DriftKind {
    let last = normalized_hash(last_applied);
    let git_matches = last == normalized_hash(desired);
    let live_matches = last == normalized_hash(live);
    match (git_matches, live_matches) {
        (true, true) => DriftKind::NoDrift,
        (false, true) => DriftKind::GitChange,
        (true, false) => DriftKind::ManualDrift,
        (false, false) => DriftKind::Conflict,
    }
}

/// Classification for a single desired manifest during a reconcile pass.
pub fn classify(
    last_applied: Option<&Manifest>,
    desired: &Manifest,
    live: Option<&Manifest>,
) -> DriftKind {
    match (last_applied, live) {
        (None, None) => DriftKind::NewResource,
        (None, Some(_)) => DriftKind::NeedsApply,
        (Some(last), None) => {
            // We applied it once and it is gone from the cluster.
            if normalized_hash(last) == normalized_hash(desired) {
                DriftKind::ManualDrift
            } else {
                DriftKind::Conflict
            }
        }
        (Some(last), Some(live)) => three_way(last, desired, live),
    }
}

/// What a reconcile pass did for one repository.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub healed: Vec<ResourceKey>,
    pub skipped: Vec<ResourceKey>,
    pub clean: usize,
}

/// Detects drift between Git, the store, and the live cluster, and heals it
/// according to the repository's heal policy.
pub struct DriftEngine {
    store: Arc<StateStore>,
    k8s: Arc<dyn K8sOps>,
    events: Arc<EventEmitter>,
    metrics: Metrics,
}

impl DriftEngine {
    pub fn new(
        store: Arc<StateStore>,
        k8s: Arc<dyn K8sOps>,
        events: Arc<EventEmitter>,
        metrics: Metrics,
    ) -> Self {
        DriftEngine {
            store,
            k8s,
            events,
            metrics,
        }
    }

    /// One drift-detection pass over the desired manifests. Does not touch
    /// Git; `desired` comes from the existing checkout.
    pub async fn reconcile(
        &self,
        spec: &RepositorySpec,
        desired: &[Manifest],
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        if spec.suspend {
            debug!(repo = %spec.name, "repository suspended, skipping reconcile");
            return Ok(outcome);
        }

        for manifest in desired {
            let mut manifest = manifest.clone();
            manifest.default_namespace(&spec.target_namespace);
            let key = manifest.key();

            let last_applied = self.store.get_last_applied(&spec.name, &key);
            let live = self
                .k8s
                .get_live(manifest.api_version(), manifest.kind(), &key.namespace, &key.name)
                .await?;

            let kind = classify(last_applied.as_ref(), &manifest, live.as_ref());
            if kind == DriftKind::NoDrift {
                self.store.clear_drift_first_seen(&spec.name, &key);
                outcome.clean += 1;
                continue;
            }

            self.metrics
                .drift_detected
                .with_label_values(&[spec.name.as_str(), kind.as_str()])
                .inc();

            let break_glass = live
                .as_ref()
                .and_then(|l| l.annotation(SUSPEND_HEAL_ANNOTATION))
                .map(|v| v == "true")
                .unwrap_or(false);

            let (heal, action) = self.arbitrate(spec, kind, break_glass, &key, now);

            if heal {
                info!(repo = %spec.name, resource = %key, drift = %kind, "healing drifted resource");
                self.k8s.apply(&manifest).await?;
                self.store
                    .put_last_applied(&spec.name, key.clone(), normalize(&manifest));
                self.store.clear_drift_first_seen(&spec.name, &key);
                self.metrics.heals.with_label_values(&[spec.name.as_str()]).inc();
                outcome.healed.push(key.clone());
            } else {
                debug!(repo = %spec.name, resource = %key, drift = %kind, action, "drift not healed");
                outcome.skipped.push(key.clone());
            }

            self.events.drifted(&spec.name, &key, kind, action);
        }

        Ok(outcome)
    }

    /// Decide whether a classified resource is re-applied now.
    fn arbitrate(
        &self,
        spec: &RepositorySpec,
        kind: DriftKind,
        break_glass: bool,
        key: &ResourceKey,
        now: DateTime<Utc>,
    ) -> (bool, &'static str) {
        match kind {
            DriftKind::NoDrift => (false, "skipped"),
            DriftKind::NewResource | DriftKind::NeedsApply => (true, "healed"),
            // Git is authoritative for intentional changes; only break-glass
            // can hold one back.
            DriftKind::GitChange => {
                if break_glass {
                    (false, "skipped")
                } else {
                    (true, "healed")
                }
            }
            DriftKind::ManualDrift | DriftKind::Conflict => {
                let first_seen = self.store.record_drift_first_seen(&spec.name, key, now);
                if break_glass {
                    return (false, "skipped");
                }
                match spec.heal_policy {
                    HealPolicy::Manual => (false, "skipped"),
                    HealPolicy::Notify => (false, "reported"),
                    HealPolicy::Auto => match spec.heal_grace_period {
                        None => (true, "healed"),
                        Some(grace) => {
                            let elapsed = (now - first_seen).to_std().unwrap_or_default();
                            if elapsed >= grace {
                                (true, "healed")
                            } else {
                                (false, "skipped")
                            }
                        }
                    },
                }
            }
        }
    }
}
