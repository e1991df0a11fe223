use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::HealPolicy;

/// Generate the Kubernetes wrapper struct `GitRepository` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "GitRepository", group = "nopea.io", version = "v1", namespaced)]
#[kube(status = "GitRepositoryStatus", shortname = "gitrepo")]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// Clone URL of the repository holding the manifests.
    pub url: String,
    /// Branch to track. Defaults to `main`.
    pub branch: Option<String>,
    /// Subdirectory within the repository containing the manifests.
    pub path: Option<String>,
    /// Namespace manifests are applied into. Defaults to the resource's own namespace.
    pub target_namespace: Option<String>,
    /// Poll interval, e.g. `30s`, `5m`, `1h`. Defaults to `5m`.
    pub interval: Option<String>,
    /// When true, the worker neither syncs nor heals.
    #[serde(default)]
    pub suspend: bool,
    pub heal_policy: Option<HealPolicy>,
    /// Grace window before manual drift is healed, e.g. `5m`. Absent = heal immediately.
    pub heal_grace_period: Option<String>,
}

/// The status object of `GitRepository`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryStatus {
    pub phase: Option<String>,
    pub last_synced_commit: Option<String>,
    pub last_sync_time: Option<String>,
    pub message: Option<String>,
    pub observed_generation: Option<i64>,
}
