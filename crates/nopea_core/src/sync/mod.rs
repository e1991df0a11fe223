use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::gitops::GitOps;
use crate::k8s::K8sOps;
use crate::model::{CommitSha, Manifest, RepositorySpec};
use crate::util::errors::{Error, FileError, ManifestError, Result};

/// Result of one full sync cycle.
#[derive(Debug)]
pub struct SyncOutcome {
    pub commit: CommitSha,
    /// Desired manifests as parsed from the checkout, namespaced.
    pub desired: Vec<Manifest>,
    /// Server echoes of the applied objects, with cluster-assigned defaults.
    pub applied: Vec<Manifest>,
    pub duration: Duration,
}

/// One sync cycle: git sync → list → read → parse → server-side apply.
///
/// Stateless; the only side effects are the Git work dir and the cluster.
/// The state store is the caller's concern.
pub struct SyncExecutor {
    git: Arc<dyn GitOps>,
    k8s: Arc<dyn K8sOps>,
}

impl SyncExecutor {
    pub fn new(git: Arc<dyn GitOps>, k8s: Arc<dyn K8sOps>) -> Self {
        SyncExecutor { git, k8s }
    }

    pub async fn run(&self, spec: &RepositorySpec, work_dir: &Path) -> Result<SyncOutcome> {
        let started = Instant::now();

        let commit = self
            .git
            .sync(&spec.url, &spec.branch, work_dir, 1)
            .await
            .map_err(|e| Error::GitSyncFailed(e.to_string()))?;

        let desired = self.desired_manifests(spec, work_dir).await?;
        let applied = self.apply_all(&desired).await?;

        debug!(repo = %spec.name, commit = %commit.short(), count = applied.len(), "sync applied");
        Ok(SyncOutcome {
            commit,
            desired,
            applied,
            duration: started.elapsed(),
        })
    }

    /// List, read and parse the manifests in the existing checkout. Does not
    /// touch the remote; reconcile passes reuse this directly.
    ///
    /// Parse errors are all-or-nothing: one broken file fails the whole set.
    pub async fn desired_manifests(
        &self,
        spec: &RepositorySpec,
        work_dir: &Path,
    ) -> Result<Vec<Manifest>> {
        let files = self
            .git
            .files(work_dir, spec.subpath.as_deref())
            .await
            .map_err(|e| Error::ListFilesFailed(e.to_string()))?;

        let mut manifests = Vec::new();
        let mut errors = Vec::new();
        for file in files {
            let rel = match &spec.subpath {
                Some(sub) => format!("{sub}/{file}"),
                None => file.clone(),
            };
            let bytes = match self.git.read(work_dir, &rel).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    errors.push(FileError {
                        file: file.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let content = match String::from_utf8(bytes) {
                Ok(content) => content,
                Err(e) => {
                    errors.push(FileError {
                        file: file.clone(),
                        reason: format!("not valid UTF-8: {e}"),
                    });
                    continue;
                }
            };
            let (mut parsed, parse_errors) = crate::model::manifest::parse_yaml_documents(&file, &content);
            errors.extend(parse_errors);
            manifests.append(&mut parsed);
        }

        if !errors.is_empty() {
            return Err(Error::ParseFailed(errors));
        }

        for manifest in &mut manifests {
            manifest.default_namespace(&spec.target_namespace);
        }
        Ok(manifests)
    }

    async fn apply_all(&self, manifests: &[Manifest]) -> Result<Vec<Manifest>> {
        let mut applied = Vec::with_capacity(manifests.len());
        let mut errors = Vec::new();
        for manifest in manifests {
            match self.k8s.apply(manifest).await {
                Ok(echo) => applied.push(echo),
                Err(e) => errors.push(ManifestError {
                    resource: manifest.key().to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        if !errors.is_empty() {
            return Err(Error::ApplyFailed(errors));
        }
        Ok(applied)
    }
}
