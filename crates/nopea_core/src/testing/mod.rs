//! In-memory fakes for the collaborator seams, used by the test suites.
//!
//! [`FakeGit`] models remotes and checkouts as string maps; [`FakeK8s`]
//! models the API server closely enough for list/watch, server-side apply
//! echoes, status patches and lease optimistic concurrency.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::WatchEvent;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::api::v1::gitrepository::{GitRepository, GitRepositorySpec, GitRepositoryStatus};
use crate::events::{CloudEvent, EventSink};
use crate::gitops::protocol::CommitInfo;
use crate::gitops::{GitError, GitOps};
use crate::k8s::K8sOps;
use crate::model::{CommitSha, Manifest};
use crate::util::errors::{Error, Result};

/// A commit SHA made of one repeated character, handy in assertions.
pub fn sha(c: char) -> CommitSha {
    CommitSha::new(&c.to_string().repeat(40)).unwrap()
}

/// Minimal valid `GitRepository` resource.
pub fn git_repository(name: &str, namespace: &str, spec: GitRepositorySpec) -> GitRepository {
    GitRepository {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(1),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

#[derive(Clone, Default)]
struct TreeState {
    head: Option<CommitSha>,
    files: BTreeMap<String, String>,
}

/// In-memory Git collaborator.
#[derive(Default)]
pub struct FakeGit {
    remotes: Mutex<HashMap<String, TreeState>>,
    checkouts: Mutex<HashMap<PathBuf, TreeState>>,
    fail_sync: Mutex<Option<String>>,
    sync_calls: AtomicUsize,
}

impl FakeGit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the remote's tree and head; the next sync picks it up.
    pub fn set_remote(&self, url: &str, head: CommitSha, files: &[(&str, &str)]) {
        let mut remotes = self.remotes.lock().unwrap();
        remotes.insert(
            url.to_string(),
            TreeState {
                head: Some(head),
                files: files
                    .iter()
                    .map(|(path, content)| (path.to_string(), content.to_string()))
                    .collect(),
            },
        );
    }

    pub fn fail_next_sync(&self, reason: &str) {
        *self.fail_sync.lock().unwrap() = Some(reason.to_string());
    }

    pub fn sync_count(&self) -> usize {
        self.sync_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GitOps for FakeGit {
    async fn sync(&self, url: &str, _branch: &str, path: &Path, _depth: u32) -> Result<CommitSha, GitError> {
        self.sync_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = self.fail_sync.lock().unwrap().take() {
            return Err(GitError::Remote(reason));
        }
        let remote = self
            .remotes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| GitError::Remote(format!("repository '{url}' not found")))?;
        let head = remote
            .head
            .clone()
            .ok_or_else(|| GitError::Remote("remote has no commits".into()))?;
        self.checkouts
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), remote);
        Ok(head)
    }

    async fn files(&self, path: &Path, subpath: Option<&str>) -> Result<Vec<String>, GitError> {
        let checkouts = self.checkouts.lock().unwrap();
        let checkout = checkouts
            .get(path)
            .ok_or_else(|| GitError::Remote(format!("no checkout at {}", path.display())))?;
        let prefix = subpath.map(|s| format!("{s}/")).unwrap_or_default();
        let mut names: Vec<String> = checkout
            .files
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .filter(|name| !name.starts_with('.'))
            .filter(|name| name.ends_with(".yaml") || name.ends_with(".yml"))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn read(&self, path: &Path, file: &str) -> Result<Vec<u8>, GitError> {
        let checkouts = self.checkouts.lock().unwrap();
        let checkout = checkouts
            .get(path)
            .ok_or_else(|| GitError::Remote(format!("no checkout at {}", path.display())))?;
        checkout
            .files
            .get(file)
            .map(|content| content.as_bytes().to_vec())
            .ok_or_else(|| GitError::Remote(format!("file not found: {file}")))
    }

    async fn head(&self, path: &Path) -> Result<CommitInfo, GitError> {
        let checkouts = self.checkouts.lock().unwrap();
        let checkout = checkouts
            .get(path)
            .ok_or_else(|| GitError::Remote(format!("no checkout at {}", path.display())))?;
        let head = checkout
            .head
            .clone()
            .ok_or_else(|| GitError::Remote("empty checkout".into()))?;
        Ok(CommitInfo {
            sha: head.as_str().to_string(),
            author: "Fake Author".to_string(),
            email: "fake@example.com".to_string(),
            message: "fake commit".to_string(),
            timestamp: 1_700_000_000,
        })
    }

    async fn checkout(&self, path: &Path, sha: &CommitSha) -> Result<CommitSha, GitError> {
        let mut checkouts = self.checkouts.lock().unwrap();
        let checkout = checkouts
            .get_mut(path)
            .ok_or_else(|| GitError::Remote(format!("no checkout at {}", path.display())))?;
        checkout.head = Some(sha.clone());
        Ok(sha.clone())
    }

    async fn ls_remote(&self, url: &str, _branch: &str) -> Result<CommitSha, GitError> {
        self.remotes
            .lock()
            .unwrap()
            .get(url)
            .and_then(|remote| remote.head.clone())
            .ok_or_else(|| GitError::Remote(format!("repository '{url}' not found")))
    }
}

type WatchSender = mpsc::UnboundedSender<Result<WatchEvent<GitRepository>>>;

/// In-memory Kubernetes collaborator.
#[derive(Default)]
pub struct FakeK8s {
    repos: Mutex<HashMap<(String, String), GitRepository>>,
    statuses: Mutex<Vec<(String, GitRepositoryStatus)>>,
    live: Mutex<HashMap<(String, String, String), Manifest>>,
    applied: Mutex<Vec<Manifest>>,
    leases: Mutex<HashMap<(String, String), Lease>>,
    watchers: Mutex<Vec<WatchSender>>,
    resource_version: AtomicU64,
    fail_apply: Mutex<Option<String>>,
}

impl FakeK8s {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_repo(&self, repo: GitRepository) {
        let key = (repo.namespace().unwrap_or_default(), repo.name_any());
        self.repos.lock().unwrap().insert(key, repo);
    }

    pub fn delete_repo(&self, namespace: &str, name: &str) {
        self.repos
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Place an object into the fake cluster directly, bypassing apply.
    /// Models out-of-band (manual) changes.
    pub fn set_live(&self, manifest: Manifest) {
        let key = manifest.key();
        self.live.lock().unwrap().insert(
            (key.kind.clone(), key.namespace.clone(), key.name.clone()),
            manifest,
        );
    }

    pub fn delete_live(&self, kind: &str, namespace: &str, name: &str) {
        self.live.lock().unwrap().remove(&(
            kind.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
    }

    pub fn live_object(&self, kind: &str, namespace: &str, name: &str) -> Option<Manifest> {
        self.live
            .lock()
            .unwrap()
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn applied_log(&self) -> Vec<Manifest> {
        self.applied.lock().unwrap().clone()
    }

    pub fn apply_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn statuses(&self, name: &str) -> Vec<GitRepositoryStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn last_status(&self, name: &str) -> Option<GitRepositoryStatus> {
        self.statuses(name).pop()
    }

    pub fn fail_next_apply(&self, reason: &str) {
        *self.fail_apply.lock().unwrap() = Some(reason.to_string());
    }

    /// How many watch streams are currently open. Tests use this to wait
    /// for the controller before pushing events.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }

    fn broadcast(&self, make: impl Fn() -> WatchEvent<GitRepository>) {
        self.watchers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(Ok(make())).is_ok());
    }

    pub fn push_added(&self, repo: GitRepository) {
        self.put_repo(repo.clone());
        self.broadcast(|| WatchEvent::Added(repo.clone()));
    }

    pub fn push_modified(&self, repo: GitRepository) {
        self.put_repo(repo.clone());
        self.broadcast(|| WatchEvent::Modified(repo.clone()));
    }

    pub fn push_deleted(&self, repo: GitRepository) {
        let key = (repo.namespace().unwrap_or_default(), repo.name_any());
        self.repos.lock().unwrap().remove(&key);
        self.broadcast(|| WatchEvent::Deleted(repo.clone()));
    }

    fn next_rv(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[async_trait]
impl K8sOps for FakeK8s {
    async fn list_repos(&self, namespace: &str) -> Result<(Vec<GitRepository>, String)> {
        let repos = self
            .repos
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, repo)| repo.clone())
            .collect();
        Ok((repos, self.next_rv()))
    }

    async fn watch_repos(
        &self,
        _namespace: &str,
        _resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<GitRepository>>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Option<GitRepository>> {
        Ok(self
            .repos
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn update_status(&self, namespace: &str, name: &str, status: GitRepositoryStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((name.to_string(), status.clone()));
        if let Some(repo) = self
            .repos
            .lock()
            .unwrap()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            repo.status = Some(status);
        }
        Ok(())
    }

    async fn get_live(
        &self,
        _api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Manifest>> {
        Ok(self.live_object(kind, namespace, name))
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest> {
        if let Some(reason) = self.fail_apply.lock().unwrap().take() {
            return Err(Error::KubeError(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: reason,
                reason: "TestInjected".to_string(),
                code: 500,
            })));
        }
        let mut value: Value = manifest.as_value().clone();
        let metadata = value
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .expect("manifests carry metadata");
        metadata.insert("resourceVersion".to_string(), json!(self.next_rv()));
        metadata
            .entry("uid".to_string())
            .or_insert_with(|| json!("11111111-2222-3333-4444-555555555555"));
        metadata
            .entry("creationTimestamp".to_string())
            .or_insert_with(|| json!("2025-11-02T10:00:00Z"));

        let echo = Manifest::from_value(value).expect("apply echo keeps identity");
        self.set_live(echo.clone());
        self.applied.lock().unwrap().push(echo.clone());
        Ok(echo)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        Ok(self
            .leases
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_lease(&self, namespace: &str, name: &str, lease: &Lease) -> Result<Lease> {
        let mut leases = self.leases.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        if leases.contains_key(&key) {
            return Err(Error::LeaseConflict("lease already exists".to_string()));
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_rv());
        leases.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_lease(&self, namespace: &str, name: &str, lease: &Lease) -> Result<Lease> {
        let mut leases = self.leases.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = leases.get(&key) else {
            return Err(Error::NotFound(format!("lease {namespace}/{name}")));
        };
        if current.metadata.resource_version != lease.metadata.resource_version {
            let holder = current
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.clone())
                .unwrap_or_default();
            return Err(Error::LeaseConflict(holder));
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_rv());
        leases.insert(key, stored.clone());
        Ok(stored)
    }
}

/// Event sink that hands every event to a channel for assertions.
pub struct CollectingSink {
    tx: mpsc::UnboundedSender<CloudEvent>,
}

impl CollectingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CloudEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CollectingSink { tx }), rx)
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn deliver(&self, event: CloudEvent) {
        let _ = self.tx.send(event);
    }
}
