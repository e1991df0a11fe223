use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::api::v1::Phase;
use crate::model::{CommitSha, Manifest, ResourceKey};

/// Summary of a repository's last successful sync.
#[derive(Clone, Debug)]
pub struct SyncState {
    pub commit: CommitSha,
    pub last_sync_at: DateTime<Utc>,
    pub phase: Phase,
}

/// Process-wide in-memory state shared by all workers.
///
/// Each worker only writes under its own repository key, so per-entry
/// atomicity is all the coordination needed. The store outlives workers;
/// nothing here survives a process restart, truth is recovered from Git and
/// the cluster.
#[derive(Default)]
pub struct StateStore {
    commits: DashMap<String, CommitSha>,
    last_applied: DashMap<(String, ResourceKey), Manifest>,
    drift_first_seen: DashMap<(String, ResourceKey), DateTime<Utc>>,
    sync_state: DashMap<String, SyncState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_commit(&self, repo: &str, sha: CommitSha) {
        self.commits.insert(repo.to_string(), sha);
    }

    pub fn get_commit(&self, repo: &str) -> Option<CommitSha> {
        self.commits.get(repo).map(|e| e.clone())
    }

    pub fn delete_commit(&self, repo: &str) {
        self.commits.remove(repo);
    }

    pub fn put_last_applied(&self, repo: &str, key: ResourceKey, manifest: Manifest) {
        self.last_applied.insert((repo.to_string(), key), manifest);
    }

    pub fn get_last_applied(&self, repo: &str, key: &ResourceKey) -> Option<Manifest> {
        self.last_applied
            .get(&(repo.to_string(), key.clone()))
            .map(|e| e.clone())
    }

    pub fn list_last_applied(&self, repo: &str) -> Vec<(ResourceKey, Manifest)> {
        self.last_applied
            .iter()
            .filter(|e| e.key().0 == repo)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect()
    }

    pub fn delete_last_applied(&self, repo: &str, key: &ResourceKey) {
        self.last_applied.remove(&(repo.to_string(), key.clone()));
    }

    pub fn clear_last_applied(&self, repo: &str) {
        self.last_applied.retain(|(r, _), _| r != repo);
    }

    /// First call inserts `now` and returns it; later calls return the
    /// stored instant unchanged.
    pub fn record_drift_first_seen(
        &self,
        repo: &str,
        key: &ResourceKey,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        *self
            .drift_first_seen
            .entry((repo.to_string(), key.clone()))
            .or_insert(now)
    }

    pub fn get_drift_first_seen(&self, repo: &str, key: &ResourceKey) -> Option<DateTime<Utc>> {
        self.drift_first_seen
            .get(&(repo.to_string(), key.clone()))
            .map(|e| *e)
    }

    pub fn clear_drift_first_seen(&self, repo: &str, key: &ResourceKey) {
        self.drift_first_seen.remove(&(repo.to_string(), key.clone()));
    }

    pub fn clear_all_drift_timestamps(&self, repo: &str) {
        self.drift_first_seen.retain(|(r, _), _| r != repo);
    }

    pub fn put_sync_state(&self, repo: &str, state: SyncState) {
        self.sync_state.insert(repo.to_string(), state);
    }

    pub fn get_sync_state(&self, repo: &str) -> Option<SyncState> {
        self.sync_state.get(repo).map(|e| e.clone())
    }

    /// Drop every entry for a repository. Called when the custom resource is
    /// deleted.
    pub fn remove_repo(&self, repo: &str) {
        self.delete_commit(repo);
        self.clear_last_applied(repo);
        self.clear_all_drift_timestamps(repo);
        self.sync_state.remove(repo);
    }
}
