use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::CommitSha;

pub mod client;
pub mod protocol;

pub use client::GitClient;
pub use protocol::CommitInfo;

#[derive(Error, Debug)]
pub enum GitError {
    /// The collaborator ran the operation and reported a failure.
    #[error("{0}")]
    Remote(String),

    /// The collaborator process died or the connection broke.
    #[error("git collaborator unavailable: {0}")]
    Crashed(String),

    /// The collaborator answered something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Capability interface over the Git collaborator.
///
/// The production implementation is [`GitClient`], a serialized unix-socket
/// client for the `nopea_git` sidecar; tests use an in-memory fake.
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Clone if `path` has no checkout, else fetch and hard-reset to
    /// `origin/<branch>`. Returns the resulting HEAD SHA.
    async fn sync(&self, url: &str, branch: &str, path: &Path, depth: u32) -> Result<CommitSha, GitError>;

    /// Manifest files under `path` (+ optional `subpath`), sorted.
    async fn files(&self, path: &Path, subpath: Option<&str>) -> Result<Vec<String>, GitError>;

    /// Raw content of one file in the checkout.
    async fn read(&self, path: &Path, file: &str) -> Result<Vec<u8>, GitError>;

    /// HEAD commit metadata.
    async fn head(&self, path: &Path) -> Result<CommitInfo, GitError>;

    /// Hard reset the checkout to a commit.
    async fn checkout(&self, path: &Path, sha: &CommitSha) -> Result<CommitSha, GitError>;

    /// The remote's SHA for a branch, without fetching.
    async fn ls_remote(&self, url: &str, branch: &str) -> Result<CommitSha, GitError>;
}
