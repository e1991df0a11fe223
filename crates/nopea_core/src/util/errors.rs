use std::fmt;

use thiserror::Error;

/// A parse failure for a single manifest file.
#[derive(Debug, Clone)]
pub struct FileError {
    pub file: String,
    pub reason: String,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.file, self.reason)
    }
}

/// An apply failure for a single manifest.
#[derive(Debug, Clone)]
pub struct ManifestError {
    pub resource: String,
    pub reason: String,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.reason)
    }
}

fn join_errors(errors: &[impl fmt::Display]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("GitSyncFailed: {0}")]
    GitSyncFailed(String),

    #[error("ListFilesFailed: {0}")]
    ListFilesFailed(String),

    #[error("ParseFailed: {}", join_errors(.0))]
    ParseFailed(Vec<FileError>),

    #[error("ApplyFailed: {}", join_errors(.0))]
    ApplyFailed(Vec<ManifestError>),

    #[error("InvalidResource: {0}")]
    InvalidResource(String),

    #[error("WatchDisconnected: {0}")]
    WatchDisconnected(String),

    #[error("LeaseConflict: lease held by {0}")]
    LeaseConflict(String),

    #[error("CollaboratorCrashed: {0}")]
    CollaboratorCrashed(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("InvalidCommitSha: {0}")]
    InvalidCommitSha(String),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("SerializationError: {0}")]
    SerializationError(String),
}

impl Error {
    /// Stable label for the failure counter, one per variant.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::GitSyncFailed(_) => "git_sync_failed",
            Error::ListFilesFailed(_) => "list_files_failed",
            Error::ParseFailed(_) => "parse_failed",
            Error::ApplyFailed(_) => "apply_failed",
            Error::InvalidResource(_) => "invalid_resource",
            Error::WatchDisconnected(_) => "watch_disconnected",
            Error::LeaseConflict(_) => "lease_conflict",
            Error::CollaboratorCrashed(_) => "collaborator_crashed",
            Error::NotFound(_) => "not_found",
            Error::InvalidCommitSha(_) => "invalid_commit_sha",
            Error::KubeError(_) => "kube_error",
            Error::SerializationError(_) => "serialization_error",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
