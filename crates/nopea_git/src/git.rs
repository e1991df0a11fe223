use std::path::Path;

use base64::Engine;
use git2::build::RepoBuilder;
use git2::{Cred, Direction, FetchOptions, Oid, RemoteCallbacks, Repository, ResetType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),
}

/// Metadata for the `head` operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommitDetails {
    pub sha: String,
    pub author: String,
    pub email: String,
    pub message: String,
    pub timestamp: i64,
}

/// SSH agent first, default credentials otherwise. Applies to every remote
/// operation.
fn auth_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|_url, username_from_url, _allowed| match username_from_url {
        Some(username) => Cred::ssh_key_from_agent(username),
        None => Cred::default(),
    });
    callbacks
}

fn head_sha(repo: &Repository) -> Result<String, GitError> {
    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.id().to_string())
}

fn hard_reset(repo: &Repository, oid: Oid) -> Result<(), GitError> {
    let commit = repo.find_commit(oid)?;
    repo.reset(commit.as_object(), ResetType::Hard, None)?;
    Ok(())
}

/// Clone when `path` holds no checkout, otherwise fetch the branch and hard
/// reset to its remote tip. Returns the resulting HEAD SHA.
pub fn sync(url: &str, branch: &str, path: &str, depth: u32) -> Result<String, GitError> {
    let workdir = Path::new(path);
    let repo = if workdir.join(".git").exists() {
        refresh(workdir, branch)?
    } else {
        clone(url, branch, workdir, depth)?
    };
    head_sha(&repo)
}

fn clone(url: &str, branch: &str, path: &Path, depth: u32) -> Result<Repository, GitError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(auth_callbacks());
    fetch.depth(depth as i32);
    let repo = RepoBuilder::new()
        .branch(branch)
        .fetch_options(fetch)
        .clone(url, path)?;
    Ok(repo)
}

fn refresh(path: &Path, branch: &str) -> Result<Repository, GitError> {
    let repo = Repository::open(path)?;
    {
        let mut remote = repo.find_remote("origin")?;
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(auth_callbacks());
        let refspec = format!("refs/heads/{branch}");
        remote.fetch(&[&refspec], Some(&mut fetch), None)?;
    }
    let tip = {
        let remote_ref = repo.find_reference(&format!("refs/remotes/origin/{branch}"))?;
        remote_ref.peel_to_commit()?.id()
    };
    hard_reset(&repo, tip)?;
    Ok(repo)
}

/// HEAD commit metadata for a checkout.
pub fn head(path: &str) -> Result<CommitDetails, GitError> {
    let repo = Repository::open(path)?;
    let commit = repo.head()?.peel_to_commit()?;
    let author = commit.author();
    Ok(CommitDetails {
        sha: commit.id().to_string(),
        author: author.name().unwrap_or_default().to_string(),
        email: author.email().unwrap_or_default().to_string(),
        message: commit.message().unwrap_or_default().to_string(),
        timestamp: commit.time().seconds(),
    })
}

/// Hard reset a checkout to a specific commit.
pub fn checkout(path: &str, sha: &str) -> Result<String, GitError> {
    let repo = Repository::open(path)?;
    hard_reset(&repo, Oid::from_str(sha)?)?;
    Ok(sha.to_string())
}

/// Ask the remote for a branch tip without fetching anything.
pub fn ls_remote(url: &str, branch: &str) -> Result<String, GitError> {
    let mut remote = git2::Remote::create_detached(url)?;
    remote.connect_auth(Direction::Fetch, Some(auth_callbacks()), None)?;
    let wanted = format!("refs/heads/{branch}");
    let found = remote
        .list()?
        .iter()
        .find(|head| head.name() == wanted)
        .map(|head| head.oid().to_string());
    found.ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
}

/// Non-hidden `*.yaml` / `*.yml` files directly under the directory, sorted.
pub fn list_files(path: &str, subpath: Option<&str>) -> Result<Vec<String>, GitError> {
    let base = Path::new(path);
    let dir = match subpath {
        Some(sub) => base.join(sub),
        None => base.to_path_buf(),
    };
    if !dir.is_dir() {
        return Err(GitError::FileNotFound(dir.display().to_string()));
    }

    let mut files: Vec<String> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .filter(|name| name.ends_with(".yaml") || name.ends_with(".yml"))
        .collect();
    files.sort();
    Ok(files)
}

/// File content, base64-encoded for the wire.
pub fn read_file(path: &str, file: &str) -> Result<String, GitError> {
    let full = Path::new(path).join(file);
    if !full.is_file() {
        return Err(GitError::FileNotFound(full.display().to_string()));
    }
    let content = std::fs::read(&full)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(content))
}
