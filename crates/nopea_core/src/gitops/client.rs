use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::gitops::protocol::{read_frame, write_frame, CommitInfo, GitRequest, GitResponse};
use crate::gitops::{GitError, GitOps};
use crate::model::CommitSha;

/// Upper bound for a single Git operation; also the graceful-stop budget.
pub const GIT_OP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

struct Request {
    request: GitRequest,
    reply: oneshot::Sender<Result<Value, GitError>>,
}

/// Serialized client for the `nopea_git` collaborator.
///
/// All requests flow through one task owning the unix-stream connection, so
/// exactly one operation is in flight at a time; callers queue behind it.
/// When a sidecar binary is configured the task also supervises the process:
/// an exit fails the in-flight request fast and the next request respawns it.
#[derive(Clone)]
pub struct GitClient {
    tx: mpsc::Sender<Request>,
}

impl GitClient {
    pub fn spawn(socket: PathBuf, sidecar_bin: Option<PathBuf>) -> GitClient {
        let (tx, rx) = mpsc::channel(64);
        let task = ClientTask {
            socket,
            sidecar_bin,
            conn: None,
            child: None,
        };
        tokio::spawn(task.run(rx));
        GitClient { tx }
    }

    async fn call(&self, request: GitRequest) -> Result<Value, GitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| GitError::Crashed("client task stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| GitError::Crashed("request dropped".into()))?
    }

    async fn call_for_sha(&self, request: GitRequest) -> Result<CommitSha, GitError> {
        let value = self.call(request).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| GitError::Protocol(format!("expected commit sha, got {value}")))?;
        CommitSha::new(raw).map_err(|e| GitError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl GitOps for GitClient {
    async fn sync(&self, url: &str, branch: &str, path: &Path, depth: u32) -> Result<CommitSha, GitError> {
        self.call_for_sha(GitRequest::Sync {
            url: url.to_string(),
            branch: branch.to_string(),
            path: path.to_string_lossy().into_owned(),
            depth,
        })
        .await
    }

    async fn files(&self, path: &Path, subpath: Option<&str>) -> Result<Vec<String>, GitError> {
        let value = self
            .call(GitRequest::Files {
                path: path.to_string_lossy().into_owned(),
                subpath: subpath.map(str::to_string),
            })
            .await?;
        serde_json::from_value(value).map_err(|e| GitError::Protocol(format!("bad file list: {e}")))
    }

    async fn read(&self, path: &Path, file: &str) -> Result<Vec<u8>, GitError> {
        let value = self
            .call(GitRequest::Read {
                path: path.to_string_lossy().into_owned(),
                file: file.to_string(),
            })
            .await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| GitError::Protocol(format!("expected base64 content, got {value}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| GitError::Protocol(format!("bad base64 content: {e}")))
    }

    async fn head(&self, path: &Path) -> Result<CommitInfo, GitError> {
        let value = self
            .call(GitRequest::Head {
                path: path.to_string_lossy().into_owned(),
            })
            .await?;
        serde_json::from_value(value).map_err(|e| GitError::Protocol(format!("bad commit info: {e}")))
    }

    async fn checkout(&self, path: &Path, sha: &CommitSha) -> Result<CommitSha, GitError> {
        self.call_for_sha(GitRequest::Checkout {
            path: path.to_string_lossy().into_owned(),
            sha: sha.as_str().to_string(),
        })
        .await
    }

    async fn ls_remote(&self, url: &str, branch: &str) -> Result<CommitSha, GitError> {
        self.call_for_sha(GitRequest::LsRemote {
            url: url.to_string(),
            branch: branch.to_string(),
        })
        .await
    }
}

struct ClientTask {
    socket: PathBuf,
    sidecar_bin: Option<PathBuf>,
    conn: Option<UnixStream>,
    child: Option<Child>,
}

impl ClientTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(cmd) = rx.recv().await {
            let result = match timeout(GIT_OP_TIMEOUT, self.roundtrip(&cmd.request)).await {
                Ok(result) => result,
                Err(_) => {
                    self.conn = None;
                    Err(GitError::Crashed("operation timed out".into()))
                }
            };
            let _ = cmd.reply.send(result);
        }
    }

    async fn roundtrip(&mut self, request: &GitRequest) -> Result<Value, GitError> {
        // One transparent reconnect: a broken stream usually means the
        // collaborator restarted underneath us.
        let mut last_err = None;
        for _ in 0..2 {
            self.ensure_connected().await?;
            match self.exchange(request).await {
                Ok(response) => return Self::unwrap_envelope(response),
                Err(e) => {
                    warn!("git collaborator connection failed: {e}");
                    self.conn = None;
                    last_err = Some(e);
                }
            }
        }
        Err(GitError::Crashed(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "connection lost".into()),
        ))
    }

    fn unwrap_envelope(response: GitResponse) -> Result<Value, GitError> {
        match (response.ok, response.err) {
            (Some(value), None) => Ok(value),
            (None, Some(err)) => Err(GitError::Remote(err)),
            _ => Err(GitError::Protocol("response carried neither ok nor err".into())),
        }
    }

    async fn exchange(&mut self, request: &GitRequest) -> std::io::Result<GitResponse> {
        let conn = self
            .conn
            .as_mut()
            .expect("ensure_connected leaves a live connection");
        let payload = serde_json::to_vec(request)?;
        write_frame(conn, &payload).await?;
        let frame = read_frame(conn).await?;
        serde_json::from_slice(&frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn ensure_connected(&mut self) -> Result<(), GitError> {
        self.ensure_sidecar().await?;
        if self.conn.is_some() {
            return Ok(());
        }
        for attempt in 1..=CONNECT_ATTEMPTS {
            match UnixStream::connect(&self.socket).await {
                Ok(stream) => {
                    self.conn = Some(stream);
                    return Ok(());
                }
                Err(e) if attempt == CONNECT_ATTEMPTS => {
                    return Err(GitError::Crashed(format!(
                        "cannot reach {}: {e}",
                        self.socket.display()
                    )));
                }
                Err(_) => sleep(CONNECT_BACKOFF).await,
            }
        }
        unreachable!("connect loop returns on final attempt");
    }

    /// Spawn or respawn the sidecar when one is configured.
    async fn ensure_sidecar(&mut self) -> Result<(), GitError> {
        let Some(bin) = self.sidecar_bin.clone() else {
            return Ok(());
        };
        let running = match self.child.as_mut() {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    warn!("git collaborator exited with {status}, restarting");
                    false
                }
                Err(e) => {
                    warn!("git collaborator status unknown ({e}), restarting");
                    false
                }
            },
        };
        if running {
            return Ok(());
        }
        self.conn = None;
        let child = ProcessCommand::new(&bin)
            .arg("--socket")
            .arg(&self.socket)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GitError::Crashed(format!("cannot start {}: {e}", bin.display())))?;
        info!(bin = %bin.display(), socket = %self.socket.display(), "started git collaborator");
        self.child = Some(child);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    async fn serve_one(listener: UnixListener, response: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let frame = read_frame(&mut stream).await.unwrap();
        let request: GitRequest = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(request, GitRequest::Sync { .. }));
        write_frame(&mut stream, response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn sync_round_trips_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("git.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let sha = "a".repeat(40);
        let server = tokio::spawn(async move {
            serve_one(listener, Box::leak(format!(r#"{{"ok":"{sha}"}}"#).into_boxed_str())).await;
        });

        let client = GitClient::spawn(socket, None);
        let got = client
            .sync("https://example/acme.git", "main", Path::new("/work/acme"), 1)
            .await
            .unwrap();
        assert_eq!(got.as_str(), "a".repeat(40));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("git.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            serve_one(listener, r#"{"err":"branch 'main' not found"}"#).await;
        });

        let client = GitClient::spawn(socket, None);
        let err = client
            .sync("https://example/acme.git", "main", Path::new("/work/acme"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Remote(msg) if msg.contains("not found")));
        server.await.unwrap();
    }
}
