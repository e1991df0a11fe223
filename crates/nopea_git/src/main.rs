//! Git operation sidecar for the nopea controller.
//!
//! Listens on a unix socket and answers length-prefixed JSON requests
//! (4-byte big-endian length, then the payload). One response frame per
//! request frame, `{"ok": …}` or `{"err": …}`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

mod git;
mod protocol;

use protocol::Request;

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

fn socket_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--socket" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    std::env::var("NOPEA_GIT_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/nopea/git.sock"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let socket = socket_path();
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    // A previous run may have left the socket file behind.
    let _ = std::fs::remove_file(&socket);

    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("binding {}", socket.display()))?;
    info!(socket = %socket.display(), "nopea-git listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    if let Err(e) = serve(stream).await {
                        warn!("connection closed: {e}");
                    }
                });
            }
            Err(e) => error!("accept failed: {e}"),
        }
    }
}

async fn serve(mut stream: UnixStream) -> std::io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            // Peer hung up between requests.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => dispatch(request).await,
            Err(e) => protocol::err(format!("malformed request: {e}")),
        };
        let payload = serde_json::to_vec(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_frame(&mut stream, &payload).await?;
    }
}

/// Run one request. git2 is blocking, so operations run on the blocking pool.
async fn dispatch(request: Request) -> Value {
    let result = tokio::task::spawn_blocking(move || match request {
        Request::Sync {
            url,
            branch,
            path,
            depth,
        } => {
            info!(%url, %branch, %path, "sync");
            git::sync(&url, &branch, &path, depth).map(protocol::ok_str)
        }
        Request::Files { path, subpath } => git::list_files(&path, subpath.as_deref())
            .map(|files| protocol::ok(files.into())),
        Request::Read { path, file } => git::read_file(&path, &file).map(protocol::ok_str),
        Request::Head { path } => git::head(&path).map(|details| protocol::ok_commit(&details)),
        Request::Checkout { path, sha } => {
            info!(%path, %sha, "checkout");
            git::checkout(&path, &sha).map(protocol::ok_str)
        }
        Request::LsRemote { url, branch } => git::ls_remote(&url, &branch).map(protocol::ok_str),
    })
    .await;

    match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => protocol::err(e),
        Err(e) => protocol::err(format!("operation panicked: {e}")),
    }
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}
