use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Requests accepted by the Git collaborator, tagged by operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum GitRequest {
    /// Clone or fetch a repository; returns the HEAD SHA.
    Sync {
        url: String,
        branch: String,
        path: String,
        depth: u32,
    },

    /// List manifest files in a directory.
    Files {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subpath: Option<String>,
    },

    /// Read a file; content comes back base64-encoded.
    Read { path: String, file: String },

    /// HEAD commit info.
    Head { path: String },

    /// Hard reset to a specific commit SHA.
    Checkout { path: String, sha: String },

    /// Query the remote for a branch SHA without fetching.
    LsRemote { url: String, branch: String },
}

/// Wire envelope: `{"ok": value}` or `{"err": reason}`.
#[derive(Debug, Deserialize)]
pub struct GitResponse {
    #[serde(default)]
    pub ok: Option<Value>,
    #[serde(default)]
    pub err: Option<String>,
}

/// Commit metadata returned by `head`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub email: String,
    pub message: String,
    pub timestamp: i64,
}

/// Frames larger than this are treated as protocol corruption.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Write one length-prefixed frame: 4-byte big-endian length, then payload.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
