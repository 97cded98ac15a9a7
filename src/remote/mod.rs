//! Remote backend seams.
//!
//! The bridge core never talks to the SSH library directly. It goes through
//! the traits in this module, which the [`ssh`] backend implements on top of
//! `russh`/`russh-sftp`:
//!
//! ```text
//! Connector ──connect──▶ RemoteConnection ──open_shell──▶ RemoteShell
//!                                         └─open_fs─────▶ RemoteFs (one per call)
//! ```

mod agent;
pub mod credentials;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use crate::error::BridgeError;
use credentials::Credential;

/// Where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub address: String,
    pub port: u16,
    pub principal: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
}

impl ConnectionTarget {
    /// `user@host:port`, for log lines and error messages.
    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.principal, self.address, self.port)
    }
}

/// Pseudo-terminal parameters for a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// How a remote shell ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellExit {
    /// The remote process reported an exit status.
    Status(u32),
    /// The remote process was killed by a signal.
    Signal(String),
    /// The channel closed without reporting a status.
    Closed,
}

/// A live remote shell.
pub struct RemoteShell {
    /// Merged stdout and stderr.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Arc<dyn ShellInput>,
    /// Resolves once when the remote process exits.
    pub exit: oneshot::Receiver<ShellExit>,
}

/// Writer side of a remote shell.
#[async_trait]
pub trait ShellInput: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), BridgeError>;

    /// Best-effort window change; backends without PTY support may ignore it.
    async fn resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError>;
}

/// Metadata of a single remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: u64,
    pub is_dir: bool,
    /// Raw `st_mode` bits, including the file type.
    pub permissions: u32,
    /// Unix seconds.
    pub modified: i64,
}

/// One directory entry as returned by the remote, unsorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

/// A file-transfer client scoped to a single request.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn stat(&self, path: &str) -> Result<RemoteMetadata, BridgeError>;
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, BridgeError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, BridgeError>;
    /// Create or truncate `path` and write `content`.
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), BridgeError>;
    async fn remove(&self, path: &str) -> Result<(), BridgeError>;
    /// Release the remote handle. Called exactly once per opened client.
    async fn close(&self);
}

/// An authenticated remote connection.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn open_shell(&self, pty: &PtyRequest) -> Result<RemoteShell, BridgeError>;
    async fn open_fs(&self) -> Result<Box<dyn RemoteFs>, BridgeError>;
    /// Release the connection. The session guarantees a single call.
    async fn close(&self);
}

/// Opens remote connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Authenticate with the ordered `attempts`, stopping at the first
    /// accepted credential.
    async fn connect(
        &self,
        target: &ConnectionTarget,
        attempts: Vec<Credential>,
    ) -> Result<Arc<dyn RemoteConnection>, BridgeError>;
}

/// `ls -l` style permission string (`drwxr-xr-x`) from raw mode bits.
pub fn mode_string(mode: u32) -> String {
    const S_IFMT: u32 = 0o170_000;
    let kind = match mode & S_IFMT {
        0o040_000 => 'd',
        0o120_000 => 'L',
        0o020_000 => 'c',
        0o060_000 => 'D',
        0o010_000 => 'p',
        0o140_000 => 'S',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}
