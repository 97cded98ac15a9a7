//! [`RemoteFs`] over an SFTP subsystem channel.
//!
//! Built on the request-level `RawSftpSession` so that directory listings
//! keep the server's READDIR batch order.

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::RawSftpSession;
use russh_sftp::protocol::{File, FileAttributes, OpenFlags, StatusCode};
use tracing::debug;

use super::{RemoteEntry, RemoteFs, RemoteMetadata};
use crate::error::BridgeError;

/// Bytes requested per READ. Servers may return less.
const READ_CHUNK: u32 = 64 * 1024;
/// Bytes sent per WRITE.
const WRITE_CHUNK: usize = 32 * 1024;

pub struct SftpFs {
    sftp: RawSftpSession,
}

impl SftpFs {
    /// Runs the SFTP version handshake on a fresh subsystem stream.
    pub async fn start(sftp: RawSftpSession) -> Result<Self, BridgeError> {
        sftp.init().await?;
        Ok(Self { sftp })
    }

    async fn release(&self, handle: &str) -> Result<(), SftpError> {
        self.sftp.close(handle).await.map(|_| ())
    }

    async fn read_handle(&self, handle: &str) -> Result<Vec<u8>, SftpError> {
        let mut content = Vec::new();
        let mut offset = 0u64;
        loop {
            match self.sftp.read(handle, offset, READ_CHUNK).await {
                Ok(chunk) if chunk.data.is_empty() => break,
                Ok(chunk) => {
                    offset += chunk.data.len() as u64;
                    content.extend_from_slice(&chunk.data);
                }
                Err(e) if is_eof(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(content)
    }

    async fn write_handle(&self, handle: &str, content: &[u8]) -> Result<(), SftpError> {
        let mut offset = 0u64;
        for chunk in content.chunks(WRITE_CHUNK) {
            self.sftp.write(handle, offset, chunk.to_vec()).await?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    async fn list_handle(&self, handle: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        let mut entries = Vec::new();
        loop {
            match self.sftp.readdir(handle).await {
                Ok(name) => append_batch(&mut entries, name.files),
                Err(e) if is_eof(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }
}

fn is_eof(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::Eof)
}

fn metadata(attrs: &FileAttributes) -> RemoteMetadata {
    RemoteMetadata {
        size: attrs.size.unwrap_or(0),
        is_dir: attrs.is_dir(),
        permissions: attrs.permissions.unwrap_or(0),
        modified: attrs.mtime.map_or(0, i64::from),
    }
}

/// Append one READDIR batch after the ones already received, minus `.` and `..`.
fn append_batch(entries: &mut Vec<RemoteEntry>, batch: Vec<File>) {
    entries.extend(
        batch
            .into_iter()
            .filter(|f| f.filename != "." && f.filename != "..")
            .map(|f| RemoteEntry {
                metadata: metadata(&f.attrs),
                name: f.filename,
            }),
    );
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn stat(&self, path: &str) -> Result<RemoteMetadata, BridgeError> {
        let attrs = self
            .sftp
            .stat(path)
            .await
            .map_err(|e| BridgeError::Remote(format!("Failed to stat {path}: {e}")))?;
        Ok(metadata(&attrs.attrs))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, BridgeError> {
        let failed = |e: SftpError| BridgeError::Remote(format!("Failed to read directory {path}: {e}"));
        let handle = self.sftp.opendir(path).await.map_err(failed)?.handle;
        let listed = self.list_handle(&handle).await;
        if let Err(e) = self.release(&handle).await {
            debug!("closedir {path}: {e}");
        }
        listed.map_err(failed)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BridgeError> {
        let failed = |e: SftpError| BridgeError::Remote(format!("Failed to read file {path}: {e}"));
        let handle = self
            .sftp
            .open(path, OpenFlags::READ, FileAttributes::default())
            .await
            .map_err(failed)?
            .handle;
        let content = self.read_handle(&handle).await;
        if let Err(e) = self.release(&handle).await {
            debug!("close {path}: {e}");
        }
        content.map_err(failed)
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), BridgeError> {
        let handle = self
            .sftp
            .open(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                FileAttributes::default(),
            )
            .await
            .map_err(|e| BridgeError::Remote(format!("Failed to create file {path}: {e}")))?
            .handle;
        let written = self.write_handle(&handle, content).await;
        let closed = self.release(&handle).await;
        written.map_err(|e| BridgeError::Remote(format!("Failed to write file {path}: {e}")))?;
        closed.map_err(|e| BridgeError::Remote(format!("Failed to close file {path}: {e}")))?;
        debug!("Wrote {} bytes to {path}", content.len());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BridgeError> {
        // The caller names the path in its own message.
        self.sftp.remove(path).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close_session() {
            debug!("SFTP close: {e}");
        }
    }
}
