//! File-transfer operations.
//!
//! Every request opens its own [`RemoteFs`] client and closes it before the
//! reply goes out, whether the operation succeeded or not. Nothing about
//! open files survives between requests.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::protocol::{
    inbound, outbound, ContentRequest, DeleteRequest, Envelope, FileListEntry, PathRequest,
};
use crate::remote::{mode_string, RemoteFs};
use crate::sessions::{Session, SessionState};

/// A parsed file-transfer request.
#[derive(Debug)]
pub enum FileOp {
    List { path: String },
    Download { path: String },
    Read { path: String },
    Upload { path: String, content: Vec<u8> },
    Write { path: String, content: Vec<u8> },
    Create { path: String, content: Vec<u8> },
    Delete { paths: Vec<String> },
}

impl FileOp {
    pub fn handles(kind: &str) -> bool {
        matches!(
            kind,
            inbound::LIST
                | inbound::DOWNLOAD
                | inbound::READ_FILE
                | inbound::UPLOAD
                | inbound::WRITE_FILE
                | inbound::CREATE_FILE
                | inbound::DELETE_FILES
        )
    }

    pub fn parse(envelope: &Envelope) -> Result<Self, BridgeError> {
        let op = match envelope.kind.as_str() {
            inbound::LIST => Self::List {
                path: envelope.data.clone(),
            },
            inbound::DOWNLOAD => Self::Download {
                path: envelope.payload::<PathRequest>("download")?.path,
            },
            inbound::READ_FILE => Self::Read {
                path: envelope.payload::<PathRequest>("read file")?.path,
            },
            inbound::UPLOAD => {
                let req: ContentRequest = envelope.payload("upload")?;
                let content = BASE64
                    .decode(req.content.as_bytes())
                    .map_err(|_| BridgeError::protocol("Failed to decode file content"))?;
                Self::Upload {
                    path: req.path,
                    content,
                }
            }
            inbound::WRITE_FILE => {
                let req: ContentRequest = envelope.payload("write file")?;
                Self::Write {
                    path: req.path,
                    content: req.content.into_bytes(),
                }
            }
            inbound::CREATE_FILE => {
                let req: ContentRequest = envelope.payload("create file")?;
                Self::Create {
                    path: req.path,
                    content: req.content.into_bytes(),
                }
            }
            inbound::DELETE_FILES => Self::Delete {
                paths: envelope.payload::<DeleteRequest>("delete files")?.paths,
            },
            other => {
                return Err(BridgeError::protocol(format!(
                    "Unknown message type: {other}"
                )))
            }
        };
        Ok(op)
    }

    fn describe(&self) -> String {
        match self {
            Self::List { path } => format!("list {path}"),
            Self::Download { path } => format!("download {path}"),
            Self::Read { path } => format!("read {path}"),
            Self::Upload { path, content } => format!("upload {path} ({} bytes)", content.len()),
            Self::Write { path, content } => format!("write {path} ({} bytes)", content.len()),
            Self::Create { path, content } => format!("create {path} ({} bytes)", content.len()),
            Self::Delete { paths } => format!("delete {paths:?}"),
        }
    }

    async fn execute(self, fs: &dyn RemoteFs, max_bytes: u64) -> Result<Envelope, BridgeError> {
        match self {
            Self::List { path } => {
                let listing: Vec<FileListEntry> = fs
                    .read_dir(&path)
                    .await?
                    .into_iter()
                    .map(|entry| FileListEntry {
                        name: entry.name,
                        size: entry.metadata.size,
                        mode: mode_string(entry.metadata.permissions),
                        mod_time: entry.metadata.modified,
                        is_dir: entry.metadata.is_dir,
                    })
                    .collect();
                let json = serde_json::to_string(&listing)
                    .map_err(|e| BridgeError::Remote(format!("Failed to encode listing: {e}")))?;
                Ok(Envelope::new(outbound::FILE_LIST, json))
            }
            Self::Download { path } => fetch(fs, &path, "download", max_bytes).await,
            Self::Read { path } => fetch(fs, &path, "read", max_bytes).await,
            Self::Upload { path, content } => {
                fs.write(&path, &content).await?;
                Ok(Envelope::new(
                    outbound::UPLOAD_SUCCESS,
                    "File uploaded successfully",
                ))
            }
            Self::Write { path, content } => {
                fs.write(&path, &content).await?;
                Ok(Envelope::new(
                    outbound::WRITE_SUCCESS,
                    "File written successfully",
                ))
            }
            Self::Create { path, content } => {
                fs.write(&path, &content).await?;
                Ok(Envelope::new(
                    outbound::CREATE_SUCCESS,
                    "File created successfully",
                ))
            }
            Self::Delete { paths } => {
                // Stop at the first failure so the client knows exactly
                // which paths are gone.
                for path in &paths {
                    fs.remove(path).await.map_err(|e| {
                        rewrap(e, |e| format!("Failed to delete file {path}: {e}"))
                    })?;
                }
                Ok(Envelope::new(
                    outbound::DELETE_SUCCESS,
                    "Files deleted successfully",
                ))
            }
        }
    }
}

/// Replace the message of a per-request failure; connection-level failures
/// pass through so they still end the session.
fn rewrap(err: BridgeError, message: impl FnOnce(&BridgeError) -> String) -> BridgeError {
    if err.ends_session() {
        err
    } else {
        BridgeError::Remote(message(&err))
    }
}

#[allow(clippy::cast_precision_loss)]
fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

async fn fetch(
    fs: &dyn RemoteFs,
    path: &str,
    verb: &str,
    max_bytes: u64,
) -> Result<Envelope, BridgeError> {
    let meta = fs.stat(path).await.map_err(|e| {
        debug!("stat {path}: {e}");
        rewrap(e, |_| format!("File not found: {path}"))
    })?;
    if meta.is_dir {
        return Err(BridgeError::Policy(format!(
            "Cannot {verb} directory: {path}"
        )));
    }
    let too_large = |size: u64| {
        BridgeError::Policy(format!(
            "File too large: {path} ({:.1} MB)",
            megabytes(size)
        ))
    };
    if meta.size > max_bytes {
        return Err(too_large(meta.size));
    }
    let content = fs.read(path).await?;
    // The file may have grown since the stat.
    if content.len() as u64 > max_bytes {
        return Err(too_large(content.len() as u64));
    }
    Ok(Envelope::new(
        outbound::FILE_CONTENT,
        BASE64.encode(&content),
    ))
}

/// Run one file-transfer envelope against an `Active` session and send the
/// reply. The per-request client is closed before replying.
pub(crate) async fn run(
    session: &Session,
    envelope: &Envelope,
    max_bytes: u64,
) -> Result<(), BridgeError> {
    let remote = match (session.state(), session.remote()) {
        (SessionState::Active, Some(remote)) => remote,
        _ => return Err(BridgeError::protocol("SFTP not connected")),
    };
    let op = FileOp::parse(envelope)?;
    info!("Session {}: {}", session.id(), op.describe());

    let fs = remote.open_fs().await?;
    let result = op.execute(fs.as_ref(), max_bytes).await;
    fs.close().await;
    session.send(result?).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::bridge::tests::harness;
    use crate::bridge::Flow;
    use crate::sessions::SessionKind;

    const MIB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn test_requires_active_session() {
        let h = harness(SessionKind::FileTransfer).await;
        assert_eq!(h.send(inbound::LIST, "/").await, Flow::Continue);
        assert_eq!(h.sink.last().unwrap().data, "SFTP not connected");
        assert_eq!(h.conn.fs_opens.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_list_keeps_remote_order() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        h.conn.fs.add_file("/srv/zeta.txt", b"zz");
        h.conn.fs.add_dir("/srv/alpha");
        h.conn.fs.add_file("/srv/alpha/nested", b"n");
        h.conn.fs.add_file("/srv/mid.log", b"m");

        h.send(inbound::LIST, "/srv").await;
        let reply = h.sink.last().unwrap();
        assert_eq!(reply.kind, "file_list");
        let entries: Vec<FileListEntry> = serde_json::from_str(&reply.data).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zeta.txt", "alpha", "mid.log"]);
        assert_eq!(entries[0].mode, "-rw-r--r--");
        assert_eq!(entries[0].size, 2);
        assert!(entries[1].is_dir);
        assert_eq!(entries[1].mode, "drwxr-xr-x");
        assert_eq!(entries[2].mod_time, 1_700_000_000);
        assert_eq!(h.conn.fs.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_stops_at_first_failure() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        for p in ["/d/A", "/d/B", "/d/C"] {
            h.conn.fs.add_file(p, b"x");
        }
        h.conn.fs.fail_on("/d/B");

        let flow = h
            .send(inbound::DELETE_FILES, r#"{"paths":["/d/A","/d/B","/d/C"]}"#)
            .await;
        assert_eq!(flow, Flow::Continue);
        let err = h.sink.last().unwrap();
        assert_eq!(err.kind, "error");
        assert!(err.data.starts_with("Failed to delete file /d/B:"));
        assert_eq!(*h.conn.fs.removed.lock(), vec!["/d/A".to_string()]);
        assert!(!h.conn.fs.exists("/d/A"));
        assert!(h.conn.fs.exists("/d/C"));
        assert_eq!(h.conn.fs.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_delete_all() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        h.conn.fs.add_file("/d/A", b"x");
        h.conn.fs.add_file("/d/B", b"x");
        h.send(inbound::DELETE_FILES, r#"{"paths":["/d/A","/d/B"]}"#)
            .await;
        let reply = h.sink.last().unwrap();
        assert_eq!(reply.kind, "delete_success");
        assert_eq!(reply.data, "Files deleted successfully");
    }

    #[tokio::test]
    async fn test_download_over_limit_rejected() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        h.conn.fs.add_sized("/big.iso", 101 * MIB);

        h.send(inbound::DOWNLOAD, r#"{"path":"/big.iso"}"#).await;
        assert_eq!(h.sink.count("file_content"), 0);
        let err = h.sink.last().unwrap();
        assert_eq!(err.kind, "error");
        assert_eq!(err.data, "File too large: /big.iso (101.0 MB)");
        assert_eq!(h.conn.fs.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_download_under_limit_is_byte_identical() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        let size = usize::try_from(99 * MIB).unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        h.conn.fs.add_file("/data.bin", &data);
        drop(data);

        h.send(inbound::DOWNLOAD, r#"{"path":"/data.bin"}"#).await;
        let sent = h.sink.sent.lock();
        let reply = sent.iter().rev().find(|e| e.kind == "file_content").unwrap();
        let decoded = BASE64.decode(reply.data.as_bytes()).unwrap();
        assert_eq!(decoded.len(), size);
        assert!(decoded
            .iter()
            .enumerate()
            .all(|(i, b)| *b == (i % 251) as u8));
    }

    #[tokio::test]
    async fn test_directory_rejected() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        h.conn.fs.add_dir("/etc");
        h.send(inbound::DOWNLOAD, r#"{"path":"/etc"}"#).await;
        assert_eq!(h.sink.last().unwrap().data, "Cannot download directory: /etc");
        h.send(inbound::READ_FILE, r#"{"path":"/etc"}"#).await;
        assert_eq!(h.sink.last().unwrap().data, "Cannot read directory: /etc");
        h.send(inbound::READ_FILE, r#"{"path":"/missing"}"#).await;
        assert_eq!(h.sink.last().unwrap().data, "File not found: /missing");
        assert_eq!(h.conn.fs.closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_upload_write_create() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;

        let b64 = BASE64.encode(b"\x00\x01binary");
        h.send(
            inbound::UPLOAD,
            &format!(r#"{{"path":"/u.bin","content":"{b64}"}}"#),
        )
        .await;
        assert_eq!(h.sink.last().unwrap().kind, "upload_success");
        assert_eq!(h.conn.fs.contents("/u.bin").unwrap(), b"\x00\x01binary");

        h.send(inbound::WRITE_FILE, r#"{"path":"/w.txt","content":"one"}"#)
            .await;
        h.send(inbound::WRITE_FILE, r#"{"path":"/w.txt","content":"two"}"#)
            .await;
        assert_eq!(h.sink.last().unwrap().data, "File written successfully");
        assert_eq!(h.conn.fs.contents("/w.txt").unwrap(), b"two");

        h.send(inbound::CREATE_FILE, r#"{"path":"/c.txt"}"#).await;
        assert_eq!(h.sink.last().unwrap().kind, "create_success");
        assert_eq!(h.conn.fs.contents("/c.txt").unwrap(), b"");

        assert_eq!(h.conn.fs_opens.load(Ordering::SeqCst), 4);
        assert_eq!(h.conn.fs.closes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_bad_payloads() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        h.send(inbound::UPLOAD, r#"{"path":"/u","content":"%%%"}"#).await;
        assert_eq!(h.sink.last().unwrap().data, "Failed to decode file content");
        h.send(inbound::DOWNLOAD, "/plain/path").await;
        assert!(h
            .sink
            .last()
            .unwrap()
            .data
            .starts_with("Invalid download request"));
        assert_eq!(h.conn.fs_opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_session() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        h.conn.fs.fail_on("/ro/file");
        let flow = h
            .send(inbound::WRITE_FILE, r#"{"path":"/ro/file","content":"x"}"#)
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.sink.last().unwrap().kind, "error");
        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(h.conn.fs.closes.load(Ordering::SeqCst), 1);
    }
}
