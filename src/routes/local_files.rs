//! File endpoints for the bridge host itself.
//!
//! - `POST /api/local-files` : list a directory
//! - `POST /api/read-file`   : read a file
//! - `POST /api/write-file`  : write a file (atomic)
//! - `POST /api/create-file` : create a file (atomic)
//! - `POST /api/delete-files`: delete files, stopping at the first failure
//!
//! ## Path validation
//!
//! All paths must be absolute and must not contain `..` components or null
//! bytes.
//!
//! ## Size limits
//!
//! Reads are capped at `files.max_transfer_bytes`. Non-UTF-8 files are
//! returned base64-encoded with `"encoding": "base64"`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use axum::{extract::State, http::StatusCode, Json};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::AppState;

/// Uniquifies temp file names across concurrent writes.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

type ApiError = (StatusCode, Json<Value>);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    pub path: String,
    /// Include dot-files (default `false`).
    #[serde(default)]
    pub show_hidden: bool,
}

#[derive(Deserialize)]
pub struct PathBody {
    pub path: String,
}

#[derive(Deserialize)]
pub struct ContentBody {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize)]
pub struct DeleteBody {
    pub paths: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Unix seconds.
    pub mod_time: i64,
}

fn error(status: StatusCode, message: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(json!({"error": message.into(), "code": code})),
    )
}

fn io_error(e: &std::io::Error, what: &str) -> ApiError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            error(StatusCode::NOT_FOUND, format!("{what} not found"), "FILE_NOT_FOUND")
        }
        std::io::ErrorKind::PermissionDenied => {
            error(StatusCode::FORBIDDEN, "Permission denied", "PERMISSION_DENIED")
        }
        _ => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "IO_ERROR"),
    }
}

/// Reject relative paths, `..` traversal, and null bytes.
fn validate_path(path: &str) -> Result<PathBuf, ApiError> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "Path must be absolute",
            "INVALID_PATH",
        ));
    }
    if path.contains('\0') {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "Path contains null bytes",
            "INVALID_PATH",
        ));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "Path traversal (..) not allowed",
            "INVALID_PATH",
        ));
    }
    Ok(p.to_path_buf())
}

fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_secs()).ok())
        .unwrap_or(0)
}

/// `POST /api/local-files`: entries in directory order.
pub async fn list(Json(req): Json<ListRequest>) -> Result<Json<Vec<LocalEntry>>, ApiError> {
    let path = validate_path(&req.path)?;
    let mut read_dir = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| io_error(&e, "Directory"))?;

    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| io_error(&e, "Directory"))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !req.show_hidden && name.starts_with('.') {
            continue;
        }
        // Entries that vanish or can't be stat'ed are skipped.
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        entries.push(LocalEntry {
            name,
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            mod_time: metadata.modified().map_or(0, unix_seconds),
        });
    }
    Ok(Json(entries))
}

/// `POST /api/read-file`: `{content}`, plus `encoding` for binary files.
pub async fn read(
    State(state): State<AppState>,
    Json(req): Json<PathBody>,
) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&req.path)?;
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| io_error(&e, "File"))?;
    if metadata.is_dir() {
        return Err(error(
            StatusCode::BAD_REQUEST,
            format!("Cannot read directory: {}", req.path),
            "IS_DIRECTORY",
        ));
    }
    let max = state.config.files.max_transfer_bytes;
    if metadata.len() > max {
        return Err(error(
            StatusCode::BAD_REQUEST,
            format!("File too large ({} bytes, max {max})", metadata.len()),
            "FILE_TOO_LARGE",
        ));
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| io_error(&e, "File"))?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Json(json!({"content": text}))),
        Err(e) => Ok(Json(json!({
            "content": BASE64.encode(e.as_bytes()),
            "encoding": "base64",
        }))),
    }
}

/// Temp file in the target directory, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ApiError> {
    let parent = path.parent().unwrap_or(Path::new("/"));
    let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".sshbridge_tmp_{}_{seq}", std::process::id()));

    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(|e| io_error(&e, "Directory"))?;
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to rename: {e}"),
            "IO_ERROR",
        ));
    }
    Ok(())
}

/// `POST /api/write-file`
pub async fn write(Json(req): Json<ContentBody>) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&req.path)?;
    write_atomic(&path, req.content.as_bytes()).await?;
    info!("Wrote {} ({} bytes)", req.path, req.content.len());
    Ok(Json(json!({"status": "success"})))
}

/// `POST /api/create-file`
pub async fn create(Json(req): Json<ContentBody>) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&req.path)?;
    write_atomic(&path, req.content.as_bytes()).await?;
    info!("Created {}", req.path);
    Ok(Json(json!({"status": "success"})))
}

/// `POST /api/delete-files`: the first failure aborts the batch.
pub async fn delete(Json(req): Json<DeleteBody>) -> Result<Json<Value>, ApiError> {
    let paths = req
        .paths
        .iter()
        .map(|p| validate_path(p.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    for (raw, path) in req.paths.iter().zip(&paths) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to delete {raw}: {e}");
            return Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to delete file: {raw}"),
                "DELETE_FAILED",
            ));
        }
    }
    info!("Deleted {} file(s)", paths.len());
    Ok(Json(json!({"status": "success"})))
}
