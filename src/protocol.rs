//! Duplex channel wire format.
//!
//! Every message in either direction is a single JSON envelope:
//!
//! ```json
//! {"type": "<discriminant>", "data": "<payload>"}
//! ```
//!
//! `data` is always a string. Structured payloads (`connect`, file requests,
//! `file_list`) are JSON documents encoded inside that string.
//!
//! ## Client → server
//!
//! | Type           | `data`                                   | Session kind |
//! |----------------|------------------------------------------|--------------|
//! | `connect`      | JSON [`ConnectRequest`]                  | both         |
//! | `disconnect`   | (empty)                                  | both         |
//! | `input`        | raw terminal input                       | shell        |
//! | `resize`       | `"<cols>,<rows>"`                        | shell        |
//! | `list`         | directory path                           | file         |
//! | `download`     | JSON [`PathRequest`]                     | file         |
//! | `read_file`    | JSON [`PathRequest`]                     | file         |
//! | `upload`       | JSON [`ContentRequest`] (base64 content) | file         |
//! | `write_file`   | JSON [`ContentRequest`] (raw content)    | file         |
//! | `create_file`  | JSON [`ContentRequest`] (raw content)    | file         |
//! | `delete_files` | JSON [`DeleteRequest`]                   | file         |
//!
//! ## Server → client
//!
//! `connected`, `output`, `session_closed`, `error`, `file_list`,
//! `file_content`, `upload_success`, `create_success`, `delete_success`,
//! `write_success`.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// The `{type, data}` unit exchanged over the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: String,
}

impl Envelope {
    pub fn new(kind: &str, data: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            data: data.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(outbound::ERROR, message)
    }

    /// Decode one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::protocol(format!("Invalid message: {e}")))
    }

    pub fn encode(&self) -> String {
        // A struct of two strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse `data` as a JSON payload of type `T`.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self, what: &str) -> Result<T, BridgeError> {
        serde_json::from_str(&self.data)
            .map_err(|e| BridgeError::protocol(format!("Invalid {what} request: {e}")))
    }
}

/// Inbound envelope types.
pub mod inbound {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const INPUT: &str = "input";
    pub const RESIZE: &str = "resize";
    pub const LIST: &str = "list";
    pub const DOWNLOAD: &str = "download";
    pub const READ_FILE: &str = "read_file";
    pub const UPLOAD: &str = "upload";
    pub const WRITE_FILE: &str = "write_file";
    pub const CREATE_FILE: &str = "create_file";
    pub const DELETE_FILES: &str = "delete_files";
}

/// Outbound envelope types.
pub mod outbound {
    pub const CONNECTED: &str = "connected";
    pub const OUTPUT: &str = "output";
    pub const SESSION_CLOSED: &str = "session_closed";
    pub const ERROR: &str = "error";
    pub const FILE_LIST: &str = "file_list";
    pub const FILE_CONTENT: &str = "file_content";
    pub const UPLOAD_SUCCESS: &str = "upload_success";
    pub const CREATE_SUCCESS: &str = "create_success";
    pub const DELETE_SUCCESS: &str = "delete_success";
    pub const WRITE_SUCCESS: &str = "write_success";
}

/// Payload of a `connect` envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    /// Inventory record to take address, port, and user from.
    pub host_id: Option<String>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

/// Payload of `download` and `read_file`.
#[derive(Debug, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

/// Payload of `upload`, `write_file`, and `create_file`.
#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

/// Payload of `delete_files`.
#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub paths: Vec<String>,
}

/// One entry of a `file_list` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListEntry {
    pub name: String,
    pub size: u64,
    /// `ls -l` style permission string, e.g. `drwxr-xr-x`.
    pub mode: String,
    /// Unix seconds.
    pub mod_time: i64,
    pub is_dir: bool,
}

/// Parse a `resize` payload of the form `"<cols>,<rows>"`.
pub fn parse_resize(data: &str) -> Result<(u32, u32), BridgeError> {
    let invalid = || BridgeError::protocol(format!("Invalid resize request: {data:?}"));
    let (cols, rows) = data.split_once(',').ok_or_else(invalid)?;
    let cols: u32 = cols.trim().parse().map_err(|_| invalid())?;
    let rows: u32 = rows.trim().parse().map_err(|_| invalid())?;
    if cols == 0 || rows == 0 {
        return Err(invalid());
    }
    Ok((cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_disconnect_without_data() {
        let env = Envelope::decode(r#"{"type":"disconnect"}"#).unwrap();
        assert_eq!(env.kind, "disconnect");
        assert_eq!(env.data, "");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = Envelope::decode("not json").unwrap_err();
        assert!(err.to_string().starts_with("Invalid message"));
        assert!(Envelope::decode(r#"{"data":"x"}"#).is_err());
    }

    #[test]
    fn test_encode_uses_type_field() {
        let text = Envelope::new(outbound::OUTPUT, "hi").encode();
        assert_eq!(text, r#"{"type":"output","data":"hi"}"#);
    }

    #[test]
    fn test_connect_request_camel_case() {
        let env = Envelope::new(
            inbound::CONNECT,
            r#"{"host":"10.0.0.2","port":2222,"username":"tim","keyPath":"/k"}"#,
        );
        let req: ConnectRequest = env.payload("connection").unwrap();
        assert_eq!(req.host, "10.0.0.2");
        assert_eq!(req.port, Some(2222));
        assert_eq!(req.key_path.as_deref(), Some("/k"));
        assert!(req.password.is_none());
    }

    #[test]
    fn test_payload_error_names_request() {
        let env = Envelope::new(inbound::DELETE_FILES, r#"{"paths": 3}"#);
        let err = env.payload::<DeleteRequest>("delete files").unwrap_err();
        assert!(err.to_string().starts_with("Invalid delete files request"));
    }

    #[test]
    fn test_parse_resize() {
        assert_eq!(parse_resize("120,40").unwrap(), (120, 40));
        assert_eq!(parse_resize(" 80 , 24 ").unwrap(), (80, 24));
        assert!(parse_resize("80x24").is_err());
        assert!(parse_resize("0,24").is_err());
        assert!(parse_resize("").is_err());
    }

    #[test]
    fn test_file_list_entry_field_names() {
        let entry = FileListEntry {
            name: "etc".into(),
            size: 4096,
            mode: "drwxr-xr-x".into(),
            mod_time: 1_700_000_000,
            is_dir: true,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["modTime"], 1_700_000_000);
        assert_eq!(v["isDir"], true);
    }
}
