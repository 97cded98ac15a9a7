//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SSHBRIDGE_API_KEY`, `SSHBRIDGE_LISTEN`,
//!    `PORT` (replaces only the port of the listen address)
//! 2. **Config file**: path via `--config <path>`, or `sshbridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8082"
//! max_sessions = 64
//! max_message_bytes = 201326592  # 192 MB
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [ssh]
//! connect_timeout_secs = 30
//! keepalive_interval_secs = 30
//! term = "xterm"
//! cols = 80
//! rows = 24
//! use_agent = true
//! key_dir = "~/.ssh"
//! key_names = ["id_ed25519", "id_rsa", "id_ecdsa", "id_dsa"]
//!
//! [files]
//! max_transfer_bytes = 104857600  # 100 MB
//! output_chunk_bytes = 1024
//!
//! [vault]
//! dir = "~/.sshbridge/vault"
//!
//! # Optional: omit to disable hostId lookups
//! [inventory]
//! hosts_file = "~/.sshbridge/hosts.yaml"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Failure to produce a usable [`Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid PORT value {0:?}")]
    Port(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    /// Optional host inventory for `hostId` connect requests.
    pub inventory: Option<InventoryConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8082`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent bridge sessions, shell and file combined (default 64).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Largest inbound WebSocket message in bytes (default 192 MB, so a
    /// base64-encoded upload at the transfer ceiling still fits).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared key for `?token=` and `Authorization: Bearer`. Override
    /// with `SSHBRIDGE_API_KEY`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Remote connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 0 disables keepalives.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Terminal type requested for shell PTYs.
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
    /// Offer keys held by the local agent (`SSH_AUTH_SOCK`) first.
    #[serde(default = "default_true")]
    pub use_agent: bool,
    /// Directory searched for well-known key files.
    #[serde(default = "default_key_dir")]
    pub key_dir: String,
    /// Well-known key file names, tried in order.
    #[serde(default = "default_key_names")]
    pub key_names: Vec<String>,
}

/// Remote file-transfer and shell output settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    /// Ceiling for `download`/`read_file` and local reads (default 100 MB).
    #[serde(default = "default_max_transfer_bytes")]
    pub max_transfer_bytes: u64,
    /// Shell output chunk size in bytes (default 1024).
    #[serde(default = "default_output_chunk_bytes")]
    pub output_chunk_bytes: usize,
}

/// Encrypted vault settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_dir")]
    pub dir: String,
}

/// Host inventory location.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    pub hosts_file: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8082".to_string()
}
fn default_max_sessions() -> usize {
    64
}
fn default_max_message_bytes() -> usize {
    192 * 1024 * 1024
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_term() -> String {
    "xterm".to_string()
}
fn default_cols() -> u32 {
    80
}
fn default_rows() -> u32 {
    24
}
fn default_true() -> bool {
    true
}
fn default_key_dir() -> String {
    "~/.ssh".to_string()
}
fn default_key_names() -> Vec<String> {
    ["id_ed25519", "id_rsa", "id_ecdsa", "id_dsa"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_max_transfer_bytes() -> u64 {
    100 * 1024 * 1024 // 100 MB
}
fn default_output_chunk_bytes() -> usize {
    1024
}
fn default_vault_dir() -> String {
    "~/.sshbridge/vault".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            use_agent: true,
            key_dir: default_key_dir(),
            key_names: default_key_names(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_transfer_bytes: default_max_transfer_bytes(),
            output_chunk_bytes: default_output_chunk_bytes(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            dir: default_vault_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `sshbridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("sshbridge.toml").exists() => Self::from_file("sshbridge.toml")?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment overrides, reading variables through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(key) = lookup("SSHBRIDGE_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = lookup("SSHBRIDGE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = port.parse().map_err(|_| ConfigError::Port(port.clone()))?;
            let host = self
                .server
                .listen
                .rsplit_once(':')
                .map_or("0.0.0.0", |(host, _)| host);
            self.server.listen = format!("{host}:{port}");
        }
        Ok(())
    }
}
