//! Credential resolution.
//!
//! [`CredentialResolver::resolve`] turns a [`ConnectionTarget`] into the
//! ordered list of authentication attempts handed to the connector:
//!
//! 1. the local SSH agent, when `SSH_AUTH_SOCK` points at an existing socket
//! 2. well-known key files from `ssh.key_dir`, in `ssh.key_names` order;
//!    unreadable, unparsable, or passphrase-protected files are skipped
//! 3. the explicit password
//! 4. the explicit key path, unless step 2 already loaded the same file
//!
//! An empty list fails fast with [`BridgeError::NoCredentials`] before any
//! network I/O happens.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::PrivateKey;
use tracing::debug;

use super::ConnectionTarget;
use crate::config::SshConfig;
use crate::error::BridgeError;
use crate::util::home_path;

/// One authentication attempt.
#[derive(Clone)]
pub enum Credential {
    /// Sign with keys held by the local agent.
    Agent,
    /// A decoded private key and the file it came from.
    Key { path: PathBuf, key: Arc<PrivateKey> },
    Password(String),
}

impl Credential {
    /// SSH method name, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Key { .. } => "publickey",
            Self::Password(_) => "password",
        }
    }
}

// Never print secrets.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => f.write_str("Agent"),
            Self::Key { path, .. } => f.debug_struct("Key").field("path", path).finish(),
            Self::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Builds credential attempt lists from configuration and the environment.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    agent_socket: Option<PathBuf>,
    key_dir: PathBuf,
    key_names: Vec<String>,
}

impl CredentialResolver {
    pub fn new(agent_socket: Option<PathBuf>, key_dir: PathBuf, key_names: Vec<String>) -> Self {
        Self {
            agent_socket,
            key_dir,
            key_names,
        }
    }

    /// Resolver for the running process: agent from `SSH_AUTH_SOCK` (when
    /// `use_agent` is set), keys from `key_dir`.
    pub fn from_config(config: &SshConfig) -> Self {
        let agent_socket = if config.use_agent {
            std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from)
        } else {
            None
        };
        Self::new(
            agent_socket,
            home_path(&config.key_dir),
            config.key_names.clone(),
        )
    }

    pub fn resolve(&self, target: &ConnectionTarget) -> Result<Vec<Credential>, BridgeError> {
        let mut attempts = Vec::new();

        if let Some(socket) = &self.agent_socket {
            if socket.exists() {
                attempts.push(Credential::Agent);
            } else {
                debug!("SSH agent socket {} not found, skipping", socket.display());
            }
        }

        for name in &self.key_names {
            let path = self.key_dir.join(name);
            if !path.is_file() {
                continue;
            }
            match russh::keys::load_secret_key(&path, None) {
                Ok(key) => attempts.push(Credential::Key {
                    path,
                    key: Arc::new(key),
                }),
                Err(e) => debug!("Skipping key {}: {e}", path.display()),
            }
        }

        if let Some(password) = target.password.as_deref().filter(|p| !p.is_empty()) {
            attempts.push(Credential::Password(password.to_string()));
        }

        if let Some(raw) = target.key_path.as_deref().filter(|p| !p.is_empty()) {
            let path = home_path(raw);
            if !already_loaded(&attempts, &path) {
                let key = russh::keys::load_secret_key(&path, None).map_err(|e| {
                    BridgeError::Credential(format!("Unable to load key {}: {e}", path.display()))
                })?;
                attempts.push(Credential::Key {
                    path,
                    key: Arc::new(key),
                });
            }
        }

        if attempts.is_empty() {
            return Err(BridgeError::NoCredentials(target.display()));
        }
        debug!(
            "Resolved {} credential attempt(s) for {}: {:?}",
            attempts.len(),
            target.display(),
            attempts.iter().map(Credential::method).collect::<Vec<_>>()
        );
        Ok(attempts)
    }
}

fn already_loaded(attempts: &[Credential], path: &Path) -> bool {
    let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    attempts.iter().any(|c| match c {
        Credential::Key { path: loaded, .. } => {
            loaded.canonicalize().unwrap_or_else(|_| loaded.clone()) == wanted
        }
        _ => false,
    })
}
