//! Production backend on `russh`.
//!
//! [`SshConnector`] dials the target, tries each credential in order, and
//! wraps the authenticated handle in an [`SshConnection`]. A shell is driven
//! by one task that owns the russh `Channel`: it forwards input and resize
//! commands from an mpsc queue, copies `Data`/`ExtendedData` into an
//! in-memory pipe read by the output pump, and resolves the exit oneshot when
//! the channel closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Pty};
use russh_sftp::client::RawSftpSession;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::agent;
use super::credentials::Credential;
use super::sftp::SftpFs;
use super::{
    ConnectionTarget, Connector, PtyRequest, RemoteConnection, RemoteFs, RemoteShell, ShellExit,
    ShellInput,
};
use crate::config::SshConfig;
use crate::error::{BridgeError, ErrorClass};

/// Bytes buffered between the channel task and the output pump.
const OUTPUT_PIPE_BYTES: usize = 64 * 1024;

const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Decides whether to trust a server's host key.
pub trait HostKeyPolicy: Send + Sync {
    /// `fingerprint` is the SHA-256 fingerprint in OpenSSH notation.
    fn verify(&self, host: &str, port: u16, fingerprint: &str) -> bool;
}

/// Trusts every host key and logs its fingerprint.
pub struct AcceptAnyHostKey;

impl HostKeyPolicy for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, fingerprint: &str) -> bool {
        info!("Accepting host key for {host}:{port} ({fingerprint})");
        true
    }
}

/// russh callback handler.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: Arc<dyn HostKeyPolicy>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        Ok(self.policy.verify(&self.host, self.port, &fingerprint))
    }
}

pub struct SshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
    policy: Arc<dyn HostKeyPolicy>,
}

impl SshConnector {
    pub fn new(ssh: &SshConfig) -> Self {
        let keepalive = (ssh.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(ssh.keepalive_interval_secs));
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: keepalive,
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout: Duration::from_secs(ssh.connect_timeout_secs),
            policy: Arc::new(AcceptAnyHostKey),
        }
    }

    pub fn with_host_key_policy(mut self, policy: Arc<dyn HostKeyPolicy>) -> Self {
        self.policy = policy;
        self
    }
}

/// Try one credential. `Ok(false)` is a clean rejection.
async fn try_credential(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    credential: &Credential,
) -> Result<bool, BridgeError> {
    match credential {
        Credential::Agent => agent::authenticate(handle, user).await,
        Credential::Key { key, .. } => {
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            let result = handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::clone(key), hash))
                .await?;
            Ok(result.success())
        }
        Credential::Password(password) => Ok(handle
            .authenticate_password(user, password.as_str())
            .await?
            .success()),
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        attempts: Vec<Credential>,
    ) -> Result<Arc<dyn RemoteConnection>, BridgeError> {
        let label = target.display();
        if attempts.is_empty() {
            return Err(BridgeError::NoCredentials(label));
        }

        info!("Connecting to {label}");
        let handler = ClientHandler {
            host: target.address.clone(),
            port: target.port,
            policy: Arc::clone(&self.policy),
        };
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(
                Arc::clone(&self.config),
                (target.address.as_str(), target.port),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            BridgeError::Timeout(format!(
                "{label} did not respond within {}s",
                self.connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| BridgeError::Transport(format!("{label}: {e}")))?;

        let mut failures = Vec::new();
        for credential in &attempts {
            match try_credential(&mut handle, &target.principal, credential).await {
                Ok(true) => {
                    info!("Authenticated to {label} via {}", credential.method());
                    return Ok(Arc::new(SshConnection { handle, label }));
                }
                Ok(false) => {
                    debug!("{label}: {} rejected", credential.method());
                    failures.push(format!("{} rejected", credential.method()));
                }
                Err(e) if e.class() == ErrorClass::Transport => return Err(e),
                Err(e) => {
                    debug!("{label}: {} failed: {e}", credential.method());
                    failures.push(format!("{} failed: {e}", credential.method()));
                }
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "authentication failed", "en")
            .await;
        Err(BridgeError::AuthRejected(format!(
            "{label} refused all {} method(s) ({})",
            attempts.len(),
            failures.join("; ")
        )))
    }
}

/// An authenticated russh client handle.
pub struct SshConnection {
    handle: Handle<ClientHandler>,
    label: String,
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn open_shell(&self, pty: &PtyRequest) -> Result<RemoteShell, BridgeError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, PTY_MODES)
            .await?;
        channel.request_shell(false).await?;
        info!("Shell started on {} ({}x{})", self.label, pty.cols, pty.rows);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(256);
        let (mut pipe_tx, pipe_rx) = tokio::io::duplex(OUTPUT_PIPE_BYTES);
        let (exit_tx, exit_rx) = oneshot::channel();
        let label = self.label.clone();

        tokio::spawn(async move {
            let mut exit = ShellExit::Closed;
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                warn!("{label}: shell write failed: {e}");
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(cols, rows)) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                debug!("{label}: window change failed: {e}");
                            }
                        }
                        None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                            // Fails once the output pump has gone away.
                            if pipe_tx.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit = ShellExit::Status(exit_status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            exit = ShellExit::Signal(format!("{signal_name:?}"));
                        }
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            debug!("{label}: shell channel finished ({exit:?})");
            drop(pipe_tx);
            let _ = exit_tx.send(exit);
        });

        Ok(RemoteShell {
            output: Box::new(pipe_rx),
            input: Arc::new(SshShellInput { tx: cmd_tx }),
            exit: exit_rx,
        })
    }

    async fn open_fs(&self) -> Result<Box<dyn RemoteFs>, BridgeError> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpFs::start(RawSftpSession::new(channel.into_stream())).await?;
        Ok(Box::new(sftp))
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("{}: disconnect: {e}", self.label);
        }
        info!("Disconnected from {}", self.label);
    }
}

enum ShellCommand {
    Data(Vec<u8>),
    Resize(u32, u32),
}

struct SshShellInput {
    tx: mpsc::Sender<ShellCommand>,
}

#[async_trait]
impl ShellInput for SshShellInput {
    async fn write(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.tx
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| BridgeError::Disconnected("shell channel closed".into()))
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError> {
        self.tx
            .send(ShellCommand::Resize(cols, rows))
            .await
            .map_err(|_| BridgeError::Disconnected("shell channel closed".into()))
    }
}
