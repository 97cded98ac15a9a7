//! One bridge session: state machine, remote handle, and the exclusive writer
//! for the client channel.
//!
//! ## States
//!
//! ```text
//! Idle ──connect──▶ Connecting ──ok──▶ Active
//!   │                   │                │
//!   └───────────────────┴──────┬─────────┘
//!                              ▼
//!                           Closing ──▶ Closed
//! ```
//!
//! `Idle → Closing` covers a client that goes away before connecting.
//! Every other edge not drawn is rejected by [`Session::transition`].
//!
//! ## Teardown
//!
//! [`Session::cleanup`] may be reached from several paths at once (client
//! disconnect, remote exit, channel failure, server shutdown). The remote
//! handle lives in an `Option` that is `take()`n under a lock, so exactly
//! one caller closes it; cancelling the token is itself idempotent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::protocol::{outbound, Envelope};
use crate::remote::{RemoteConnection, ShellInput};

/// Writer half of a client duplex channel.
#[async_trait]
pub trait EnvelopeSink: Send {
    async fn send(&mut self, envelope: Envelope) -> Result<(), BridgeError>;
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Shell,
    FileTransfer,
}

impl SessionKind {
    /// Prefix of generated session ids.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Shell => "ssh",
            Self::FileTransfer => "sftp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Active, Closed, Closing, Connecting, Idle};
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closing)
                | (Connecting, Active)
                | (Connecting, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Session {
    id: String,
    kind: SessionKind,
    state: Mutex<SessionState>,
    remote: Mutex<Option<Arc<dyn RemoteConnection>>>,
    shell_input: Mutex<Option<Arc<dyn ShellInput>>>,
    /// All client-bound writes go through this lock.
    writer: tokio::sync::Mutex<Box<dyn EnvelopeSink>>,
    cancel: CancellationToken,
    closed_notified: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: String, kind: SessionKind, sink: Box<dyn EnvelopeSink>) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(SessionState::Idle),
            remote: Mutex::new(None),
            shell_input: Mutex::new(None),
            writer: tokio::sync::Mutex::new(sink),
            cancel: CancellationToken::new(),
            closed_notified: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `next`, or fail without changing anything.
    pub fn transition(&self, next: SessionState) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(BridgeError::protocol(format!(
                "Invalid session transition {} -> {next}",
                *state
            )));
        }
        debug!("Session {}: {} -> {next}", self.id, *state);
        *state = next;
        Ok(())
    }

    /// Enter `Closing` unless teardown already started.
    pub fn begin_closing(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        debug!("Session {}: {} -> closing", self.id, *state);
        *state = SessionState::Closing;
    }

    /// Store the remote handle. Returns `false` (and stores nothing) once
    /// teardown has started; the caller then owns the close.
    pub fn attach_remote(&self, remote: Arc<dyn RemoteConnection>) -> bool {
        let mut slot = self.remote.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        *slot = Some(remote);
        true
    }

    pub fn remote(&self) -> Option<Arc<dyn RemoteConnection>> {
        self.remote.lock().clone()
    }

    pub fn set_shell_input(&self, input: Arc<dyn ShellInput>) {
        *self.shell_input.lock() = Some(input);
    }

    pub fn shell_input(&self) -> Option<Arc<dyn ShellInput>> {
        self.shell_input.lock().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write one envelope to the client.
    pub async fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        self.writer.lock().await.send(envelope).await
    }

    /// Send `session_closed` unless it was already sent.
    pub async fn notify_closed(&self, message: &str) -> Result<(), BridgeError> {
        if self.closed_notified.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(Envelope::new(outbound::SESSION_CLOSED, message))
            .await
    }

    /// Close the client channel.
    pub async fn close_channel(&self) {
        self.writer.lock().await.close().await;
    }

    /// Cancel background tasks and release the remote handle. Safe to call
    /// any number of times, concurrently.
    pub async fn cleanup(&self) {
        self.begin_closing();
        self.cancel.cancel();
        self.shell_input.lock().take();
        let remote = self.remote.lock().take();
        if let Some(remote) = remote {
            remote.close().await;
            info!("Session {}: remote connection released", self.id);
        }
        *self.state.lock() = SessionState::Closed;
    }
}
