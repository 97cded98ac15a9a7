//! Shell bridge.
//!
//! Once a shell session is `Active`, two tasks run under the session's
//! cancellation token:
//!
//! - the **output pump** forwards remote output as `output` envelopes and
//!   stops at EOF, read error, or a broken client channel;
//! - the **exit watcher** waits for the remote process to end and is the
//!   only code that sends `session_closed`.
//!
//! Both write through [`Session::send`], so the client never sees
//! interleaved frames.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::protocol::{outbound, parse_resize, Envelope};
use crate::remote::{RemoteShell, ShellExit, ShellInput};
use crate::sessions::{Session, SessionState};

/// How long the exit watcher waits for buffered output to drain.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

fn active_input(session: &Session) -> Option<Arc<dyn ShellInput>> {
    if session.state() == SessionState::Active {
        session.shell_input()
    } else {
        None
    }
}

/// Write client keystrokes verbatim. Before the shell is up this is a
/// logged no-op.
pub(crate) async fn input(session: &Session, data: &str) -> Result<(), BridgeError> {
    let Some(input) = active_input(session) else {
        debug!(
            "Session {}: input while {}, dropped",
            session.id(),
            session.state()
        );
        return Ok(());
    };
    input.write(data.as_bytes()).await
}

pub(crate) async fn resize(session: &Session, data: &str) -> Result<(), BridgeError> {
    let (cols, rows) = parse_resize(data)?;
    let Some(input) = active_input(session) else {
        debug!(
            "Session {}: resize while {}, dropped",
            session.id(),
            session.state()
        );
        return Ok(());
    };
    if let Err(e) = input.resize(cols, rows).await {
        debug!("Session {}: resize to {cols}x{rows} failed: {e}", session.id());
    }
    Ok(())
}

/// Start the output pump and exit watcher for a freshly opened shell.
pub(crate) fn spawn(session: Arc<Session>, shell: RemoteShell, chunk_size: usize) {
    let RemoteShell { output, exit, .. } = shell;
    let pump = tokio::spawn(pump_output(Arc::clone(&session), output, chunk_size));
    tokio::spawn(watch_exit(session, exit, pump));
}

async fn pump_output(
    session: Arc<Session>,
    mut output: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
) {
    let token = session.cancel_token();
    let mut buf = vec![0u8; chunk_size.max(4)];
    // Bytes of a UTF-8 sequence split across reads.
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = tokio::select! {
            () = token.cancelled() => return,
            read = output.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Session {}: shell read error: {e}", session.id());
                    break;
                }
            },
        };
        pending.extend_from_slice(&buf[..n]);
        let ready = pending.len() - incomplete_tail(&pending);
        if ready == 0 {
            continue;
        }
        let text = String::from_utf8_lossy(&pending[..ready]).into_owned();
        pending.drain(..ready);
        if !forward(&session, text).await {
            return;
        }
    }

    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        forward(&session, text).await;
    }
    debug!("Session {}: output stream ended", session.id());
}

/// Returns `false` when the client channel is gone.
async fn forward(session: &Session, text: String) -> bool {
    match session.send(Envelope::new(outbound::OUTPUT, text)).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Session {}: dropping output: {e}", session.id());
            session.cancel();
            false
        }
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if need > back { back } else { 0 };
    }
    0
}

async fn watch_exit(
    session: Arc<Session>,
    exit: oneshot::Receiver<ShellExit>,
    pump: JoinHandle<()>,
) {
    let token = session.cancel_token();
    let status = tokio::select! {
        () = token.cancelled() => return,
        status = exit => status.unwrap_or(ShellExit::Closed),
    };
    match &status {
        ShellExit::Status(code) => info!("Session {}: shell exited with {code}", session.id()),
        ShellExit::Signal(sig) => info!("Session {}: shell killed by {sig}", session.id()),
        ShellExit::Closed => info!("Session {}: shell channel closed", session.id()),
    }

    if tokio::time::timeout(DRAIN_GRACE, pump).await.is_err() {
        debug!("Session {}: output still pending at exit", session.id());
    }
    if let Err(e) = session.notify_closed("SSH session terminated").await {
        warn!("Session {}: could not send session_closed: {e}", session.id());
    }
    session.begin_closing();
    session.cancel();
}
