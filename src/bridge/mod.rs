//! Protocol router.
//!
//! [`Bridge::handle_text`] takes one inbound text frame for a session,
//! dispatches it by envelope type and session state, and is the only place
//! where a [`BridgeError`] becomes a client-visible `error` envelope. The
//! returned [`Flow`] tells the channel loop whether to keep reading.
//!
//! Shell envelopes are handled in [`shell`], file-transfer envelopes in
//! [`files`]. `connect` and `disconnect` are common to both kinds.

pub mod files;
pub mod shell;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Config, FilesConfig, SshConfig};
use crate::error::BridgeError;
use crate::inventory::{AuthType, Host, Inventory};
use crate::protocol::{inbound, outbound, ConnectRequest, Envelope};
use crate::remote::credentials::CredentialResolver;
use crate::remote::{ConnectionTarget, Connector, PtyRequest};
use crate::sessions::{Session, SessionKind, SessionState};
use crate::util::{home_path, resolve_under};

/// What the channel loop does after an envelope was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Bridge {
    connector: Arc<dyn Connector>,
    resolver: CredentialResolver,
    inventory: Option<Inventory>,
    ssh: SshConfig,
    files: FilesConfig,
}

impl Bridge {
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        resolver: CredentialResolver,
        inventory: Option<Inventory>,
    ) -> Self {
        Self {
            connector,
            resolver,
            inventory,
            ssh: config.ssh.clone(),
            files: config.files.clone(),
        }
    }

    pub async fn handle_text(&self, session: &Arc<Session>, text: &str) -> Flow {
        let result = match Envelope::decode(text) {
            Ok(envelope) => self.dispatch(session, envelope).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(flow) => flow,
            Err(e) => report(session, &e).await,
        }
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        envelope: Envelope,
    ) -> Result<Flow, BridgeError> {
        debug!("Session {}: received {}", session.id(), envelope.kind);
        match (envelope.kind.as_str(), session.kind()) {
            (inbound::CONNECT, _) => {
                self.connect(session, &envelope).await?;
            }
            (inbound::DISCONNECT, _) => {
                info!("Session {}: client requested disconnect", session.id());
                session.begin_closing();
                return Ok(Flow::Close);
            }
            (inbound::INPUT, SessionKind::Shell) => shell::input(session, &envelope.data).await?,
            (inbound::RESIZE, SessionKind::Shell) => {
                shell::resize(session, &envelope.data).await?;
            }
            (kind, SessionKind::FileTransfer) if files::FileOp::handles(kind) => {
                files::run(session, &envelope, self.files.max_transfer_bytes).await?;
            }
            (other, _) => {
                return Err(BridgeError::protocol(format!(
                    "Unknown message type: {other}"
                )))
            }
        }
        Ok(Flow::Continue)
    }

    async fn connect(&self, session: &Arc<Session>, envelope: &Envelope) -> Result<(), BridgeError> {
        let state = session.state();
        if state != SessionState::Idle {
            return Err(BridgeError::protocol(format!(
                "Cannot connect: session is {state}"
            )));
        }
        let what = match session.kind() {
            SessionKind::Shell => "connection",
            SessionKind::FileTransfer => "SFTP connection",
        };
        let request: ConnectRequest = envelope.payload(what)?;
        let (target, pty) = self.target_for(request)?;

        session.transition(SessionState::Connecting)?;
        info!("Session {}: connecting to {}", session.id(), target.display());

        let attempts = self.resolver.resolve(&target)?;
        let remote = self.connector.connect(&target, attempts).await?;
        if !session.attach_remote(Arc::clone(&remote)) {
            remote.close().await;
            return Err(BridgeError::Disconnected(
                "session closed while connecting".into(),
            ));
        }

        match session.kind() {
            SessionKind::Shell => {
                let shell = remote.open_shell(&pty).await?;
                session.set_shell_input(Arc::clone(&shell.input));
                session.transition(SessionState::Active)?;
                session
                    .send(Envelope::new(
                        outbound::CONNECTED,
                        "SSH connection established",
                    ))
                    .await?;
                shell::spawn(
                    Arc::clone(session),
                    shell,
                    self.files.output_chunk_bytes,
                );
            }
            SessionKind::FileTransfer => {
                session.transition(SessionState::Active)?;
                session
                    .send(Envelope::new(
                        outbound::CONNECTED,
                        "SFTP connection established",
                    ))
                    .await?;
            }
        }
        info!("Session {}: connected to {}", session.id(), target.display());
        Ok(())
    }

    /// Merge the request with its inventory record (request fields win).
    fn target_for(
        &self,
        request: ConnectRequest,
    ) -> Result<(ConnectionTarget, PtyRequest), BridgeError> {
        let host = match request.host_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => Some(self.lookup_host(id)?),
            None => None,
        };

        let address = non_empty(request.host).or_else(|| host.as_ref().map(|h| h.address.clone()));
        let principal =
            non_empty(request.username).or_else(|| host.as_ref().map(|h| h.user.clone()));
        let (Some(address), Some(principal)) = (address, principal) else {
            return Err(BridgeError::protocol(
                "Invalid connection request: host and username are required",
            ));
        };
        let port = request
            .port
            .or_else(|| host.as_ref().map(|h| h.port))
            .unwrap_or(22);
        if port == 0 {
            return Err(BridgeError::protocol(
                "Invalid connection request: port must be between 1 and 65535",
            ));
        }
        let key_path = request
            .key_path
            .filter(|p| !p.is_empty())
            .or_else(|| host.as_ref().and_then(|h| self.inventory_key(h)));

        let pty = PtyRequest {
            term: self.ssh.term.clone(),
            cols: request.cols.filter(|c| *c > 0).unwrap_or(self.ssh.cols),
            rows: request.rows.filter(|r| *r > 0).unwrap_or(self.ssh.rows),
        };
        let target = ConnectionTarget {
            address,
            port,
            principal,
            password: request.password,
            key_path,
        };
        Ok((target, pty))
    }

    fn lookup_host(&self, id: &str) -> Result<Host, BridgeError> {
        let inventory = self
            .inventory
            .as_ref()
            .ok_or_else(|| BridgeError::protocol("Host inventory is not configured"))?;
        inventory
            .get(id)
            .ok_or_else(|| BridgeError::protocol(format!("Unknown host: {id}")))
    }

    fn inventory_key(&self, host: &Host) -> Option<String> {
        if host.auth.kind != AuthType::Key {
            return None;
        }
        let key_id = host.auth.key_id.as_deref()?;
        let key_dir = home_path(&self.ssh.key_dir);
        Some(resolve_under(&key_dir, key_id).display().to_string())
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Send `err` to the client and decide whether the session survives it.
/// A failure while `Connecting` always ends the session.
async fn report(session: &Session, err: &BridgeError) -> Flow {
    let close = err.ends_session() || session.state() == SessionState::Connecting;
    if close {
        warn!("Session {}: {err}", session.id());
    } else {
        debug!("Session {}: {err}", session.id());
    }
    if let Err(send_err) = session.send(Envelope::error(err.to_string())).await {
        warn!(
            "Session {}: could not deliver error to client: {send_err}",
            session.id()
        );
        session.begin_closing();
        return Flow::Close;
    }
    if close {
        session.begin_closing();
        Flow::Close
    } else {
        Flow::Continue
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::remote::mock::{MockConnection, MockConnector};
    use crate::sessions::session::tests::RecordingSink;
    use crate::sessions::SessionRegistry;

    pub(crate) struct Harness {
        pub bridge: Bridge,
        pub conn: Arc<MockConnection>,
        pub connector: Arc<MockConnector>,
        pub session: Arc<Session>,
        pub sink: RecordingSink,
    }

    pub(crate) fn resolver() -> CredentialResolver {
        CredentialResolver::new(None, "/nonexistent".into(), Vec::new())
    }

    pub(crate) async fn harness(kind: SessionKind) -> Harness {
        harness_with(kind, None).await
    }

    pub(crate) async fn harness_with(kind: SessionKind, inventory: Option<Inventory>) -> Harness {
        let conn = MockConnection::new();
        let connector = MockConnector::new(Arc::clone(&conn));
        let bridge = Bridge::new(
            &Config::default(),
            connector.clone(),
            resolver(),
            inventory,
        );
        let sink = RecordingSink::default();
        let registry = SessionRegistry::new(8);
        let session = registry
            .create(kind, Box::new(sink.clone()))
            .await
            .ok()
            .unwrap();
        Harness {
            bridge,
            conn,
            connector,
            session,
            sink,
        }
    }

    pub(crate) fn frame(kind: &str, data: &str) -> String {
        Envelope::new(kind, data).encode()
    }

    pub(crate) const CONNECT: &str =
        r#"{"host":"10.0.0.5","port":22,"username":"tim","password":"pw"}"#;

    impl Harness {
        pub async fn send(&self, kind: &str, data: &str) -> Flow {
            self.bridge
                .handle_text(&self.session, &frame(kind, data))
                .await
        }

        pub async fn connect(&self) {
            assert_eq!(self.send(inbound::CONNECT, CONNECT).await, Flow::Continue);
            assert_eq!(self.session.state(), SessionState::Active);
        }
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_session() {
        let h = harness(SessionKind::Shell).await;
        assert_eq!(h.send("bogus", "").await, Flow::Continue);
        assert_eq!(h.sink.kinds(), vec!["error"]);
        assert_eq!(h.sink.sent.lock()[0].data, "Unknown message type: bogus");
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_error() {
        let h = harness(SessionKind::FileTransfer).await;
        let flow = h.bridge.handle_text(&h.session, "{{{").await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.sink.kinds(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_file_types_on_shell_session_are_unknown() {
        let h = harness(SessionKind::Shell).await;
        h.send(inbound::LIST, "/tmp").await;
        assert!(h.sink.last().unwrap().data.starts_with("Unknown message type"));
    }

    #[tokio::test]
    async fn test_sftp_connect() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        let sent = h.sink.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "connected");
        assert_eq!(sent[0].data, "SFTP connection established");
        let target = h.connector.targets.lock()[0].clone();
        assert_eq!(target.display(), "tim@10.0.0.5:22");
        assert_eq!(*h.connector.methods.lock(), vec!["password"]);
    }

    #[tokio::test]
    async fn test_malformed_connect_stays_idle() {
        let h = harness(SessionKind::Shell).await;
        assert_eq!(h.send(inbound::CONNECT, "not json").await, Flow::Continue);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.sink.last().unwrap().data.starts_with("Invalid connection request"));

        h.send(inbound::CONNECT, r#"{"host":"","username":"tim"}"#).await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.connector.targets.lock().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_closes_session() {
        let connector =
            MockConnector::failing(|| BridgeError::AuthRejected("all methods refused".into()));
        let bridge = Bridge::new(&Config::default(), connector, resolver(), None);
        let sink = RecordingSink::default();
        let session = SessionRegistry::new(1)
            .create(SessionKind::Shell, Box::new(sink.clone()))
            .await
            .ok()
            .unwrap();

        let flow = bridge
            .handle_text(&session, &frame(inbound::CONNECT, CONNECT))
            .await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(session.state(), SessionState::Closing);
        let err = sink.last().unwrap();
        assert_eq!(err.kind, "error");
        assert!(err.data.contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_no_credentials_fails_before_connecting() {
        let h = harness(SessionKind::Shell).await;
        let flow = h
            .send(inbound::CONNECT, r#"{"host":"h","username":"u"}"#)
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(h.connector.targets.lock().is_empty());
        assert!(h.sink.last().unwrap().data.starts_with("No credentials"));
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        assert_eq!(h.send(inbound::CONNECT, CONNECT).await, Flow::Continue);
        assert!(h.sink.last().unwrap().data.starts_with("Cannot connect"));
        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(h.connector.targets.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_closes() {
        let h = harness(SessionKind::FileTransfer).await;
        h.connect().await;
        assert_eq!(h.send(inbound::DISCONNECT, "").await, Flow::Close);
        assert_eq!(h.session.state(), SessionState::Closing);
        h.session.cleanup().await;
        assert_eq!(h.conn.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_host_id_merges_inventory_record() {
        let inventory = Inventory::parse(
            "hosts:\n  - {id: db01, address: 10.0.0.12, port: 2222, user: deploy}\n",
        )
        .unwrap();
        let h = harness_with(SessionKind::FileTransfer, Some(inventory)).await;
        h.send(
            inbound::CONNECT,
            r#"{"hostId":"db01","username":"admin","password":"pw"}"#,
        )
        .await;
        let target = h.connector.targets.lock()[0].clone();
        assert_eq!(target.address, "10.0.0.12");
        assert_eq!(target.port, 2222);
        assert_eq!(target.principal, "admin");
    }

    #[tokio::test]
    async fn test_unknown_host_id_is_protocol_error() {
        let h = harness_with(SessionKind::Shell, Some(Inventory::default())).await;
        let flow = h
            .send(inbound::CONNECT, r#"{"hostId":"ghost","password":"pw"}"#)
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.sink.last().unwrap().data, "Unknown host: ghost");
    }

    #[tokio::test]
    async fn test_broken_channel_closes() {
        let h = harness(SessionKind::Shell).await;
        h.sink.broken.store(true, Ordering::SeqCst);
        assert_eq!(h.send("bogus", "").await, Flow::Close);
    }
}
