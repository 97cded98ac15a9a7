//! WebSocket transport for bridge sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws/ssh?token=<api_key>` (shell) or
//!    `GET /ws/sftp?token=<api_key>` (file transfer). The token is validated
//!    before the upgrade completes.
//! 2. The accepted socket is registered as an `Idle` session. The write half
//!    becomes the session's [`EnvelopeSink`]; the read half feeds text frames
//!    to [`Bridge::handle_text`](crate::bridge::Bridge::handle_text).
//! 3. The loop ends on a close frame, a read error, a `disconnect`
//!    envelope, a session-ending failure, or cancellation of the session
//!    (remote exit, server shutdown). The session is then torn down through
//!    the registry and the socket is closed.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::ApiKey;
use crate::bridge::Flow;
use crate::error::BridgeError;
use crate::protocol::Envelope;
use crate::sessions::{EnvelopeSink, SessionKind};
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter (since HTTP headers aren't available
    /// during a browser WebSocket upgrade).
    pub token: String,
}

/// `GET /ws/ssh?token=<key>`: shell session.
pub async fn ssh_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &query, ws, SessionKind::Shell)
}

/// `GET /ws/sftp?token=<key>`: file-transfer session.
pub async fn sftp_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &query, ws, SessionKind::FileTransfer)
}

/// Returns `403 Forbidden` on a bad token.
fn upgrade(state: AppState, query: &WsQuery, ws: WebSocketUpgrade, kind: SessionKind) -> Response {
    if !ApiKey(state.config.auth.api_key.clone()).matches(&query.token) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    let limit = state.config.server.max_message_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_ws(socket, state, kind))
}

/// Write half of the socket, owned by the session.
struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl EnvelopeSink for WsSink {
    async fn send(&mut self, envelope: Envelope) -> Result<(), BridgeError> {
        self.sink
            .send(Message::Text(envelope.encode().into()))
            .await
            .map_err(|e| BridgeError::Channel(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("WS close: {e}");
        }
    }
}

async fn handle_ws(socket: WebSocket, state: AppState, kind: SessionKind) {
    let (ws_sink, mut ws_stream) = socket.split();

    let session = match state
        .registry
        .create(kind, Box::new(WsSink { sink: ws_sink }))
        .await
    {
        Ok(session) => session,
        Err(refused) => {
            warn!("Refusing {} connection: {}", kind.prefix(), refused.reason);
            let _ = refused
                .session
                .send(Envelope::error(refused.reason.to_string()))
                .await;
            refused.session.close_channel().await;
            return;
        }
    };
    let id = session.id().to_string();
    info!("New WebSocket connection: {id}");

    let token = session.cancel_token();
    loop {
        tokio::select! {
            () = token.cancelled() => {
                debug!("Session {id}: cancelled");
                break;
            }
            frame = ws_stream.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("Session {id}: WebSocket read error: {e}");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        if state.bridge.handle_text(&session, text.as_str()).await == Flow::Close {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        let reply = Envelope::error("Binary frames are not supported");
                        if session.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Ping/pong are answered by axum.
                    _ => {}
                }
            }
        }
    }

    state.registry.teardown(&session).await;
    session.close_channel().await;
    info!("WebSocket disconnected: {id}");
}
