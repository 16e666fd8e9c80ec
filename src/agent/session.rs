//! Agent side of the hub session
//!
//! One WebSocket connection, authenticated with the `X-Token`, `X-Beszel`,
//! and `X-Key` headers. The hub drives the conversation: config frames
//! replace probe-manager state, data requests drain a snapshot, pings keep
//! a paused system's session warm. The agent answers in arrival order, so
//! hub requests and responses stay FIFO.

use futures::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Message, self};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentSettings;
use crate::wire::{ControlFrame, HEADER_KEY, HEADER_TOKEN, HEADER_VERSION, encode_combined};

use super::Agent;

/// Agent identity header; the hub binds this value on first connect
pub const HEADER_FINGERPRINT: &str = "X-Fingerprint";

/// Stable identity hash for this host: machine id (falling back to the
/// hostname) mixed with the shared key.
pub fn agent_fingerprint(key: &str) -> String {
    use sha2::{Digest, Sha256};

    let machine = std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::fs::read_to_string("/etc/hostname").map(|s| s.trim().to_string()))
        .unwrap_or_else(|_| "unknown".to_string());

    let digest = Sha256::digest(format!("{machine}:{key}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Session setup and transport failures
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake request could not be built
    #[error("handshake request invalid: {0}")]
    BadRequest(String),
    /// The hub rejected or dropped the connection
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// A snapshot could not be encoded
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The hub closed or the transport dropped
    Remote,
    /// The shutdown token fired
    LocalShutdown,
}

/// Connects, then serves hub frames until the session ends.
///
/// # Errors
///
/// Returns [`SessionError`] when the handshake fails or the transport
/// errors mid-session; a clean close from either side is not an error.
pub async fn run_session(
    settings: &AgentSettings,
    agent: Arc<Agent>,
    shutdown: CancellationToken,
) -> Result<SessionEnd, SessionError> {
    let mut request = settings
        .connect_url()
        .into_client_request()
        .map_err(|e| SessionError::BadRequest(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        HEADER_TOKEN,
        HeaderValue::from_str(&settings.token)
            .map_err(|e| SessionError::BadRequest(e.to_string()))?,
    );
    headers.insert(
        HEADER_VERSION,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    headers.insert(
        HEADER_KEY,
        HeaderValue::from_str(&settings.key).map_err(|e| SessionError::BadRequest(e.to_string()))?,
    );
    headers.insert(
        HEADER_FINGERPRINT,
        HeaderValue::from_str(&agent_fingerprint(&settings.key))
            .map_err(|e| SessionError::BadRequest(e.to_string()))?,
    );

    let (mut socket, _) = connect_async(request).await?;
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(%session_id, "session established");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let close = ControlFrame::Close { reason: "agent shutdown".to_string() };
                let _ = socket.send(Message::Text(close.to_json()?.into())).await;
                let _ = socket.close(None).await;
                return Ok(SessionEnd::LocalShutdown);
            }
            incoming = socket.next() => {
                let Some(message) = incoming else {
                    return Ok(SessionEnd::Remote);
                };
                match message? {
                    Message::Text(text) => {
                        match ControlFrame::from_json(&text) {
                            Ok(frame) => {
                                if handle_frame(&mut socket, &agent, &session_id, frame).await? {
                                    return Ok(SessionEnd::Remote);
                                }
                            }
                            Err(e) => warn!(error = %e, "unparseable control frame"),
                        }
                    }
                    Message::Ping(payload) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(_) => return Ok(SessionEnd::Remote),
                    Message::Binary(_) => {
                        debug!("unexpected binary frame from hub, ignoring");
                    }
                    Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    }
}

/// Handles one control frame; returns true when the session should end.
async fn handle_frame<S>(
    socket: &mut S,
    agent: &Agent,
    session_id: &str,
    frame: ControlFrame,
) -> Result<bool, SessionError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match frame {
        ControlFrame::Config(pushed) => {
            let version = pushed.version;
            match agent.apply_config(pushed).await {
                Ok(true) => {}
                Ok(false) => debug!(version = %version, "config frame skipped"),
                Err(e) => warn!(error = %e, "pushed config rejected"),
            }
            Ok(false)
        }
        ControlFrame::DataRequest => {
            let data = agent.gather_stats(session_id).await;
            let payload = encode_combined(&data)?;
            socket
                .send(Message::Binary(payload.into()))
                .await
                .map_err(SessionError::WebSocket)?;
            Ok(false)
        }
        ControlFrame::Ping => {
            socket
                .send(Message::Text(ControlFrame::Pong.to_json()?.into()))
                .await
                .map_err(SessionError::WebSocket)?;
            Ok(false)
        }
        ControlFrame::Pong => Ok(false),
        ControlFrame::Close { reason } => {
            info!(%reason, "hub closed the session");
            Ok(true)
        }
    }
}
