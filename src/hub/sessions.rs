//! Hub-side live sessions
//!
//! Each connected agent gets one actor task owning its WebSocket. Commands
//! arrive over a channel; data requests are queued FIFO so responses pair
//! with requests in order, which keeps sampling serialized per session.
//! The registry enforces at most one live session per system id.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use axum::extract::ws::{Message, WebSocket};

use crate::domain::{CombinedData, VersionedConfig};
use crate::domain_types::SystemId;
use crate::wire::{ControlFrame, decode_combined};

/// Upper bound on one request/response round trip
pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands the hub can issue into a session
enum SessionCommand {
    Sample(oneshot::Sender<Result<CombinedData, SessionError>>),
    SendConfig(VersionedConfig),
    Ping,
    Close { reason: String },
}

/// Session failures seen by the hub core
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The session ended before or during the exchange
    #[error("session closed")]
    Closed,
    /// The agent did not answer in time
    #[error("sample timed out")]
    Timeout,
    /// The agent answered with an undecodable payload
    #[error("bad payload: {0}")]
    BadPayload(String),
}

/// Handle to one live session
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    system: SystemId,
    agent_version: String,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Unique id of this connection
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// System this session authenticates as
    pub fn system(&self) -> &SystemId {
        &self.system
    }

    /// Agent version from the handshake
    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    /// Requests a snapshot; serialized FIFO with other requests.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] when the session died,
    /// [`SessionError::Timeout`] after [`SAMPLE_TIMEOUT`], and
    /// [`SessionError::BadPayload`] on undecodable answers.
    pub async fn sample(&self) -> Result<CombinedData, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Sample(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;

        match tokio::time::timeout(SAMPLE_TIMEOUT, reply_rx).await {
            Err(_) => Err(SessionError::Timeout),
            Ok(Err(_)) => Err(SessionError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    /// Pushes a config frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] when the session died.
    pub async fn send_config(&self, config: VersionedConfig) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::SendConfig(config))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Sends a keepalive ping (used while the system is paused)
    pub async fn ping(&self) {
        let _ = self.tx.send(SessionCommand::Ping).await;
    }

    /// Closes the session with a reason
    pub async fn close(&self, reason: &str) {
        let _ = self
            .tx
            .send(SessionCommand::Close {
                reason: reason.to_string(),
            })
            .await;
    }
}

/// At-most-one live session per system
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SystemId, SessionHandle>,
}

impl SessionRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session, closing any session it supersedes.
    pub async fn register(&self, handle: SessionHandle) {
        let previous = self.sessions.insert(handle.system().clone(), handle);
        if let Some(old) = previous {
            info!(system_id = %old.system(), "closing superseded session");
            old.close("superseded by new connection").await;
        }
    }

    /// The live session for a system, if any
    pub fn get(&self, system: &SystemId) -> Option<SessionHandle> {
        self.sessions.get(system).map(|s| s.value().clone())
    }

    /// Drops the registry entry, but only for the given connection; a
    /// replacement session that already took the slot stays.
    pub fn unregister(&self, system: &SystemId, session_id: &str) {
        self.sessions
            .remove_if(system, |_, handle| handle.session_id() == session_id);
    }

    /// Closes and removes the session for a system, if any.
    pub async fn close(&self, system: &SystemId, reason: &str) {
        if let Some((_, handle)) = self.sessions.remove(system) {
            handle.close(reason).await;
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Shared registry handle
pub type SharedSessions = Arc<SessionRegistry>;

/// Spawns the actor for an upgraded socket and registers its handle.
pub async fn spawn_session(
    registry: SharedSessions,
    socket: WebSocket,
    system: SystemId,
    agent_version: String,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(16);
    let handle = SessionHandle {
        session_id: uuid::Uuid::new_v4().to_string(),
        system: system.clone(),
        agent_version,
        tx,
    };

    registry.register(handle.clone()).await;

    let actor_registry = Arc::clone(&registry);
    let actor_handle = handle.clone();
    tokio::spawn(async move {
        run_actor(socket, &actor_handle, rx).await;
        actor_registry.unregister(actor_handle.system(), actor_handle.session_id());
        debug!(system_id = %actor_handle.system(), "session actor ended");
    });

    handle
}

async fn run_actor(
    mut socket: WebSocket,
    handle: &SessionHandle,
    mut rx: mpsc::Receiver<SessionCommand>,
) {
    let mut pending: VecDeque<oneshot::Sender<Result<CombinedData, SessionError>>> =
        VecDeque::new();

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    SessionCommand::Sample(reply) => {
                        let frame = match ControlFrame::DataRequest.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                let _ = reply.send(Err(SessionError::BadPayload(e.to_string())));
                                continue;
                            }
                        };
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            let _ = reply.send(Err(SessionError::Closed));
                            break;
                        }
                        pending.push_back(reply);
                    }
                    SessionCommand::SendConfig(config) => {
                        let frame = ControlFrame::Config(config);
                        let Ok(json) = frame.to_json() else { continue };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    SessionCommand::Ping => {
                        let Ok(json) = ControlFrame::Ping.to_json() else { continue };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    SessionCommand::Close { reason } => {
                        if let Ok(json) = (ControlFrame::Close { reason }).to_json() {
                            let _ = socket.send(Message::Text(json.into())).await;
                        }
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Binary(payload) => {
                        let result = decode_combined(&payload)
                            .map_err(|e| SessionError::BadPayload(e.to_string()));
                        match pending.pop_front() {
                            Some(reply) => {
                                let _ = reply.send(result);
                            }
                            None => warn!(
                                system_id = %handle.system(),
                                "unsolicited data response dropped"
                            ),
                        }
                    }
                    Message::Text(text) => {
                        match ControlFrame::from_json(text.as_str()) {
                            Ok(ControlFrame::Pong) => {}
                            Ok(ControlFrame::Ping) => {
                                if let Ok(json) = ControlFrame::Pong.to_json()
                                    && socket.send(Message::Text(json.into())).await.is_err()
                                {
                                    break;
                                }
                            }
                            Ok(ControlFrame::Close { reason }) => {
                                info!(system_id = %handle.system(), %reason, "agent closed session");
                                break;
                            }
                            Ok(other) => {
                                debug!(system_id = %handle.system(), ?other, "unexpected frame");
                            }
                            Err(e) => warn!(system_id = %handle.system(), error = %e, "bad frame"),
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    // Fail anything still waiting for an answer.
    for reply in pending {
        let _ = reply.send(Err(SessionError::Closed));
    }
}
