//! Agent connection manager
//!
//! A small state machine around the hub session: `Disconnected` or
//! `WebSocketConnected`, driven by `Connect`/`Disconnect` events. A fixed
//! 10-second ticker retries while disconnected (no exponential backoff),
//! connect attempts are debounced to one per 5 seconds, and only the very
//! first connect is jittered to spread a fleet restart. A 90-second
//! heartbeat keeps the health file fresh, and SIGINT/SIGTERM tear the
//! session down cleanly.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentSettings;
use crate::time_provider::SharedClock;

use super::Agent;
use super::health;
use super::session::{SessionEnd, run_session};

/// Fixed period of the reconnect ticker
pub const RECONNECT_TICK: Duration = Duration::from_secs(10);
/// Minimum spacing between connect attempts
pub const CONNECT_DEBOUNCE: Duration = Duration::from_secs(5);
/// Upper bound of the first-connect jitter
const FIRST_CONNECT_JITTER: Duration = Duration::from_secs(5);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session
    Disconnected,
    /// A session task is running
    WebSocketConnected,
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Try to establish a session
    Connect,
    /// The session ended
    Disconnect,
}

/// Runs the agent's connection loop until a shutdown signal arrives.
pub struct ConnectionManager {
    settings: AgentSettings,
    agent: Arc<Agent>,
    clock: SharedClock,
    state: ConnectionState,
    last_attempt: Option<Instant>,
    reconnect_scheduled: bool,
    session_token: CancellationToken,
}

impl ConnectionManager {
    /// Creates the manager
    pub fn new(settings: AgentSettings, agent: Arc<Agent>, clock: SharedClock) -> Self {
        Self {
            settings,
            agent,
            clock,
            state: ConnectionState::Disconnected,
            last_attempt: None,
            reconnect_scheduled: false,
            session_token: CancellationToken::new(),
        }
    }

    /// Runs until SIGINT/SIGTERM; returns after cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error only when the signal handlers cannot be installed.
    pub async fn run(mut self) -> std::io::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel::<ConnectionEvent>(8);

        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        // Spread fleet restarts so every agent does not hit the hub at once.
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..FIRST_CONNECT_JITTER);
        debug!(jitter = ?jitter, "delaying first connect");
        self.clock.sleep(jitter).await;
        let _ = events_tx.send(ConnectionEvent::Connect).await;

        let mut reconnect_tick = tokio::time::interval(RECONNECT_TICK);
        reconnect_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut health_tick = tokio::time::interval(health::HEALTH_INTERVAL);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = health_tick.tick() => {
                    if let Err(e) = health::beat(&self.settings.health_file) {
                        warn!(error = %e, "health heartbeat write failed");
                    }
                }
                _ = reconnect_tick.tick() => {
                    if self.state == ConnectionState::Disconnected {
                        let _ = events_tx.send(ConnectionEvent::Connect).await;
                    }
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event, &events_tx);
                }
            }
        }

        info!("shutting down");
        self.session_token.cancel();
        self.agent.stop().await;
        health::cleanup(&self.settings.health_file);
        Ok(())
    }

    fn handle_event(&mut self, event: ConnectionEvent, events_tx: &mpsc::Sender<ConnectionEvent>) {
        match (self.state, event) {
            (ConnectionState::Disconnected, ConnectionEvent::Connect) => {
                if let Some(last) = self.last_attempt
                    && last.elapsed() < CONNECT_DEBOUNCE
                {
                    debug!("connect attempt debounced");
                    return;
                }
                self.last_attempt = Some(Instant::now());
                self.reconnect_scheduled = false;
                self.state = ConnectionState::WebSocketConnected;
                self.spawn_session(events_tx.clone());
            }
            (ConnectionState::WebSocketConnected, ConnectionEvent::Disconnect) => {
                self.state = ConnectionState::Disconnected;
                // Schedule exactly one immediate retry; the ticker covers
                // everything after that.
                if !self.reconnect_scheduled {
                    self.reconnect_scheduled = true;
                    let tx = events_tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(ConnectionEvent::Connect).await;
                    });
                }
            }
            (state, event) => {
                debug!(?state, ?event, "event ignored in this state");
            }
        }
    }

    fn spawn_session(&mut self, events_tx: mpsc::Sender<ConnectionEvent>) {
        self.session_token = CancellationToken::new();
        let token = self.session_token.clone();
        let settings = self.settings.clone();
        let agent = Arc::clone(&self.agent);

        tokio::spawn(async move {
            match run_session(&settings, agent, token).await {
                Ok(SessionEnd::LocalShutdown) => return,
                Ok(SessionEnd::Remote) => info!("session ended by hub"),
                Err(e) => error!(error = %e, "session failed"),
            }
            let _ = events_tx.send(ConnectionEvent::Disconnect).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_window_is_five_seconds() {
        assert_eq!(CONNECT_DEBOUNCE, Duration::from_secs(5));
        assert!(RECONNECT_TICK > CONNECT_DEBOUNCE);
    }
}
