//! Hub: sessions, per-system orchestration, config push, averages, alerts
//!
//! [`Hub::new`] wires the pieces over a repository and a clock;
//! [`Hub::start`] brings up the background jobs and returns the router to
//! serve.

pub mod alerts;
pub mod api;
pub mod averages;
pub mod config_manager;
pub mod events;
pub mod sessions;
pub mod system_manager;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::HubSettings;
use crate::domain::ConfigLimits;
use crate::storage::{Repository, SharedRepository};
use crate::time_provider::SharedClock;

use alerts::SharedNotifier;
use api::HubState;
use config_manager::ConfigManager;
use events::EventBus;
use sessions::{SessionRegistry, SharedSessions};
use system_manager::SystemManager;

/// Period of the retention pruning job
pub const RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Composed hub service
pub struct Hub {
    state: HubState,
    token: CancellationToken,
}

impl Hub {
    /// Wires the hub over its collaborators.
    pub fn new(
        settings: HubSettings,
        repo: SharedRepository,
        notifier: SharedNotifier,
        clock: SharedClock,
    ) -> Self {
        let sessions: SharedSessions = Arc::new(SessionRegistry::new());
        let events = EventBus::new();
        let config = ConfigManager::new(
            Arc::clone(&repo),
            Arc::clone(&sessions),
            Arc::clone(&clock),
            ConfigLimits::default(),
        );
        let manager = SystemManager::new(
            Arc::clone(&repo),
            Arc::clone(&sessions),
            Arc::clone(&config),
            notifier,
            Arc::clone(&clock),
        );

        let state = HubState {
            repo,
            sessions,
            manager,
            config,
            events,
            settings: Arc::new(settings),
            universal_tokens: Arc::new(dashmap::DashMap::new()),
            clock,
        };

        Self {
            state,
            token: CancellationToken::new(),
        }
    }

    /// Shared state (for tests and the binary)
    pub fn state(&self) -> &HubState {
        &self.state
    }

    /// Starts background jobs and returns the router to serve.
    ///
    /// # Errors
    ///
    /// Returns the storage error when the initial system load fails; that
    /// is fatal at startup.
    pub async fn start(&self) -> Result<axum::Router, system_manager::SystemManagerError> {
        self.state.manager.startup().await?;

        let event_manager = Arc::clone(&self.state.manager);
        let bus = self.state.events.clone();
        tokio::spawn(async move {
            event_manager.run_event_loop(bus).await;
        });

        tokio::spawn(averages::run_historical_job(
            Arc::clone(&self.state.repo),
            Arc::clone(&self.state.clock),
            self.token.clone(),
        ));

        tokio::spawn(run_retention_job(
            Arc::clone(&self.state.repo),
            Arc::clone(&self.state.settings),
            Arc::clone(&self.state.clock),
            self.token.clone(),
        ));

        info!("hub started");
        Ok(api::create_router(self.state.clone()))
    }

    /// Stops the background jobs
    pub fn stop(&self) {
        self.token.cancel();
        self.state.config.stop();
    }
}

/// Prunes stats beyond the retention window and trims alert history, daily.
pub async fn run_retention_job(
    repo: SharedRepository,
    settings: Arc<HubSettings>,
    clock: SharedClock,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = clock.sleep(RETENTION_PERIOD) => {}
        }

        let cutoff = clock.now() - chrono::Duration::days(i64::from(settings.retention_days));
        match repo.prune_stats(cutoff).await {
            Ok(removed) => info!(removed, "stats retention pruned"),
            Err(e) => warn!(error = %e, "stats retention failed"),
        }
        match repo.prune_alerts_history(settings.alerts_history_keep).await {
            Ok(removed) => info!(removed, "alert history trimmed"),
            Err(e) => warn!(error = %e, "alert history trim failed"),
        }
    }
}
