//! Per-system orchestration on the hub
//!
//! One updater task per system: it samples the agent over the live session
//! every minute, persists whatever advanced past the per-class watermarks,
//! drives the status state machine, and keeps the current averages fresh.
//! Operator actions arrive as record-change events from the bus; the
//! manager is the only writer of system status.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Stats, StatusEvent, SystemStatus, TransitionEffects};
use crate::domain_types::SystemId;
use crate::storage::{
    DnsRow, HttpRow, PingRow, Repository, SharedRepository, SpeedtestRow, StoreError, SystemRecord,
};
use crate::time_provider::SharedClock;

use super::alerts::{self, SharedNotifier};
use super::averages;
use super::config_manager::ConfigManager;
use super::events::{EventBus, SystemEvent};
use super::sessions::SharedSessions;

/// Sampling period per system
pub const SAMPLE_TICK: Duration = Duration::from_secs(60);
/// Wait before the first sample when the agent has no session yet
pub const NO_SESSION_DELAY: Duration = Duration::from_secs(11);
/// Upper bound on the per-system startup stagger
pub const MAX_STAGGER: Duration = Duration::from_secs(2);
/// Total window the staggered startup spreads over
pub const STARTUP_WINDOW: Duration = Duration::from_secs(60);

/// System-manager failures
#[derive(Debug, Error)]
pub enum SystemManagerError {
    /// The system already runs an updater
    #[error("system exists: {id}")]
    SystemExists {
        /// Offending system id
        id: SystemId,
    },
    /// Persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct UpdaterHandle {
    token: CancellationToken,
}

/// Per-probe-class persistence watermarks; a result is only written when
/// its `last_checked` advanced past the class watermark, and a watermark
/// only moves on successful persistence.
#[derive(Debug, Default, Clone, Copy)]
struct Watermarks {
    ping: Option<DateTime<Utc>>,
    dns: Option<DateTime<Utc>>,
    http: Option<DateTime<Utc>>,
    speedtest: Option<DateTime<Utc>>,
}

fn is_new(watermark: Option<DateTime<Utc>>, checked: DateTime<Utc>) -> bool {
    watermark.is_none_or(|w| checked > w)
}

/// Concurrent store of running systems and their updaters
pub struct SystemManager {
    repo: SharedRepository,
    sessions: SharedSessions,
    config: Arc<ConfigManager>,
    notifier: SharedNotifier,
    clock: SharedClock,
    updaters: DashMap<SystemId, UpdaterHandle>,
}

impl SystemManager {
    /// Creates the manager
    pub fn new(
        repo: SharedRepository,
        sessions: SharedSessions,
        config: Arc<ConfigManager>,
        notifier: SharedNotifier,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            sessions,
            config,
            notifier,
            clock,
            updaters: DashMap::new(),
        })
    }

    /// Loads all non-paused systems and starts their updaters, spread over
    /// the startup window so a large fleet does not sample at once.
    ///
    /// # Errors
    ///
    /// Returns [`SystemManagerError::Store`] when the systems cannot be
    /// loaded; individual updater starts never fail.
    pub async fn startup(self: &Arc<Self>) -> Result<(), SystemManagerError> {
        let systems: Vec<SystemRecord> = self
            .repo
            .find_systems()
            .await?
            .into_iter()
            .filter(|s| !s.status.is_paused())
            .collect();
        if systems.is_empty() {
            info!("no systems to monitor yet");
            return Ok(());
        }

        let stagger = (STARTUP_WINDOW / systems.len() as u32).min(MAX_STAGGER);
        info!(
            systems = systems.len(),
            stagger = ?stagger,
            "starting system updaters"
        );
        for record in systems {
            if let Err(e) = self.add_system(&record.id) {
                warn!(system_id = %record.id, error = %e, "updater not started");
            }
            self.clock.sleep(stagger).await;
        }
        Ok(())
    }

    /// Starts an updater for a system.
    ///
    /// # Errors
    ///
    /// Returns [`SystemManagerError::SystemExists`] when one already runs.
    pub fn add_system(self: &Arc<Self>, id: &SystemId) -> Result<(), SystemManagerError> {
        if self.updaters.contains_key(id) {
            return Err(SystemManagerError::SystemExists { id: id.clone() });
        }

        let token = CancellationToken::new();
        self.updaters
            .insert(id.clone(), UpdaterHandle { token: token.clone() });

        let manager = Arc::clone(self);
        let system = id.clone();
        tokio::spawn(async move {
            manager.run_updater(system, token).await;
        });
        Ok(())
    }

    /// Replaces any running updater, then starts fresh (clean state).
    pub async fn add_record(self: &Arc<Self>, id: &SystemId) {
        self.remove_system(id).await;
        if let Err(e) = self.add_system(id) {
            error!(system_id = %id, error = %e, "updater restart failed");
        }
    }

    /// Cancels the updater and closes the session for a system.
    pub async fn remove_system(&self, id: &SystemId) {
        if let Some((_, handle)) = self.updaters.remove(id) {
            handle.token.cancel();
        }
        self.sessions.close(id, "system removed").await;
        self.config.reset_sent(id);
    }

    /// Whether an updater runs for this system
    pub fn is_running(&self, id: &SystemId) -> bool {
        self.updaters.contains_key(id)
    }

    /// Number of running updaters
    pub fn running_count(&self) -> usize {
        self.updaters.len()
    }

    /// Called by the connect surface once a session is registered: deliver
    /// the initial config (at most once per registration).
    pub async fn on_agent_connected(self: &Arc<Self>, id: &SystemId) {
        self.config.send_initial(id).await;
        if !self.is_running(id) {
            // A system created while the hub runs gets its updater here.
            let _ = self.add_system(id);
        }
    }

    /// Consumes record-change events until the bus closes.
    pub async fn run_event_loop(self: Arc<Self>, bus: EventBus) {
        let mut rx = bus.subscribe();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event bus lagged, events dropped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            match event {
                SystemEvent::Created(record) => {
                    info!(system_id = %record.id, "system created");
                    self.add_record(&record.id).await;
                }
                SystemEvent::Deleted(id) => {
                    info!(system_id = %id, "system deleted");
                    self.remove_system(&id).await;
                }
                SystemEvent::Paused(id) => {
                    if let Err(e) = self.pause_system(&id).await {
                        error!(system_id = %id, error = %e, "pause handling failed");
                    }
                }
                SystemEvent::Resumed(id) => {
                    if let Err(e) = self.resume_system(&id).await {
                        error!(system_id = %id, error = %e, "resume handling failed");
                    }
                }
                SystemEvent::TokenRotated(id) => {
                    info!(system_id = %id, "token rotated, closing session");
                    self.sessions.close(&id, "token rotated").await;
                    self.config.reset_sent(&id);
                }
                SystemEvent::ConfigChanged(id) => {
                    self.config.invalidate(&id);
                }
            }
        }
    }

    /// Applies the operator pause: alerts off, info cleared, no sampling.
    async fn pause_system(&self, id: &SystemId) -> Result<(), SystemManagerError> {
        let record = self.repo.get_system(id).await?;
        match record.status.transition(StatusEvent::OperatorPause) {
            Ok((next, effects)) => {
                self.repo.update_system_status(id, next).await?;
                if effects.deactivate_alerts {
                    let cleared = self.repo.deactivate_alerts(id).await?;
                    self.repo.clear_system_info(id).await?;
                    info!(system_id = %id, cleared, "system paused, alerts deactivated");
                }
                // Stop probe scheduling on the agent; the session stays for
                // keepalives.
                if let Err(e) = self.config.push_suspended(id).await {
                    warn!(system_id = %id, error = %e, "suspension push failed");
                }
                Ok(())
            }
            Err(e) => {
                debug!(system_id = %id, error = %e, "pause ignored");
                Ok(())
            }
        }
    }

    /// Resumes a paused system, preferring the session that stayed warm.
    async fn resume_system(self: &Arc<Self>, id: &SystemId) -> Result<(), SystemManagerError> {
        let record = self.repo.get_system(id).await?;
        match record.status.transition(StatusEvent::OperatorResume) {
            Ok((next, _)) => {
                self.repo.update_system_status(id, next).await?;
                if !self.is_running(id) {
                    let _ = self.add_system(id);
                }
                // Re-deliver the stored config past the suspension epoch,
                // preferring the session that stayed warm.
                if let Err(e) = self.config.resync(id).await {
                    warn!(system_id = %id, error = %e, "config resync failed");
                }
                info!(system_id = %id, "system resumed");
                Ok(())
            }
            Err(e) => {
                debug!(system_id = %id, error = %e, "resume ignored");
                Ok(())
            }
        }
    }

    async fn run_updater(self: Arc<Self>, id: SystemId, token: CancellationToken) {
        // Give a restarting agent time to re-establish its socket before the
        // first sample; with a session already up, jitter the first tick so
        // updaters started together spread out.
        let initial_delay = if self.sessions.get(&id).is_none() {
            NO_SESSION_DELAY
        } else {
            let percent: u32 = rand::thread_rng().gen_range(40..=90);
            SAMPLE_TICK * percent / 100
        };
        tokio::select! {
            () = token.cancelled() => return,
            () = self.clock.sleep(initial_delay) => {}
        }

        let mut watermarks = Watermarks::default();
        loop {
            self.tick(&id, &mut watermarks).await;

            tokio::select! {
                () = token.cancelled() => return,
                () = self.clock.sleep(SAMPLE_TICK) => {}
            }
        }
    }

    async fn tick(&self, id: &SystemId, watermarks: &mut Watermarks) {
        let record = match self.repo.get_system(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(system_id = %id, error = %e, "system unreadable, skipping tick");
                return;
            }
        };

        if record.status.is_paused() {
            if let Some(session) = self.sessions.get(id) {
                session.ping().await;
                debug!(system_id = %id, "paused, keepalive sent");
            }
            return;
        }

        let sampled = match self.sessions.get(id) {
            None => {
                debug!(system_id = %id, "no session to sample");
                Err(())
            }
            Some(session) => match session.sample().await {
                Ok(data) => Ok(data),
                Err(e) => {
                    warn!(system_id = %id, error = %e, "sample failed");
                    Err(())
                }
            },
        };

        match sampled {
            Ok(data) => {
                if let Err(e) = self
                    .handle_sample(&record, data.stats, &data.info, watermarks)
                    .await
                {
                    error!(system_id = %id, error = %e, "sample persistence failed");
                }
            }
            Err(()) => self.handle_sample_failure(&record).await,
        }
    }

    async fn handle_sample(
        &self,
        record: &SystemRecord,
        stats: Stats,
        info: &crate::domain::SystemInfo,
        watermarks: &mut Watermarks,
    ) -> Result<(), SystemManagerError> {
        let persisted = self.persist_stats(&record.id, stats, watermarks).await;
        if persisted > 0 {
            debug!(system_id = %record.id, rows = persisted, "stats rows written");
        }

        let (next, effects) = match record.status.transition(StatusEvent::SampleOk) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(system_id = %record.id, error = %e, "sample ignored in this state");
                return Ok(());
            }
        };

        let current = averages::compute_current(&self.repo, &record.id).await?;
        self.repo
            .update_system_sample(&record.id, next, info, &current)
            .await?;
        // Per-sample snapshot keeps the trail dense enough for windowed
        // alerts; the five-minute job covers systems between samples.
        self.repo
            .insert_averages_row(&averages::to_row(&record.id, &current, self.clock.now()))
            .await?;

        self.apply_effects(record, &effects, false).await;
        if effects.evaluate_metric_alerts || next.is_up() {
            if let Err(e) = alerts::evaluate_system(
                &self.repo,
                &self.notifier,
                &record.id,
                record.name.to_string().as_str(),
                &current,
                &self.clock,
            )
            .await
            {
                warn!(system_id = %record.id, error = %e, "alert evaluation failed");
            }
        }
        Ok(())
    }

    async fn handle_sample_failure(&self, record: &SystemRecord) {
        let (next, effects) = match record.status.transition(StatusEvent::SampleFailed) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(system_id = %record.id, error = %e, "failure ignored in this state");
                return;
            }
        };

        if next != record.status {
            info!(system_id = %record.id, from = %record.status, to = %next, "status changed");
        }
        if let Err(e) = self.repo.update_system_status(&record.id, next).await {
            error!(system_id = %record.id, error = %e, "status update failed");
            return;
        }
        self.apply_effects(record, &effects, true).await;
    }

    async fn apply_effects(&self, record: &SystemRecord, effects: &TransitionEffects, down: bool) {
        if effects.fire_status_alert {
            alerts::status_alert(&self.notifier, record.name.to_string().as_str(), down).await;
        }
    }

    /// Writes rows for every result that advanced past its class watermark.
    /// A failed insert stops the watermark advance for that class so the
    /// next sample retries the same rows.
    async fn persist_stats(
        &self,
        id: &SystemId,
        stats: Stats,
        watermarks: &mut Watermarks,
    ) -> usize {
        let mut written = 0;

        let mut ping = stats.ping;
        ping.sort_by_key(|e| e.result.last_checked);
        for entry in ping {
            if !is_new(watermarks.ping, entry.result.last_checked) {
                continue;
            }
            let row = PingRow {
                system: id.clone(),
                host: entry.host,
                packet_loss: entry.result.packet_loss,
                min_rtt: entry.result.min_rtt,
                max_rtt: entry.result.max_rtt,
                avg_rtt: entry.result.avg_rtt,
                created: entry.result.last_checked,
            };
            match self.repo.insert_ping_row(&row).await {
                Ok(()) => {
                    watermarks.ping = Some(entry.result.last_checked);
                    written += 1;
                }
                Err(e) => {
                    warn!(system_id = %id, error = %e, "ping row insert failed");
                    break;
                }
            }
        }

        let mut dns = stats.dns;
        dns.sort_by_key(|e| e.result.last_checked);
        for entry in dns {
            if !is_new(watermarks.dns, entry.result.last_checked) {
                continue;
            }
            let row = DnsRow {
                system: id.clone(),
                domain: entry.domain,
                server: entry.server,
                record_type: entry.record_type,
                status: entry.result.status,
                lookup_time: entry.result.lookup_time,
                error_code: entry.result.error_code,
                created: entry.result.last_checked,
            };
            match self.repo.insert_dns_row(&row).await {
                Ok(()) => {
                    watermarks.dns = Some(row.created);
                    written += 1;
                }
                Err(e) => {
                    warn!(system_id = %id, error = %e, "dns row insert failed");
                    break;
                }
            }
        }

        let mut http = stats.http;
        http.sort_by_key(|e| e.result.last_checked);
        for entry in http {
            if !is_new(watermarks.http, entry.result.last_checked) {
                continue;
            }
            let row = HttpRow {
                system: id.clone(),
                url: entry.url,
                status: entry.result.status,
                response_time: entry.result.response_time,
                status_code: entry.result.status_code,
                error_code: entry.result.error_code,
                created: entry.result.last_checked,
            };
            match self.repo.insert_http_row(&row).await {
                Ok(()) => {
                    watermarks.http = Some(row.created);
                    written += 1;
                }
                Err(e) => {
                    warn!(system_id = %id, error = %e, "http row insert failed");
                    break;
                }
            }
        }

        let mut speedtest = stats.speedtest;
        speedtest.sort_by_key(|e| e.result.last_checked);
        for entry in speedtest {
            if !is_new(watermarks.speedtest, entry.result.last_checked) {
                continue;
            }
            let row = SpeedtestRow {
                system: id.clone(),
                server_id: entry.server_id,
                status: entry.result.status,
                download_speed: entry.result.download_speed,
                upload_speed: entry.result.upload_speed,
                latency: entry.result.latency,
                jitter: entry.result.jitter,
                download_bytes: entry.result.download_bytes,
                upload_bytes: entry.result.upload_bytes,
                error_code: entry.result.error_code,
                created: entry.result.last_checked,
            };
            match self.repo.insert_speedtest_row(&row).await {
                Ok(()) => {
                    watermarks.speedtest = Some(row.created);
                    written += 1;
                }
                Err(e) => {
                    warn!(system_id = %id, error = %e, "speedtest row insert failed");
                    break;
                }
            }
        }

        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConfigLimits, PingEntry, PingResult, SystemInfo};
    use crate::domain_types::SystemName;
    use crate::hub::alerts::LogNotifier;
    use crate::hub::sessions::SessionRegistry;
    use crate::storage::memory::MemoryRepository;
    use crate::time_provider::fast_forward_clock;

    fn manager_with_repo() -> (Arc<SystemManager>, SharedRepository) {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let sessions: SharedSessions = Arc::new(SessionRegistry::new());
        let clock = fast_forward_clock();
        let config = ConfigManager::new(
            Arc::clone(&repo),
            Arc::clone(&sessions),
            Arc::clone(&clock),
            ConfigLimits::default(),
        );
        let manager = SystemManager::new(
            Arc::clone(&repo),
            sessions,
            config,
            Arc::new(LogNotifier) as SharedNotifier,
            clock,
        );
        (manager, repo)
    }

    fn record(id: &SystemId, status: SystemStatus) -> SystemRecord {
        SystemRecord {
            id: id.clone(),
            name: SystemName::try_new("edge-1".to_string()).unwrap(),
            host: "edge-1.example.org".to_string(),
            status,
            info: None,
            current_averages: None,
            users: Vec::new(),
            created: Utc::now(),
        }
    }

    fn ping_stats(at: DateTime<Utc>) -> Stats {
        Stats {
            ping: vec![PingEntry {
                host: "8.8.8.8".to_string(),
                result: PingResult {
                    packet_loss: 0.0,
                    min_rtt: 9.1,
                    avg_rtt: 9.5,
                    max_rtt: 9.9,
                    last_checked: at,
                },
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn adding_a_running_system_reports_exists() {
        let (manager, _repo) = manager_with_repo();
        let id = SystemId::generate();
        manager.add_system(&id).unwrap();
        let err = manager.add_system(&id).unwrap_err();
        assert!(matches!(err, SystemManagerError::SystemExists { .. }));
    }

    #[tokio::test]
    async fn add_record_replaces_the_running_updater() {
        let (manager, _repo) = manager_with_repo();
        let id = SystemId::generate();
        manager.add_system(&id).unwrap();
        manager.add_record(&id).await;
        assert!(manager.is_running(&id));
        assert_eq!(manager.running_count(), 1);
    }

    #[tokio::test]
    async fn watermarks_suppress_already_persisted_results() {
        let (manager, repo) = manager_with_repo();
        let id = SystemId::generate();
        let checked = Utc::now();

        let mut watermarks = Watermarks::default();
        let written = manager
            .persist_stats(&id, ping_stats(checked), &mut watermarks)
            .await;
        assert_eq!(written, 1);

        // Same result again (ping grace window re-delivery): no new row.
        let written = manager
            .persist_stats(&id, ping_stats(checked), &mut watermarks)
            .await;
        assert_eq!(written, 0);

        // A newer result advances.
        let written = manager
            .persist_stats(
                &id,
                ping_stats(checked + chrono::Duration::seconds(60)),
                &mut watermarks,
            )
            .await;
        assert_eq!(written, 1);
        assert_eq!(repo.recent_ping_rows(&id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn successful_sample_brings_a_pending_system_up() {
        let (manager, repo) = manager_with_repo();
        let id = SystemId::generate();
        repo.upsert_system(&record(&id, SystemStatus::Pending))
            .await
            .unwrap();

        let info = SystemInfo {
            version: "0.5.0".to_string(),
            ..Default::default()
        };
        let mut watermarks = Watermarks::default();
        let loaded = repo.get_system(&id).await.unwrap();
        manager
            .handle_sample(&loaded, ping_stats(Utc::now()), &info, &mut watermarks)
            .await
            .unwrap();

        let updated = repo.get_system(&id).await.unwrap();
        assert_eq!(updated.status, SystemStatus::Up);
        assert_eq!(updated.info.unwrap().version, "0.5.0");
        assert_eq!(updated.current_averages.unwrap().ping_latency, 9.5);
    }

    #[tokio::test]
    async fn sample_failure_takes_an_up_system_down() {
        let (manager, repo) = manager_with_repo();
        let id = SystemId::generate();
        repo.upsert_system(&record(&id, SystemStatus::Up))
            .await
            .unwrap();

        let loaded = repo.get_system(&id).await.unwrap();
        manager.handle_sample_failure(&loaded).await;
        assert_eq!(
            repo.get_system(&id).await.unwrap().status,
            SystemStatus::Down
        );
    }

    #[tokio::test]
    async fn pause_event_clears_info_and_deactivates_alerts() {
        let (manager, repo) = manager_with_repo();
        let id = SystemId::generate();
        let mut rec = record(&id, SystemStatus::Up);
        rec.info = Some(SystemInfo::default());
        repo.upsert_system(&rec).await.unwrap();
        repo.save_alert(&crate::storage::AlertRecord {
            user: "ops".to_string(),
            system: id.clone(),
            name: "PingLatency".to_string(),
            value: 50.0,
            min: 1,
            triggered: true,
        })
        .await
        .unwrap();

        manager.pause_system(&id).await.unwrap();

        let updated = repo.get_system(&id).await.unwrap();
        assert_eq!(updated.status, SystemStatus::Paused);
        assert!(updated.info.is_none());
        assert!(!repo.list_alerts(&id).await.unwrap()[0].triggered);
    }

    #[tokio::test]
    async fn resume_returns_to_pending() {
        let (manager, repo) = manager_with_repo();
        let id = SystemId::generate();
        repo.upsert_system(&record(&id, SystemStatus::Paused))
            .await
            .unwrap();

        manager.resume_system(&id).await.unwrap();
        assert_eq!(
            repo.get_system(&id).await.unwrap().status,
            SystemStatus::Pending
        );
        assert!(manager.is_running(&id));
    }

    #[tokio::test]
    async fn startup_spawns_updaters_for_non_paused_systems() {
        let (manager, repo) = manager_with_repo();
        let active = SystemId::generate();
        let paused = SystemId::generate();
        repo.upsert_system(&record(&active, SystemStatus::Pending))
            .await
            .unwrap();
        repo.upsert_system(&record(&paused, SystemStatus::Paused))
            .await
            .unwrap();

        manager.startup().await.unwrap();
        assert!(manager.is_running(&active));
        assert!(!manager.is_running(&paused));
    }
}
