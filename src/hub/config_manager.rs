//! Hub-side monitoring-config manager
//!
//! Owns the cached, versioned view of every system's monitoring config and
//! the push pipeline to live sessions. Change detection compares truncated
//! SHA-256 hashes; versions are wall-clock seconds bumped past the previous
//! value on collision, so they increase strictly per system. Pushes are
//! queued on a bounded channel and drained in batches; a high-priority
//! update bypasses a full queue instead of waiting.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{ConfigLimits, ConfigValidationError, MonitoringConfig, VersionedConfig};
use crate::domain_types::{ConfigHash, ConfigVersion, SystemId};
use crate::storage::{Repository, SharedRepository, StoreError};
use crate::time_provider::SharedClock;

use super::sessions::SharedSessions;

/// Cache entry lifetime
pub const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// Queue capacity before priority bypass kicks in
pub const QUEUE_CAPACITY: usize = 1000;
/// Largest drained batch
pub const BATCH_SIZE: usize = 50;
/// Flush period when the batch does not fill
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Push priority; `High` bypasses a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPriority {
    /// Drained in batches
    Normal,
    /// Processed immediately when the queue is full
    High,
}

/// Config-manager failures
#[derive(Debug, Error)]
pub enum ConfigManagerError {
    /// Validation rejected the submitted config
    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),
    /// Persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
struct CacheEntry {
    config: MonitoringConfig,
    version: ConfigVersion,
    hash: ConfigHash,
    cached_at: DateTime<Utc>,
    last_sent_hash: Option<ConfigHash>,
    send_count: u32,
}

struct PushRequest {
    system: SystemId,
}

/// Cached, versioned, batched config push
pub struct ConfigManager {
    repo: SharedRepository,
    sessions: SharedSessions,
    clock: SharedClock,
    limits: ConfigLimits,
    cache: DashMap<SystemId, CacheEntry>,
    config_sent: DashMap<SystemId, ()>,
    queue_tx: mpsc::Sender<PushRequest>,
    token: CancellationToken,
}

impl ConfigManager {
    /// Creates the manager and spawns its batch worker.
    pub fn new(
        repo: SharedRepository,
        sessions: SharedSessions,
        clock: SharedClock,
        limits: ConfigLimits,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let manager = Arc::new(Self {
            repo,
            sessions,
            clock,
            limits,
            cache: DashMap::new(),
            config_sent: DashMap::new(),
            queue_tx,
            token: CancellationToken::new(),
        });

        let worker = Arc::clone(&manager);
        tokio::spawn(async move {
            worker.run_batch_worker(queue_rx).await;
        });

        manager
    }

    /// Stops the batch worker
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Validates and stores an operator-submitted config, then queues a
    /// push when the content actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigManagerError::Invalid`] on validation failures and
    /// [`ConfigManagerError::Store`] when persistence fails.
    pub async fn submit(
        &self,
        system: &SystemId,
        config: MonitoringConfig,
        priority: PushPriority,
    ) -> Result<ConfigVersion, ConfigManagerError> {
        config.validate(&self.limits)?;

        let hash = config.content_hash();
        if let Some(entry) = self.cache.get(system)
            && entry.hash == hash
        {
            debug!(system_id = %system, "config unchanged, nothing enqueued");
            return Ok(entry.version);
        }

        let version = self.next_version(system).await?;
        self.repo
            .put_monitoring_config(system, &config, version)
            .await?;

        let previous = self.cache.get(system).map(|e| e.value().clone());
        self.cache.insert(
            system.clone(),
            CacheEntry {
                config,
                version,
                hash,
                cached_at: self.clock.now(),
                last_sent_hash: previous.as_ref().and_then(|e| e.last_sent_hash.clone()),
                send_count: previous.map_or(0, |e| e.send_count),
            },
        );

        self.queue_push(system.clone(), priority).await;
        Ok(version)
    }

    /// Invalidate the cached entry (operator edited records directly)
    pub fn invalidate(&self, system: &SystemId) {
        self.cache.remove(system);
    }

    /// Pushes the current config on first connect, at most once per
    /// (re)registration; later syncs are operator-triggered.
    pub async fn send_initial(&self, system: &SystemId) {
        if self.config_sent.insert(system.clone(), ()).is_some() {
            debug!(system_id = %system, "initial config already sent");
            return;
        }
        if let Err(e) = self.push_now(system).await {
            warn!(system_id = %system, error = %e, "initial config push failed");
            // Allow a retry on the next connect.
            self.config_sent.remove(system);
        }
    }

    /// Clears the at-most-once marker (on re-registration or removal)
    pub fn reset_sent(&self, system: &SystemId) {
        self.config_sent.remove(system);
    }

    /// Pushes an empty configuration so a paused agent stops scheduling.
    ///
    /// The stored config is untouched; the frame rides an ephemeral epoch
    /// above the stored one so the agent accepts it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigManagerError::Store`] when the stored version cannot
    /// be read; a missing session is not an error.
    pub async fn push_suspended(&self, system: &SystemId) -> Result<(), ConfigManagerError> {
        let Some(session) = self.sessions.get(system) else {
            return Ok(());
        };
        let version = self.next_version(system).await?;
        let frame = VersionedConfig {
            config: MonitoringConfig::default(),
            version,
        };
        if session.send_config(frame).await.is_err() {
            debug!(system_id = %system, "suspension push failed, session closed");
        } else {
            info!(system_id = %system, %version, "empty config pushed for pause");
        }
        Ok(())
    }

    /// Re-versions and force-pushes the stored config after a resume, so
    /// the agent's epoch moves past the suspension frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigManagerError::Store`] on load or persist failures.
    pub async fn resync(&self, system: &SystemId) -> Result<(), ConfigManagerError> {
        let Some((config, _)) = self.repo.get_monitoring_config(system).await? else {
            return Ok(());
        };
        let version = self.next_version(system).await?;
        self.repo
            .put_monitoring_config(system, &config, version)
            .await?;

        let hash = config.content_hash();
        let previous = self.cache.get(system).map(|e| e.value().clone());
        self.cache.insert(
            system.clone(),
            CacheEntry {
                config,
                version,
                hash,
                cached_at: self.clock.now(),
                last_sent_hash: None,
                send_count: previous.map_or(0, |e| e.send_count),
            },
        );
        self.push(system, true).await
    }

    /// Operator-triggered immediate sync; sends even when the content hash
    /// is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigManagerError::Store`] when the config cannot be
    /// loaded; a missing session is not an error.
    pub async fn sync_now(&self, system: &SystemId) -> Result<(), ConfigManagerError> {
        self.push(system, true).await
    }

    async fn queue_push(&self, system: SystemId, priority: PushPriority) {
        match self.queue_tx.try_send(PushRequest {
            system: system.clone(),
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) if priority == PushPriority::High => {
                info!(system_id = %system, "queue full, high-priority push processed inline");
                if let Err(e) = self.push_now(&system).await {
                    warn!(system_id = %system, error = %e, "inline push failed");
                }
            }
            Err(e) => {
                warn!(system_id = %system, error = %e, "config push dropped, queue unavailable");
            }
        }
    }

    async fn run_batch_worker(self: Arc<Self>, mut queue_rx: mpsc::Receiver<PushRequest>) {
        let mut batch: Vec<PushRequest> = Vec::with_capacity(BATCH_SIZE);
        loop {
            batch.clear();
            tokio::select! {
                () = self.token.cancelled() => return,
                () = tokio::time::sleep(FLUSH_INTERVAL) => {}
                received = queue_rx.recv() => {
                    let Some(first) = received else { return };
                    batch.push(first);
                    while batch.len() < BATCH_SIZE {
                        match queue_rx.try_recv() {
                            Ok(request) => batch.push(request),
                            Err(_) => break,
                        }
                    }
                }
            }

            if batch.is_empty() {
                continue;
            }
            debug!(batch = batch.len(), "draining config pushes");
            for request in batch.drain(..) {
                if let Err(e) = self.push_now(&request.system).await {
                    warn!(system_id = %request.system, error = %e, "queued push failed");
                }
            }
        }
    }

    async fn push_now(&self, system: &SystemId) -> Result<(), ConfigManagerError> {
        self.push(system, false).await
    }

    /// Loads (from cache or store) and pushes to the live session. Without
    /// `force`, a send whose content hash already went out is skipped.
    async fn push(&self, system: &SystemId, force: bool) -> Result<(), ConfigManagerError> {
        let entry = match self.fresh_entry(system).await? {
            Some(entry) => entry,
            None => {
                // Never configured: deliver the empty config so the agent
                // schedules nothing instead of keeping a stale epoch.
                if let Some(session) = self.sessions.get(system) {
                    let frame = VersionedConfig {
                        config: MonitoringConfig::default(),
                        version: ConfigVersion::default(),
                    };
                    if session.send_config(frame).await.is_ok() {
                        debug!(system_id = %system, "empty config pushed");
                    }
                }
                return Ok(());
            }
        };

        if !force && entry.last_sent_hash.as_ref() == Some(&entry.hash) {
            debug!(system_id = %system, "config already delivered, push skipped");
            return Ok(());
        }

        let Some(session) = self.sessions.get(system) else {
            debug!(system_id = %system, "no live session, config waits for next connect");
            return Ok(());
        };

        let frame = VersionedConfig {
            config: entry.config.clone(),
            version: entry.version,
        };
        if session.send_config(frame).await.is_err() {
            warn!(system_id = %system, "config push failed, session closed");
            return Ok(());
        }

        if let Some(mut entry) = self.cache.get_mut(system) {
            entry.last_sent_hash = Some(entry.hash.clone());
            entry.send_count += 1;
        }
        info!(system_id = %system, version = %entry.version, "config pushed");
        Ok(())
    }

    /// Cache lookup honoring the TTL, falling back to the store.
    async fn fresh_entry(&self, system: &SystemId) -> Result<Option<CacheEntry>, ConfigManagerError> {
        if let Some(entry) = self.cache.get(system) {
            let age = (self.clock.now() - entry.cached_at).to_std().unwrap_or_default();
            if age <= CACHE_TTL {
                return Ok(Some(entry.value().clone()));
            }
        }

        let Some((config, version)) = self.repo.get_monitoring_config(system).await? else {
            return Ok(None);
        };
        let hash = config.content_hash();
        let previous = self.cache.get(system).map(|e| e.value().clone());
        let entry = CacheEntry {
            config,
            version,
            hash,
            cached_at: self.clock.now(),
            last_sent_hash: previous.as_ref().and_then(|e| e.last_sent_hash.clone()),
            send_count: previous.map_or(0, |e| e.send_count),
        };
        self.cache.insert(system.clone(), entry.clone());
        Ok(Some(entry))
    }

    /// Wall-clock seconds, bumped past the stored version on collision.
    async fn next_version(&self, system: &SystemId) -> Result<ConfigVersion, ConfigManagerError> {
        let wall = self.clock.now().timestamp();
        let previous = match self.cache.get(system) {
            Some(entry) => Some(entry.version),
            None => self
                .repo
                .get_monitoring_config(system)
                .await?
                .map(|(_, version)| version),
        };

        let next = match previous {
            Some(previous) if wall <= previous.as_i64() => previous.as_i64() + 1,
            _ => wall,
        };
        Ok(ConfigVersion::try_new(next).expect("epoch seconds are non-negative"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClassConfig, PingTarget};
    use crate::storage::memory::MemoryRepository;
    use crate::time_provider::system_clock;

    fn deps() -> (Arc<ConfigManager>, SharedSessions) {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let sessions: SharedSessions = Arc::new(super::super::sessions::SessionRegistry::new());
        let manager = ConfigManager::new(
            repo,
            Arc::clone(&sessions),
            system_clock(),
            ConfigLimits::default(),
        );
        (manager, sessions)
    }

    fn ping_config(host: &str) -> MonitoringConfig {
        MonitoringConfig {
            ping: ClassConfig {
                enabled: true,
                targets: vec![PingTarget {
                    host: host.to_string(),
                    count: 3,
                    timeout: Duration::from_secs(1),
                }],
                interval: "*/1 * * * *".to_string(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn versions_increase_strictly_per_system() {
        let (manager, _sessions) = deps();
        let system = SystemId::generate();

        let v1 = manager
            .submit(&system, ping_config("8.8.8.8"), PushPriority::Normal)
            .await
            .unwrap();
        let v2 = manager
            .submit(&system, ping_config("1.1.1.1"), PushPriority::Normal)
            .await
            .unwrap();
        let v3 = manager
            .submit(&system, ping_config("9.9.9.9"), PushPriority::Normal)
            .await
            .unwrap();

        assert!(v2 > v1, "{v2} > {v1}");
        assert!(v3 > v2, "{v3} > {v2}");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_persisting() {
        let (manager, _sessions) = deps();
        let system = SystemId::generate();
        let mut config = ping_config("8.8.8.8");
        config.ping.interval = "every now and then".to_string();

        let err = manager
            .submit(&system, config, PushPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigManagerError::Invalid(_)));
        assert!(
            manager
                .repo
                .get_monitoring_config(&system)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn resubmitting_identical_content_is_a_noop() {
        let (manager, _sessions) = deps();
        let system = SystemId::generate();
        let config = ping_config("8.8.8.8");

        let v1 = manager
            .submit(&system, config.clone(), PushPriority::Normal)
            .await
            .unwrap();
        let v2 = manager
            .submit(&system, config, PushPriority::Normal)
            .await
            .unwrap();
        assert_eq!(v1, v2, "unchanged content keeps its version");
    }

    #[tokio::test]
    async fn initial_send_happens_at_most_once() {
        let (manager, _sessions) = deps();
        let system = SystemId::generate();
        manager
            .submit(&system, ping_config("8.8.8.8"), PushPriority::Normal)
            .await
            .unwrap();

        manager.send_initial(&system).await;
        assert!(manager.config_sent.contains_key(&system));
        manager.send_initial(&system).await;
        assert_eq!(manager.config_sent.len(), 1);

        manager.reset_sent(&system);
        assert!(!manager.config_sent.contains_key(&system));
    }
}
