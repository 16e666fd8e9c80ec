//! Agent core
//!
//! Owns the four probe managers, the host info, and the snapshot cache.
//! The session layer calls [`Agent::apply_config`] on config frames and
//! [`Agent::gather_stats`] on data requests; everything else runs on the
//! probe managers' own schedules.

pub mod cli;
pub mod connection;
pub mod health;
pub mod session;
pub mod session_cache;
pub mod system_info;
pub mod update;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{
    CombinedData, DnsEntry, HttpEntry, MonitoringConfig, PingEntry, SpeedtestEntry, Stats,
    VersionedConfig,
};
use crate::domain_types::{ConfigHash, ConfigVersion};
use crate::probes::dns::DnsProber;
use crate::probes::http::HttpProber;
use crate::probes::ping::{FPING_BIN, PingProber};
use crate::probes::speedtest::{SPEEDTEST_BIN, SpeedtestProber};
use crate::probes::{PING_RESULT_GRACE, ProbeManager, ScheduleError, binary_available};
use crate::time_provider::SharedClock;
use session_cache::SessionCache;
use system_info::SystemInfoManager;

/// Agent construction failures
#[derive(Debug, Error)]
pub enum AgentError {
    /// The HTTP client could not be built
    #[error("http client init failed: {0}")]
    ClientInit(#[from] reqwest::Error),
}

/// Lifetime process-level means folded into the reported info
#[derive(Debug, Default)]
struct RollingMeans {
    ping_count: u64,
    ping_mean: f64,
    dns_count: u64,
    dns_mean: f64,
}

impl RollingMeans {
    fn fold(count: &mut u64, mean: &mut f64, value: f64) {
        *count += 1;
        *mean += (value - *mean) / *count as f64;
    }
}

/// The agent core: probe managers, host info, snapshot cache
pub struct Agent {
    ping: ProbeManager<PingProber>,
    dns: ProbeManager<DnsProber>,
    http: ProbeManager<HttpProber>,
    speedtest: ProbeManager<SpeedtestProber>,
    info: SystemInfoManager,
    cache: SessionCache,
    applied: Mutex<Option<(ConfigVersion, ConfigHash)>>,
    rolling: Mutex<RollingMeans>,
    fping_available: bool,
    speedtest_available: bool,
}

impl Agent {
    /// Builds the agent, probing for the external binaries it depends on.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ClientInit`] when the TLS backend cannot
    /// initialize.
    pub async fn new(info_refresh: Duration, clock: SharedClock) -> Result<Self, AgentError> {
        let fping_available = binary_available(FPING_BIN).await;
        if !fping_available {
            warn!("fping not found, ping probes unavailable");
        }
        let speedtest_available = binary_available(SPEEDTEST_BIN).await;
        if !speedtest_available {
            warn!("speedtest not found, bandwidth probes unavailable");
        }

        Ok(Self {
            ping: ProbeManager::with_retention(
                PingProber::new(Arc::clone(&clock)),
                Arc::clone(&clock),
                Some(PING_RESULT_GRACE),
            ),
            dns: ProbeManager::new(DnsProber::new(Arc::clone(&clock)), Arc::clone(&clock)),
            http: ProbeManager::new(HttpProber::new(Arc::clone(&clock))?, Arc::clone(&clock)),
            speedtest: ProbeManager::new(
                SpeedtestProber::new(Arc::clone(&clock)),
                Arc::clone(&clock),
            ),
            info: SystemInfoManager::new(info_refresh, Arc::clone(&clock))?,
            cache: SessionCache::new(session_cache::DEFAULT_LEASE, clock),
            applied: Mutex::new(None),
            rolling: Mutex::new(RollingMeans::default()),
            fping_available,
            speedtest_available,
        })
    }

    /// Starts the system-info refresh loop
    pub async fn start(&self) {
        self.info.start().await;
    }

    /// Applies a pushed configuration.
    ///
    /// The frame is applied only when its version increases or its content
    /// hash differs from what is already running; a stale or identical
    /// frame is ignored. Returns whether anything was applied.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when an interval fails to parse; the
    /// previous configuration keeps running then.
    pub async fn apply_config(&self, pushed: VersionedConfig) -> Result<bool, ScheduleError> {
        let hash = pushed.config.content_hash();
        {
            let applied = self.applied.lock().await;
            if let Some((version, running_hash)) = applied.as_ref() {
                if pushed.version <= *version && hash == *running_hash {
                    debug!(version = %pushed.version, "config frame ignored, nothing new");
                    return Ok(false);
                }
                if pushed.version < *version {
                    warn!(
                        stale = %pushed.version,
                        running = %version,
                        "stale config epoch rejected"
                    );
                    return Ok(false);
                }
            }
        }

        self.apply_classes(&pushed.config).await?;

        *self.applied.lock().await = Some((pushed.version, hash));
        self.cache.clear().await;
        info!(version = %pushed.version, "monitoring config applied");
        Ok(true)
    }

    async fn apply_classes(&self, config: &MonitoringConfig) -> Result<(), ScheduleError> {
        let ping_targets = if self.fping_available {
            config.ping.active_targets().to_vec()
        } else {
            if !config.ping.active_targets().is_empty() {
                warn!("ping targets configured but fping is unavailable, skipping class");
            }
            Vec::new()
        };
        self.ping
            .update_config(ping_targets, &config.ping.interval)
            .await?;

        self.dns
            .update_config(config.dns.active_targets().to_vec(), &config.dns.interval)
            .await?;

        self.http
            .update_config(config.http.active_targets().to_vec(), &config.http.interval)
            .await?;

        let speedtest_targets = if self.speedtest_available {
            config.speedtest.active_targets().to_vec()
        } else {
            if !config.speedtest.active_targets().is_empty() {
                warn!("speedtest targets configured but the CLI is unavailable, skipping class");
            }
            Vec::new()
        };
        self.speedtest
            .update_config(speedtest_targets, &config.speedtest.interval)
            .await?;

        Ok(())
    }

    /// Builds the snapshot for a sampling session.
    ///
    /// Drains the probe managers, so two rapid samples can legitimately
    /// return a partially empty stats block; the session cache bridges
    /// that for secondary sessions.
    pub async fn gather_stats(&self, session_id: &str) -> CombinedData {
        if let Some(cached) = self.cache.get(session_id).await {
            debug!(session_id, "serving cached snapshot");
            return cached;
        }

        let stats = self.drain_stats().await;
        self.update_rolling_means(&stats).await;
        let info = self.info.current().await;

        let data = CombinedData { stats, info };
        self.cache.put(session_id, data.clone()).await;
        data
    }

    /// Stops probe jobs and background refreshes
    pub async fn stop(&self) {
        self.ping.stop().await;
        self.dns.stop().await;
        self.http.stop().await;
        self.speedtest.stop().await;
        self.info.stop();
    }

    async fn drain_stats(&self) -> Stats {
        let ping = self
            .ping
            .get_results()
            .await
            .map(|results| {
                results
                    .into_iter()
                    .map(|(key, result)| PingEntry {
                        host: key.0,
                        result,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let dns = self
            .dns
            .get_results()
            .await
            .map(|results| {
                results
                    .into_iter()
                    .map(|(key, result)| DnsEntry {
                        domain: key.domain,
                        server: key.server,
                        record_type: key.record_type,
                        result,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let http = self
            .http
            .get_results()
            .await
            .map(|results| {
                results
                    .into_iter()
                    .map(|(key, result)| HttpEntry {
                        url: key.0,
                        result,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let speedtest = self
            .speedtest
            .get_results()
            .await
            .map(|results| {
                results
                    .into_iter()
                    .map(|(key, result)| SpeedtestEntry {
                        server_id: key.0,
                        result,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Stats {
            ping,
            dns,
            http,
            speedtest,
        }
    }

    async fn update_rolling_means(&self, stats: &Stats) {
        let mut rolling = self.rolling.lock().await;
        let rolling = &mut *rolling;
        for entry in &stats.ping {
            if entry.result.packet_loss < 100.0 {
                RollingMeans::fold(
                    &mut rolling.ping_count,
                    &mut rolling.ping_mean,
                    entry.result.avg_rtt,
                );
            }
        }
        for entry in &stats.dns {
            if entry.result.status == crate::domain::ProbeStatus::Success {
                RollingMeans::fold(
                    &mut rolling.dns_count,
                    &mut rolling.dns_mean,
                    entry.result.lookup_time,
                );
            }
        }

        let info = self.info.handle();
        let mut info = info.write().await;
        if rolling.ping_count > 0 {
            info.rolling_ping_rtt = Some(crate::domain::round2(rolling.ping_mean));
        }
        if rolling.dns_count > 0 {
            info.rolling_dns_lookup = Some(crate::domain::round2(rolling.dns_mean));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClassConfig, PingTarget};
    use crate::domain_types::ConfigVersion;
    use crate::time_provider::fast_forward_clock;

    fn versioned(version: i64, host: &str) -> VersionedConfig {
        VersionedConfig {
            config: MonitoringConfig {
                ping: ClassConfig {
                    enabled: true,
                    targets: vec![PingTarget {
                        host: host.to_string(),
                        count: 3,
                        timeout: Duration::from_secs(1),
                    }],
                    interval: String::new(),
                },
                ..Default::default()
            },
            version: ConfigVersion::try_new(version).unwrap(),
        }
    }

    #[tokio::test]
    async fn stale_config_epoch_is_ignored() {
        let agent = Agent::new(Duration::from_secs(3600), fast_forward_clock())
            .await
            .unwrap();

        assert!(agent.apply_config(versioned(100, "8.8.8.8")).await.unwrap());
        assert!(!agent.apply_config(versioned(99, "1.1.1.1")).await.unwrap());

        let applied = agent.applied.lock().await;
        let (version, _) = applied.as_ref().unwrap();
        assert_eq!(version.as_i64(), 100);
    }

    #[tokio::test]
    async fn identical_config_is_not_reapplied() {
        let agent = Agent::new(Duration::from_secs(3600), fast_forward_clock())
            .await
            .unwrap();

        assert!(agent.apply_config(versioned(100, "8.8.8.8")).await.unwrap());
        assert!(!agent.apply_config(versioned(100, "8.8.8.8")).await.unwrap());
    }

    #[tokio::test]
    async fn higher_version_with_new_content_applies() {
        let agent = Agent::new(Duration::from_secs(3600), fast_forward_clock())
            .await
            .unwrap();

        assert!(agent.apply_config(versioned(100, "8.8.8.8")).await.unwrap());
        assert!(agent.apply_config(versioned(101, "1.1.1.1")).await.unwrap());
    }

    #[tokio::test]
    async fn empty_snapshot_when_nothing_probed() {
        let agent = Agent::new(Duration::from_secs(3600), fast_forward_clock())
            .await
            .unwrap();
        let data = agent.gather_stats("session-1").await;
        assert!(data.stats.is_empty());
        assert!(!data.info.version.is_empty());
    }
}
