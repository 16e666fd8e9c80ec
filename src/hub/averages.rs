//! Rolling averages over persisted stats rows
//!
//! Current averages reduce the newest ten rows per probe class and land on
//! the system record after every sample. The same reductions run on a
//! five-minute cron for the historical `system_averages` trail.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{CurrentAverages, ProbeStatus, mean2, round2};
use crate::domain_types::SystemId;
use crate::storage::{AveragesRow, Repository, SharedRepository, StoreResult};
use crate::time_provider::SharedClock;

/// Rows per class feeding the current averages
pub const AVERAGING_WINDOW_ROWS: u32 = 10;
/// Period of the historical averages job
pub const HISTORICAL_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Failure share of `total`, as a rounded percentage.
fn failure_rate(failures: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(failures as f64 * 100.0 / total as f64)
    }
}

/// Reduces the newest ten rows per class into [`CurrentAverages`].
///
/// # Errors
///
/// Propagates repository failures; an empty window reduces to zeros.
pub async fn compute_current(
    repo: &SharedRepository,
    system: &SystemId,
) -> StoreResult<CurrentAverages> {
    let ping = repo.recent_ping_rows(system, AVERAGING_WINDOW_ROWS).await?;
    let dns = repo.recent_dns_rows(system, AVERAGING_WINDOW_ROWS).await?;
    let http = repo.recent_http_rows(system, AVERAGING_WINDOW_ROWS).await?;
    let speedtest = repo
        .recent_speedtest_rows(system, AVERAGING_WINDOW_ROWS)
        .await?;

    let dns_failures = dns
        .iter()
        .filter(|r| r.status != ProbeStatus::Success)
        .count();
    let http_failures = http
        .iter()
        .filter(|r| r.status != ProbeStatus::Success)
        .count();

    Ok(CurrentAverages {
        ping_latency: mean2(ping.iter().map(|r| r.avg_rtt)),
        ping_packet_loss: mean2(ping.iter().map(|r| r.packet_loss)),
        dns_latency: mean2(
            dns.iter()
                .filter(|r| r.status == ProbeStatus::Success)
                .map(|r| r.lookup_time),
        ),
        dns_failure_rate: failure_rate(dns_failures, dns.len()),
        http_latency: mean2(
            http.iter()
                .filter(|r| r.status == ProbeStatus::Success)
                .map(|r| r.response_time),
        ),
        http_failure_rate: failure_rate(http_failures, http.len()),
        download_speed: mean2(
            speedtest
                .iter()
                .filter(|r| r.status == ProbeStatus::Success)
                .map(|r| r.download_speed),
        ),
        upload_speed: mean2(
            speedtest
                .iter()
                .filter(|r| r.status == ProbeStatus::Success)
                .map(|r| r.upload_speed),
        ),
    })
}

/// Materializes current averages into a historical row.
pub fn to_row(system: &SystemId, averages: &CurrentAverages, at: DateTime<Utc>) -> AveragesRow {
    AveragesRow {
        system: system.clone(),
        ping_latency: averages.ping_latency,
        ping_packet_loss: averages.ping_packet_loss,
        dns_latency: averages.dns_latency,
        dns_failure_rate: averages.dns_failure_rate,
        http_latency: averages.http_latency,
        http_failure_rate: averages.http_failure_rate,
        download_speed: averages.download_speed,
        upload_speed: averages.upload_speed,
        created: at,
    }
}

/// Recomputes and persists averages for every up system once.
pub async fn snapshot_all(repo: &SharedRepository, clock: &SharedClock) {
    let systems = match repo.find_systems().await {
        Ok(systems) => systems,
        Err(e) => {
            warn!(error = %e, "averages snapshot skipped, systems unreadable");
            return;
        }
    };

    for record in systems.iter().filter(|s| s.status.is_up()) {
        match compute_current(repo, &record.id).await {
            Ok(averages) => {
                let row = to_row(&record.id, &averages, clock.now());
                if let Err(e) = repo.insert_averages_row(&row).await {
                    warn!(system_id = %record.id, error = %e, "averages row insert failed");
                }
            }
            Err(e) => warn!(system_id = %record.id, error = %e, "averages compute failed"),
        }
    }
    debug!(systems = systems.len(), "historical averages snapshot done");
}

/// Runs [`snapshot_all`] every five minutes until cancelled.
pub async fn run_historical_job(
    repo: SharedRepository,
    clock: SharedClock,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = clock.sleep(HISTORICAL_PERIOD) => {}
        }
        snapshot_all(&repo, &clock).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRepository;
    use crate::storage::{DnsRow, PingRow, SpeedtestRow};
    use std::sync::Arc;

    fn ping_row(system: &SystemId, avg: f64, seq: i64) -> PingRow {
        PingRow {
            system: system.clone(),
            host: "8.8.8.8".to_string(),
            packet_loss: 0.0,
            min_rtt: avg - 0.4,
            max_rtt: avg + 0.4,
            avg_rtt: avg,
            created: Utc::now() + chrono::Duration::seconds(seq),
        }
    }

    fn dns_row(system: &SystemId, ok: bool, lookup: f64, seq: i64) -> DnsRow {
        DnsRow {
            system: system.clone(),
            domain: "example.org".to_string(),
            server: "1.1.1.1".to_string(),
            record_type: "A".to_string(),
            status: if ok {
                ProbeStatus::Success
            } else {
                ProbeStatus::Error
            },
            lookup_time: lookup,
            error_code: (!ok).then(|| "SERVFAIL".to_string()),
            created: Utc::now() + chrono::Duration::seconds(seq),
        }
    }

    #[tokio::test]
    async fn window_is_exactly_ten_rows() {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let system = SystemId::generate();

        // 12 rows: 11.0..=22.0; only the newest 10 (13.0..=22.0) count.
        for i in 0..12 {
            repo.insert_ping_row(&ping_row(&system, 11.0 + f64::from(i), i64::from(i)))
                .await
                .unwrap();
        }

        let averages = compute_current(&repo, &system).await.unwrap();
        assert_eq!(averages.ping_latency, 17.5);
        assert_eq!(averages.ping_packet_loss, 0.0);
    }

    #[tokio::test]
    async fn dns_latency_averages_successes_and_rate_counts_all() {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let system = SystemId::generate();

        repo.insert_dns_row(&dns_row(&system, true, 10.0, 0)).await.unwrap();
        repo.insert_dns_row(&dns_row(&system, true, 20.0, 1)).await.unwrap();
        repo.insert_dns_row(&dns_row(&system, false, 500.0, 2)).await.unwrap();
        repo.insert_dns_row(&dns_row(&system, false, 500.0, 3)).await.unwrap();

        let averages = compute_current(&repo, &system).await.unwrap();
        assert_eq!(averages.dns_latency, 15.0);
        assert_eq!(averages.dns_failure_rate, 50.0);
    }

    #[tokio::test]
    async fn empty_window_reduces_to_zeros() {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let system = SystemId::generate();
        let averages = compute_current(&repo, &system).await.unwrap();
        assert_eq!(averages, CurrentAverages::default());
    }

    #[tokio::test]
    async fn speed_means_skip_failed_runs() {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let system = SystemId::generate();

        for (ok, down, seq) in [(true, 900.0, 0), (true, 950.0, 1), (false, 0.0, 2)] {
            repo.insert_speedtest_row(&SpeedtestRow {
                system: system.clone(),
                server_id: None,
                status: if ok {
                    ProbeStatus::Success
                } else {
                    ProbeStatus::Error
                },
                download_speed: down,
                upload_speed: down / 20.0,
                latency: 4.0,
                jitter: 0.5,
                download_bytes: 0,
                upload_bytes: 0,
                error_code: None,
                created: Utc::now() + chrono::Duration::seconds(seq),
            })
            .await
            .unwrap();
        }

        let averages = compute_current(&repo, &system).await.unwrap();
        assert_eq!(averages.download_speed, 925.0);
        assert_eq!(averages.upload_speed, 46.25);
    }
}
