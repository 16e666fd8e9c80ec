//! Threshold alerts with hysteresis
//!
//! Alerts bind a metric, a threshold, and a minimum coverage in minutes.
//! With `min` of one the current sample's averages are compared directly;
//! larger windows reduce the recent `system_averages` trail. Latency, loss,
//! and failure-rate metrics fire above their threshold, bandwidth metrics
//! below. A triggered alert only clears on the reverse comparison, so a
//! value sitting on the threshold never flaps.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{CurrentAverages, mean2};
use crate::domain_types::SystemId;
use crate::storage::{AlertHistoryRow, AlertRecord, Repository, SharedRepository, StoreResult};
use crate::time_provider::SharedClock;

/// Metrics an alert can watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertMetric {
    /// Mean ping RTT, ms
    PingLatency,
    /// Mean packet loss, percent
    PingPacketLoss,
    /// Mean DNS lookup, ms
    DnsLatency,
    /// DNS failure rate, percent
    DnsFailureRate,
    /// Mean HTTP response, ms
    HttpLatency,
    /// HTTP failure rate, percent
    HttpFailureRate,
    /// Mean download bandwidth, Mbps
    DownloadSpeed,
    /// Mean upload bandwidth, Mbps
    UploadSpeed,
}

/// Which side of the threshold fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fires when the value exceeds the threshold
    Above,
    /// Fires when the value falls below the threshold
    Below,
}

impl AlertMetric {
    /// Parses the stored metric name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "PingLatency" => Some(Self::PingLatency),
            "PingPacketLoss" => Some(Self::PingPacketLoss),
            "DnsLatency" => Some(Self::DnsLatency),
            "DnsFailureRate" => Some(Self::DnsFailureRate),
            "HttpLatency" => Some(Self::HttpLatency),
            "HttpFailureRate" => Some(Self::HttpFailureRate),
            "DownloadSpeed" => Some(Self::DownloadSpeed),
            "UploadSpeed" => Some(Self::UploadSpeed),
            _ => None,
        }
    }

    /// Stored metric name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PingLatency => "PingLatency",
            Self::PingPacketLoss => "PingPacketLoss",
            Self::DnsLatency => "DnsLatency",
            Self::DnsFailureRate => "DnsFailureRate",
            Self::HttpLatency => "HttpLatency",
            Self::HttpFailureRate => "HttpFailureRate",
            Self::DownloadSpeed => "DownloadSpeed",
            Self::UploadSpeed => "UploadSpeed",
        }
    }

    /// Human name used in notification subjects
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PingLatency => "ping latency",
            Self::PingPacketLoss => "packet loss",
            Self::DnsLatency => "DNS lookup time",
            Self::DnsFailureRate => "DNS failure rate",
            Self::HttpLatency => "HTTP response time",
            Self::HttpFailureRate => "HTTP failure rate",
            Self::DownloadSpeed => "download speed",
            Self::UploadSpeed => "upload speed",
        }
    }

    /// Comparator side for this metric
    pub fn direction(&self) -> Direction {
        match self {
            Self::DownloadSpeed | Self::UploadSpeed => Direction::Below,
            _ => Direction::Above,
        }
    }

    /// Reads this metric from a current-averages snapshot
    pub fn from_averages(&self, averages: &CurrentAverages) -> f64 {
        match self {
            Self::PingLatency => averages.ping_latency,
            Self::PingPacketLoss => averages.ping_packet_loss,
            Self::DnsLatency => averages.dns_latency,
            Self::DnsFailureRate => averages.dns_failure_rate,
            Self::HttpLatency => averages.http_latency,
            Self::HttpFailureRate => averages.http_failure_rate,
            Self::DownloadSpeed => averages.download_speed,
            Self::UploadSpeed => averages.upload_speed,
        }
    }

    fn from_history_row(&self, row: &crate::storage::AveragesRow) -> f64 {
        match self {
            Self::PingLatency => row.ping_latency,
            Self::PingPacketLoss => row.ping_packet_loss,
            Self::DnsLatency => row.dns_latency,
            Self::DnsFailureRate => row.dns_failure_rate,
            Self::HttpLatency => row.http_latency,
            Self::HttpFailureRate => row.http_failure_rate,
            Self::DownloadSpeed => row.download_speed,
            Self::UploadSpeed => row.upload_speed,
        }
    }
}

/// Delivery seam for alert notifications; the default logs them
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Emits one notification
    async fn notify(&self, subject: &str, body: &str);
}

/// Notifier that writes to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        info!(subject, body, "notification");
    }
}

/// Shared notifier handle
pub type SharedNotifier = Arc<dyn Notifier>;

fn fires(direction: Direction, value: f64, threshold: f64) -> bool {
    match direction {
        Direction::Above => value > threshold,
        Direction::Below => value < threshold,
    }
}

fn clears(direction: Direction, value: f64, threshold: f64) -> bool {
    match direction {
        Direction::Above => value < threshold,
        Direction::Below => value > threshold,
    }
}

fn subject(system_name: &str, metric: AlertMetric, triggered: bool) -> String {
    let side = match (metric.direction(), triggered) {
        (Direction::Above, true) | (Direction::Below, false) => "above",
        _ => "below",
    };
    format!(
        "{system_name}: {} {side} threshold",
        metric.display_name()
    )
}

fn body(metric: AlertMetric, value: f64, threshold: f64, min: u32) -> String {
    format!(
        "{} is {value:.2} (threshold {threshold:.2}, window {min} min)",
        metric.display_name()
    )
}

/// Evaluates every alert of a system against the newest sample.
///
/// `current` is the just-computed averages snapshot; windowed alerts
/// reduce the `system_averages` trail instead. Exactly one notification
/// is emitted per transition and the alert record plus its history row are
/// kept in step.
///
/// # Errors
///
/// Propagates repository failures; evaluation of the remaining alerts
/// stops there and resumes on the next sample.
pub async fn evaluate_system(
    repo: &SharedRepository,
    notifier: &SharedNotifier,
    system: &SystemId,
    system_name: &str,
    current: &CurrentAverages,
    clock: &SharedClock,
) -> StoreResult<()> {
    let alerts = repo.list_alerts(system).await?;
    for alert in alerts {
        let Some(metric) = AlertMetric::parse(&alert.name) else {
            debug!(name = %alert.name, "unknown alert metric skipped");
            continue;
        };

        let value = if alert.min <= 1 {
            metric.from_averages(current)
        } else {
            let since = clock.now() - ChronoDuration::minutes(i64::from(alert.min));
            let window = repo.averages_window(system, since).await?;
            if (window.len() as u32) < alert.min {
                debug!(
                    name = %alert.name,
                    rows = window.len(),
                    min = alert.min,
                    "window coverage too thin, alert skipped"
                );
                continue;
            }
            mean2(window.iter().map(|row| metric.from_history_row(row)))
        };

        apply_transition(repo, notifier, system_name, alert, metric, value, clock).await?;
    }
    Ok(())
}

async fn apply_transition(
    repo: &SharedRepository,
    notifier: &SharedNotifier,
    system_name: &str,
    mut alert: AlertRecord,
    metric: AlertMetric,
    value: f64,
    clock: &SharedClock,
) -> StoreResult<()> {
    let direction = metric.direction();

    if !alert.triggered && fires(direction, value, alert.value) {
        alert.triggered = true;
        repo.save_alert(&alert).await?;
        repo.insert_alert_history(&AlertHistoryRow {
            user: alert.user.clone(),
            system: alert.system.clone(),
            name: alert.name.clone(),
            value,
            created: clock.now(),
            resolved: None,
        })
        .await?;
        warn!(system = system_name, metric = metric.as_str(), value, "alert triggered");
        notifier
            .notify(
                &subject(system_name, metric, true),
                &body(metric, value, alert.value, alert.min),
            )
            .await;
    } else if alert.triggered && clears(direction, value, alert.value) {
        alert.triggered = false;
        repo.save_alert(&alert).await?;
        repo.resolve_alert_history(&alert.user, &alert.system, &alert.name, clock.now())
            .await?;
        info!(system = system_name, metric = metric.as_str(), value, "alert cleared");
        notifier
            .notify(
                &subject(system_name, metric, false),
                &body(metric, value, alert.value, alert.min),
            )
            .await;
    }
    Ok(())
}

/// Fires or clears the up/down status alert for a system.
pub async fn status_alert(
    notifier: &SharedNotifier,
    system_name: &str,
    went_down: bool,
) {
    let subject = if went_down {
        format!("{system_name} is down")
    } else {
        format!("{system_name} is up")
    };
    notifier.notify(&subject, &subject).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRepository;
    use crate::storage::AveragesRow;
    use crate::time_provider::system_clock;
    use std::sync::Mutex;

    /// Notifier that records every emission
    #[derive(Default)]
    struct CapturingNotifier {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for CapturingNotifier {
        async fn notify(&self, subject: &str, _body: &str) {
            self.sent.lock().unwrap().push(subject.to_string());
        }
    }

    fn averages(ping: f64) -> CurrentAverages {
        CurrentAverages {
            ping_latency: ping,
            ..Default::default()
        }
    }

    fn history_row(system: &SystemId, ping: f64, minutes_ago: i64) -> AveragesRow {
        AveragesRow {
            system: system.clone(),
            ping_latency: ping,
            ping_packet_loss: 0.0,
            dns_latency: 0.0,
            dns_failure_rate: 0.0,
            http_latency: 0.0,
            http_failure_rate: 0.0,
            download_speed: 0.0,
            upload_speed: 0.0,
            created: chrono::Utc::now() - ChronoDuration::minutes(minutes_ago),
        }
    }

    async fn setup(min: u32) -> (SharedRepository, Arc<CapturingNotifier>, SystemId) {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let system = SystemId::generate();
        repo.save_alert(&AlertRecord {
            user: "ops".to_string(),
            system: system.clone(),
            name: "PingLatency".to_string(),
            value: 50.0,
            min,
            triggered: false,
        })
        .await
        .unwrap();
        (repo, Arc::new(CapturingNotifier::default()), system)
    }

    #[tokio::test]
    async fn min_one_fires_on_first_crossing() {
        let (repo, capture, system) = setup(1).await;
        let notifier: SharedNotifier = Arc::clone(&capture) as SharedNotifier;
        let clock = system_clock();

        evaluate_system(&repo, &notifier, &system, "edge-1", &averages(62.0), &clock)
            .await
            .unwrap();

        let alerts = repo.list_alerts(&system).await.unwrap();
        assert!(alerts[0].triggered);
        let sent = capture.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["edge-1: ping latency above threshold"]);
    }

    #[tokio::test]
    async fn single_transition_per_crossing() {
        let (repo, capture, system) = setup(1).await;
        let notifier: SharedNotifier = Arc::clone(&capture) as SharedNotifier;
        let clock = system_clock();

        for value in [62.0, 70.0, 65.0] {
            evaluate_system(&repo, &notifier, &system, "edge-1", &averages(value), &clock)
                .await
                .unwrap();
        }
        assert_eq!(capture.sent.lock().unwrap().len(), 1);

        evaluate_system(&repo, &notifier, &system, "edge-1", &averages(40.0), &clock)
            .await
            .unwrap();
        let sent = capture.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], "edge-1: ping latency below threshold");
        assert!(!repo.list_alerts(&system).await.unwrap()[0].triggered);
    }

    #[tokio::test]
    async fn value_on_the_threshold_never_flaps() {
        let (repo, capture, system) = setup(1).await;
        let notifier: SharedNotifier = Arc::clone(&capture) as SharedNotifier;
        let clock = system_clock();

        evaluate_system(&repo, &notifier, &system, "edge-1", &averages(50.0), &clock)
            .await
            .unwrap();
        assert!(capture.sent.lock().unwrap().is_empty());

        // trigger, then sit exactly on the threshold: stays triggered
        evaluate_system(&repo, &notifier, &system, "edge-1", &averages(62.0), &clock)
            .await
            .unwrap();
        evaluate_system(&repo, &notifier, &system, "edge-1", &averages(50.0), &clock)
            .await
            .unwrap();
        assert!(repo.list_alerts(&system).await.unwrap()[0].triggered);
        assert_eq!(capture.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn windowed_alert_needs_coverage_and_uses_the_window_mean() {
        let (repo, capture, system) = setup(3).await;
        let notifier: SharedNotifier = Arc::clone(&capture) as SharedNotifier;
        let clock = system_clock();

        // Only one row in the window: not enough coverage.
        repo.insert_averages_row(&history_row(&system, 80.0, 1)).await.unwrap();
        evaluate_system(&repo, &notifier, &system, "edge-1", &averages(80.0), &clock)
            .await
            .unwrap();
        assert!(capture.sent.lock().unwrap().is_empty());

        // Three rows averaging 62: fires regardless of the current sample.
        repo.insert_averages_row(&history_row(&system, 50.0, 2)).await.unwrap();
        repo.insert_averages_row(&history_row(&system, 56.0, 0)).await.unwrap();
        evaluate_system(&repo, &notifier, &system, "edge-1", &averages(10.0), &clock)
            .await
            .unwrap();

        let sent = capture.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["edge-1: ping latency above threshold"]);
    }

    #[tokio::test]
    async fn speed_alerts_fire_below_threshold() {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let system = SystemId::generate();
        repo.save_alert(&AlertRecord {
            user: "ops".to_string(),
            system: system.clone(),
            name: "DownloadSpeed".to_string(),
            value: 500.0,
            min: 1,
            triggered: false,
        })
        .await
        .unwrap();
        let capture = Arc::new(CapturingNotifier::default());
        let notifier: SharedNotifier = Arc::clone(&capture) as SharedNotifier;
        let clock = system_clock();

        let slow = CurrentAverages {
            download_speed: 120.0,
            ..Default::default()
        };
        evaluate_system(&repo, &notifier, &system, "edge-1", &slow, &clock)
            .await
            .unwrap();
        let sent = capture.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["edge-1: download speed below threshold"]);
    }
}
