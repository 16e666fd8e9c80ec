//! Bandwidth probing through the Ookla speedtest CLI
//!
//! Runs `speedtest -f json --accept-gdpr --accept-license`, optionally
//! pinned to a server id. Unlike every other probe class the fan-out is
//! sequential: concurrent bandwidth tests would contend for the same link
//! and corrupt each other's numbers. The subprocess is bounded by the
//! target timeout used as-is.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::{ProbeStatus, SpeedtestKey, SpeedtestResult, SpeedtestTarget};
use crate::time_provider::SharedClock;

use super::Prober;

/// The external binary this prober shells out to
pub const SPEEDTEST_BIN: &str = "speedtest";

/// Runs bandwidth tests, one target at a time
pub struct SpeedtestProber {
    clock: SharedClock,
}

impl SpeedtestProber {
    /// Creates the prober
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    async fn probe_one(&self, target: &SpeedtestTarget) -> SpeedtestResult {
        let target = target.clone().normalized();
        let mut cmd = tokio::process::Command::new(SPEEDTEST_BIN);
        cmd.args(["-f", "json", "--accept-gdpr", "--accept-license"]);
        if let Some(id) = &target.server_id {
            cmd.args(["--server-id", id]);
        }
        cmd.stdin(std::process::Stdio::null());

        let ran = tokio::time::timeout(target.timeout, cmd.output()).await;
        let now = self.clock.now();

        let failure = |status: ProbeStatus, error: Option<String>| SpeedtestResult {
            status,
            download_speed: 0.0,
            upload_speed: 0.0,
            latency: 0.0,
            jitter: 0.0,
            download_bytes: 0,
            upload_bytes: 0,
            error_code: error,
            last_checked: now,
        };

        let output = match ran {
            Err(_) => return failure(ProbeStatus::Timeout, None),
            Ok(Err(e)) => {
                warn!(error = %e, "speedtest failed to start");
                return failure(ProbeStatus::Error, Some(format!("exec_failed:{e}")));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return failure(
                ProbeStatus::Error,
                Some(format!("exit_{}:{}", output.status, stderr.trim())),
            );
        }

        match serde_json::from_slice::<CliReport>(&output.stdout) {
            Ok(report) => {
                debug!(
                    server = ?report.server.as_ref().map(|s| s.id),
                    "speedtest finished"
                );
                SpeedtestResult {
                    status: ProbeStatus::Success,
                    download_speed: bandwidth_mbps(report.download.bandwidth),
                    upload_speed: bandwidth_mbps(report.upload.bandwidth),
                    latency: report.ping.latency,
                    jitter: report.ping.jitter,
                    download_bytes: report.download.bytes,
                    upload_bytes: report.upload.bytes,
                    error_code: None,
                    last_checked: now,
                }
            }
            Err(e) => failure(ProbeStatus::Error, Some(format!("unmarshal_failed:{e}"))),
        }
    }
}

#[async_trait]
impl Prober for SpeedtestProber {
    type Target = SpeedtestTarget;
    type Key = SpeedtestKey;
    type Output = SpeedtestResult;

    fn class(&self) -> &'static str {
        "speedtest"
    }

    fn key(target: &Self::Target) -> Self::Key {
        target.key()
    }

    async fn probe_all(&self, targets: &[Self::Target]) -> Vec<(Self::Key, Self::Output)> {
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            let result = self.probe_one(target).await;
            out.push((target.key(), result));
        }
        out
    }
}

/// Converts the CLI's bytes-per-second bandwidth to megabits per second.
fn bandwidth_mbps(bytes_per_sec: u64) -> f64 {
    crate::domain::round2(bytes_per_sec as f64 * 8.0 / 1_000_000.0)
}

#[derive(Debug, Deserialize)]
struct CliReport {
    ping: CliPing,
    download: CliTransfer,
    upload: CliTransfer,
    #[serde(default)]
    server: Option<CliServer>,
}

#[derive(Debug, Deserialize)]
struct CliPing {
    #[serde(default)]
    jitter: f64,
    #[serde(default)]
    latency: f64,
}

#[derive(Debug, Deserialize)]
struct CliTransfer {
    #[serde(default)]
    bandwidth: u64,
    #[serde(default)]
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct CliServer {
    #[serde(default)]
    id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "type": "result",
        "ping": {"jitter": 0.8, "latency": 4.2},
        "download": {"bandwidth": 117515000, "bytes": 1200000000, "elapsed": 8000},
        "upload": {"bandwidth": 6037500, "bytes": 60000000, "elapsed": 8000},
        "server": {"id": 12345, "name": "Example ISP"}
    }"#;

    #[test]
    fn cli_report_parses_and_converts_bandwidth() {
        let report: CliReport = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(bandwidth_mbps(report.download.bandwidth), 940.12);
        assert_eq!(bandwidth_mbps(report.upload.bandwidth), 48.3);
        assert_eq!(report.ping.latency, 4.2);
        assert_eq!(report.server.unwrap().id, 12345);
    }

    #[test]
    fn malformed_report_is_rejected() {
        assert!(serde_json::from_str::<CliReport>("{\"type\":\"log\"}").is_err());
    }

    #[test]
    fn bandwidth_conversion_rounds_to_two_decimals() {
        assert_eq!(bandwidth_mbps(0), 0.0);
        assert_eq!(bandwidth_mbps(125_000), 1.0);
        assert_eq!(bandwidth_mbps(123_456), 0.99);
    }
}
