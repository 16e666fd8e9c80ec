//! Probe telemetry types
//!
//! Everything an agent measures and ships to the hub: per-target probe
//! results, the drained stats snapshot, host info, and the averages the hub
//! derives from persisted rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single probe run against one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// The measurement completed
    Success,
    /// The measurement ran but the target answered badly
    Error,
    /// The configured timeout expired first
    Timeout,
}

impl ProbeStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    /// Parses the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Parsed fping summary for one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    /// Lost packets as a percentage (0..=100)
    pub packet_loss: f64,
    /// Fastest round trip in milliseconds
    pub min_rtt: f64,
    /// Mean round trip in milliseconds
    pub avg_rtt: f64,
    /// Slowest round trip in milliseconds
    pub max_rtt: f64,
    /// When the run finished
    pub last_checked: DateTime<Utc>,
}

/// One DNS lookup outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsResult {
    /// Lookup outcome
    pub status: ProbeStatus,
    /// Wall-clock time across the exchange, milliseconds
    pub lookup_time: f64,
    /// RCODE name or transport error text when not successful
    pub error_code: Option<String>,
    /// When the lookup finished
    pub last_checked: DateTime<Utc>,
}

/// One HTTP GET outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResult {
    /// Request outcome; any HTTP response counts as success
    pub status: ProbeStatus,
    /// Time to drain the response, milliseconds
    pub response_time: f64,
    /// HTTP status code when a response arrived
    pub status_code: Option<u16>,
    /// `request_failed:<err>` on transport errors
    pub error_code: Option<String>,
    /// When the request finished
    pub last_checked: DateTime<Utc>,
}

/// One speedtest run outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedtestResult {
    /// Run outcome
    pub status: ProbeStatus,
    /// Download bandwidth, Mbps
    pub download_speed: f64,
    /// Upload bandwidth, Mbps
    pub upload_speed: f64,
    /// Idle latency, milliseconds
    pub latency: f64,
    /// Idle jitter, milliseconds
    pub jitter: f64,
    /// Bytes moved during the download phase
    pub download_bytes: u64,
    /// Bytes moved during the upload phase
    pub upload_bytes: u64,
    /// Failure detail when status is error
    pub error_code: Option<String>,
    /// When the run finished
    pub last_checked: DateTime<Utc>,
}

/// Ping entry in a drained snapshot, target identity inline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingEntry {
    /// Probed host
    pub host: String,
    /// Measurement
    #[serde(flatten)]
    pub result: PingResult,
}

/// DNS entry in a drained snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsEntry {
    /// Resolved name
    pub domain: String,
    /// Resolver used
    pub server: String,
    /// RR type
    pub record_type: String,
    /// Measurement
    #[serde(flatten)]
    pub result: DnsResult,
}

/// HTTP entry in a drained snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEntry {
    /// Requested URL
    pub url: String,
    /// Measurement
    #[serde(flatten)]
    pub result: HttpResult,
}

/// Speedtest entry in a drained snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedtestEntry {
    /// Requested server, when pinned
    pub server_id: Option<String>,
    /// Measurement
    #[serde(flatten)]
    pub result: SpeedtestResult,
}

/// One-shot drained snapshot of all probe classes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Ping results since the last drain
    pub ping: Vec<PingEntry>,
    /// DNS results since the last drain
    pub dns: Vec<DnsEntry>,
    /// HTTP results since the last drain
    pub http: Vec<HttpEntry>,
    /// Speedtest results since the last drain
    pub speedtest: Vec<SpeedtestEntry>,
}

impl Stats {
    /// True when no class produced anything since the last drain
    pub fn is_empty(&self) -> bool {
        self.ping.is_empty()
            && self.dns.is_empty()
            && self.http.is_empty()
            && self.speedtest.is_empty()
    }
}

/// Host identity and environment reported by the agent
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Host name
    #[serde(rename = "h", default)]
    pub hostname: String,
    /// Agent semver
    #[serde(rename = "v", default)]
    pub version: String,
    /// Public IP as seen by the geolocation service
    #[serde(rename = "ip", default)]
    pub public_ip: String,
    /// ISP name from geolocation
    #[serde(default)]
    pub isp: String,
    /// Autonomous system number from geolocation
    #[serde(default)]
    pub asn: String,
    /// Primary NIC link speed in Mbps, when detectable
    #[serde(rename = "nic", default, skip_serializing_if = "Option::is_none")]
    pub nic_speed_mbps: Option<f64>,
    /// Rolling mean ping RTT across this process lifetime, ms
    #[serde(rename = "ap", default, skip_serializing_if = "Option::is_none")]
    pub rolling_ping_rtt: Option<f64>,
    /// Rolling mean DNS lookup time across this process lifetime, ms
    #[serde(rename = "ad", default, skip_serializing_if = "Option::is_none")]
    pub rolling_dns_lookup: Option<f64>,
}

/// The unit of a hub sample: stats plus host info
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CombinedData {
    /// Drained probe results
    pub stats: Stats,
    /// Host info
    pub info: SystemInfo,
}

/// Current rolling averages stored on the system record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentAverages {
    /// Mean avg_rtt over the last ping rows, ms
    #[serde(rename = "ap", default)]
    pub ping_latency: f64,
    /// Mean packet loss over the last ping rows, percent
    #[serde(rename = "pl", default)]
    pub ping_packet_loss: f64,
    /// Mean lookup time over successful DNS rows, ms
    #[serde(rename = "ad", default)]
    pub dns_latency: f64,
    /// Failed DNS rows over all DNS rows, percent
    #[serde(rename = "df", default)]
    pub dns_failure_rate: f64,
    /// Mean response time over successful HTTP rows, ms
    #[serde(rename = "ah", default)]
    pub http_latency: f64,
    /// Failed HTTP rows over all HTTP rows, percent
    #[serde(rename = "hf", default)]
    pub http_failure_rate: f64,
    /// Mean download bandwidth over successful speedtest rows, Mbps
    #[serde(rename = "ds", default)]
    pub download_speed: f64,
    /// Mean upload bandwidth over successful speedtest rows, Mbps
    #[serde(rename = "us", default)]
    pub upload_speed: f64,
}

/// Rounds to two decimals, the precision every stored average uses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Mean of the provided values rounded to two decimals; 0 when empty.
pub fn mean2(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 { 0.0 } else { round2(sum / n as f64) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean2_rounds_and_handles_empty() {
        assert_eq!(mean2([9.1, 9.5, 9.9]), 9.5);
        assert_eq!(mean2([1.0, 2.0]), 1.5);
        assert_eq!(mean2(std::iter::empty()), 0.0);
        assert_eq!(mean2([0.333, 0.333, 0.333]), 0.33);
    }

    #[test]
    fn probe_status_round_trips_storage_form() {
        for s in [ProbeStatus::Success, ProbeStatus::Error, ProbeStatus::Timeout] {
            assert_eq!(ProbeStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ProbeStatus::parse("weird"), None);
    }

    #[test]
    fn system_info_uses_compact_json_keys() {
        let info = SystemInfo {
            hostname: "edge-1".to_string(),
            version: "0.5.0".to_string(),
            public_ip: "203.0.113.9".to_string(),
            isp: "ExampleNet".to_string(),
            asn: "AS64500".to_string(),
            nic_speed_mbps: Some(1000.0),
            rolling_ping_rtt: None,
            rolling_dns_lookup: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["v"], "0.5.0");
        assert_eq!(json["h"], "edge-1");
        assert!(json.get("rolling_ping_rtt").is_none());
    }

    #[test]
    fn current_averages_serialize_with_short_keys() {
        let avgs = CurrentAverages {
            ping_latency: 9.5,
            ..Default::default()
        };
        let json = serde_json::to_value(&avgs).unwrap();
        assert_eq!(json["ap"], 9.5);
        assert_eq!(json["ds"], 0.0);
    }
}
