//! Session protocol frames and codecs
//!
//! The duplex channel carries two message families: control frames as JSON
//! text (config push, sampling, keepalive, teardown) and telemetry as CBOR
//! binary with integer keys. Field ids live in [`fields`], decoupled from the
//! Rust struct definitions.

pub mod fields;

use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    CombinedData, DnsEntry, DnsResult, HttpEntry, HttpResult, PingEntry, PingResult, ProbeStatus,
    SpeedtestEntry, SpeedtestResult, Stats, SystemInfo, VersionedConfig,
};

/// Header carrying the agent auth token
pub const HEADER_TOKEN: &str = "X-Token";
/// Header carrying the agent semver
pub const HEADER_VERSION: &str = "X-Beszel";
/// Header carrying the normalized shared key
pub const HEADER_KEY: &str = "X-Key";

/// Prefix every normalized shared key carries
pub const KEY_PREFIX: &str = "base64:";

/// Ensures the `base64:` prefix on a shared key value.
pub fn normalize_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with(KEY_PREFIX) {
        trimmed.to_string()
    } else {
        format!("{KEY_PREFIX}{trimmed}")
    }
}

/// Control frames exchanged as JSON text messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Hub to agent: replace probe-manager state
    Config(VersionedConfig),
    /// Hub to agent: request a fresh snapshot
    DataRequest,
    /// Keepalive, either direction
    Ping,
    /// Keepalive reply
    Pong,
    /// Graceful teardown with a reason
    Close {
        /// Why the sender is closing
        reason: String,
    },
}

impl ControlFrame {
    /// Serializes to the JSON text payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::ControlEncode`] when serialization fails, which
    /// only happens for non-string map keys and never for these frames.
    pub fn to_json(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::ControlEncode)
    }

    /// Parses a JSON text payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::ControlDecode`] on malformed or unknown frames.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(WireError::ControlDecode)
    }
}

/// Codec failures on either side of the session
#[derive(Debug, Error)]
pub enum WireError {
    /// Control frame could not be serialized
    #[error("control frame encode failed: {0}")]
    ControlEncode(#[source] serde_json::Error),
    /// Control frame could not be parsed
    #[error("control frame decode failed: {0}")]
    ControlDecode(#[source] serde_json::Error),
    /// Telemetry could not be serialized
    #[error("telemetry encode failed: {0}")]
    Encode(#[source] ciborium::ser::Error<std::io::Error>),
    /// Telemetry bytes were not valid CBOR
    #[error("telemetry decode failed: {0}")]
    Decode(#[source] ciborium::de::Error<std::io::Error>),
    /// Telemetry CBOR was structurally wrong
    #[error("telemetry payload malformed at {context}")]
    Malformed {
        /// Which field or level failed
        context: &'static str,
    },
}

fn key(id: u64) -> Value {
    Value::Integer(id.into())
}

fn malformed(context: &'static str) -> WireError {
    WireError::Malformed { context }
}

fn status_code(status: ProbeStatus) -> u64 {
    match status {
        ProbeStatus::Success => fields::status::SUCCESS,
        ProbeStatus::Error => fields::status::ERROR,
        ProbeStatus::Timeout => fields::status::TIMEOUT,
    }
}

fn status_from_code(code: u64) -> Option<ProbeStatus> {
    match code {
        fields::status::SUCCESS => Some(ProbeStatus::Success),
        fields::status::ERROR => Some(ProbeStatus::Error),
        fields::status::TIMEOUT => Some(ProbeStatus::Timeout),
        _ => None,
    }
}

fn millis(ts: chrono::DateTime<chrono::Utc>) -> Value {
    Value::Integer(ts.timestamp_millis().into())
}

fn opt_text(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn encode_ping(e: &PingEntry) -> Value {
    Value::Map(vec![
        (key(fields::ping::HOST), Value::Text(e.host.clone())),
        (key(fields::ping::PACKET_LOSS), Value::Float(e.result.packet_loss)),
        (key(fields::ping::MIN_RTT), Value::Float(e.result.min_rtt)),
        (key(fields::ping::AVG_RTT), Value::Float(e.result.avg_rtt)),
        (key(fields::ping::MAX_RTT), Value::Float(e.result.max_rtt)),
        (key(fields::ping::LAST_CHECKED), millis(e.result.last_checked)),
    ])
}

fn encode_dns(e: &DnsEntry) -> Value {
    Value::Map(vec![
        (key(fields::dns::DOMAIN), Value::Text(e.domain.clone())),
        (key(fields::dns::SERVER), Value::Text(e.server.clone())),
        (key(fields::dns::RECORD_TYPE), Value::Text(e.record_type.clone())),
        (
            key(fields::dns::STATUS),
            Value::Integer(status_code(e.result.status).into()),
        ),
        (key(fields::dns::LOOKUP_TIME), Value::Float(e.result.lookup_time)),
        (key(fields::dns::ERROR_CODE), opt_text(&e.result.error_code)),
        (key(fields::dns::LAST_CHECKED), millis(e.result.last_checked)),
    ])
}

fn encode_http(e: &HttpEntry) -> Value {
    Value::Map(vec![
        (key(fields::http::URL), Value::Text(e.url.clone())),
        (
            key(fields::http::STATUS),
            Value::Integer(status_code(e.result.status).into()),
        ),
        (
            key(fields::http::RESPONSE_TIME),
            Value::Float(e.result.response_time),
        ),
        (
            key(fields::http::STATUS_CODE),
            match e.result.status_code {
                Some(c) => Value::Integer(u64::from(c).into()),
                None => Value::Null,
            },
        ),
        (key(fields::http::ERROR_CODE), opt_text(&e.result.error_code)),
        (key(fields::http::LAST_CHECKED), millis(e.result.last_checked)),
    ])
}

fn encode_speedtest(e: &SpeedtestEntry) -> Value {
    Value::Map(vec![
        (key(fields::speedtest::SERVER_ID), opt_text(&e.server_id)),
        (
            key(fields::speedtest::STATUS),
            Value::Integer(status_code(e.result.status).into()),
        ),
        (
            key(fields::speedtest::DOWNLOAD_SPEED),
            Value::Float(e.result.download_speed),
        ),
        (
            key(fields::speedtest::UPLOAD_SPEED),
            Value::Float(e.result.upload_speed),
        ),
        (key(fields::speedtest::LATENCY), Value::Float(e.result.latency)),
        (key(fields::speedtest::JITTER), Value::Float(e.result.jitter)),
        (
            key(fields::speedtest::DOWNLOAD_BYTES),
            Value::Integer(e.result.download_bytes.into()),
        ),
        (
            key(fields::speedtest::UPLOAD_BYTES),
            Value::Integer(e.result.upload_bytes.into()),
        ),
        (key(fields::speedtest::ERROR_CODE), opt_text(&e.result.error_code)),
        (
            key(fields::speedtest::LAST_CHECKED),
            millis(e.result.last_checked),
        ),
    ])
}

fn encode_info(info: &SystemInfo) -> Value {
    let mut entries = vec![
        (key(fields::info::HOSTNAME), Value::Text(info.hostname.clone())),
        (key(fields::info::VERSION), Value::Text(info.version.clone())),
        (key(fields::info::PUBLIC_IP), Value::Text(info.public_ip.clone())),
        (key(fields::info::ISP), Value::Text(info.isp.clone())),
        (key(fields::info::ASN), Value::Text(info.asn.clone())),
    ];
    if let Some(nic) = info.nic_speed_mbps {
        entries.push((key(fields::info::NIC_SPEED), Value::Float(nic)));
    }
    if let Some(rtt) = info.rolling_ping_rtt {
        entries.push((key(fields::info::ROLLING_PING), Value::Float(rtt)));
    }
    if let Some(lookup) = info.rolling_dns_lookup {
        entries.push((key(fields::info::ROLLING_DNS), Value::Float(lookup)));
    }
    Value::Map(entries)
}

/// Encodes a snapshot for the wire.
///
/// # Errors
///
/// Returns [`WireError::Encode`] when the CBOR writer fails.
pub fn encode_combined(data: &CombinedData) -> Result<Vec<u8>, WireError> {
    let stats = Value::Map(vec![
        (
            key(fields::stats::PING),
            Value::Array(data.stats.ping.iter().map(encode_ping).collect()),
        ),
        (
            key(fields::stats::DNS),
            Value::Array(data.stats.dns.iter().map(encode_dns).collect()),
        ),
        (
            key(fields::stats::HTTP),
            Value::Array(data.stats.http.iter().map(encode_http).collect()),
        ),
        (
            key(fields::stats::SPEEDTEST),
            Value::Array(data.stats.speedtest.iter().map(encode_speedtest).collect()),
        ),
    ]);
    let combined = Value::Map(vec![
        (key(fields::combined::STATS), stats),
        (key(fields::combined::INFO), encode_info(&data.info)),
    ]);

    let mut buf = Vec::new();
    ciborium::ser::into_writer(&combined, &mut buf).map_err(WireError::Encode)?;
    Ok(buf)
}

fn map_entries(value: &Value, context: &'static str) -> Result<Vec<(u64, Value)>, WireError> {
    let Value::Map(entries) = value else {
        return Err(malformed(context));
    };
    let mut out = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let Value::Integer(id) = k else {
            return Err(malformed(context));
        };
        let id = u64::try_from(i128::from(*id)).map_err(|_| malformed(context))?;
        out.push((id, v.clone()));
    }
    Ok(out)
}

fn field<'a>(entries: &'a [(u64, Value)], id: u64) -> Option<&'a Value> {
    entries.iter().find(|(k, _)| *k == id).map(|(_, v)| v)
}

fn f64_field(
    entries: &[(u64, Value)],
    id: u64,
    context: &'static str,
) -> Result<f64, WireError> {
    match field(entries, id) {
        Some(Value::Float(f)) => Ok(*f),
        Some(Value::Integer(i)) => {
            let i = i128::from(*i);
            Ok(i as f64)
        }
        _ => Err(malformed(context)),
    }
}

fn text_field(
    entries: &[(u64, Value)],
    id: u64,
    context: &'static str,
) -> Result<String, WireError> {
    match field(entries, id) {
        Some(Value::Text(s)) => Ok(s.clone()),
        _ => Err(malformed(context)),
    }
}

fn opt_text_field(entries: &[(u64, Value)], id: u64) -> Option<String> {
    match field(entries, id) {
        Some(Value::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn u64_field(
    entries: &[(u64, Value)],
    id: u64,
    context: &'static str,
) -> Result<u64, WireError> {
    match field(entries, id) {
        Some(Value::Integer(i)) => u64::try_from(i128::from(*i)).map_err(|_| malformed(context)),
        _ => Err(malformed(context)),
    }
}

fn timestamp_field(
    entries: &[(u64, Value)],
    id: u64,
    context: &'static str,
) -> Result<chrono::DateTime<chrono::Utc>, WireError> {
    match field(entries, id) {
        Some(Value::Integer(i)) => {
            let ms = i64::try_from(i128::from(*i)).map_err(|_| malformed(context))?;
            chrono::DateTime::from_timestamp_millis(ms).ok_or_else(|| malformed(context))
        }
        _ => Err(malformed(context)),
    }
}

fn status_field(
    entries: &[(u64, Value)],
    id: u64,
    context: &'static str,
) -> Result<ProbeStatus, WireError> {
    let code = u64_field(entries, id, context)?;
    status_from_code(code).ok_or_else(|| malformed(context))
}

fn decode_ping(value: &Value) -> Result<PingEntry, WireError> {
    let e = map_entries(value, "ping entry")?;
    Ok(PingEntry {
        host: text_field(&e, fields::ping::HOST, "ping.host")?,
        result: PingResult {
            packet_loss: f64_field(&e, fields::ping::PACKET_LOSS, "ping.packet_loss")?,
            min_rtt: f64_field(&e, fields::ping::MIN_RTT, "ping.min_rtt")?,
            avg_rtt: f64_field(&e, fields::ping::AVG_RTT, "ping.avg_rtt")?,
            max_rtt: f64_field(&e, fields::ping::MAX_RTT, "ping.max_rtt")?,
            last_checked: timestamp_field(&e, fields::ping::LAST_CHECKED, "ping.last_checked")?,
        },
    })
}

fn decode_dns(value: &Value) -> Result<DnsEntry, WireError> {
    let e = map_entries(value, "dns entry")?;
    Ok(DnsEntry {
        domain: text_field(&e, fields::dns::DOMAIN, "dns.domain")?,
        server: text_field(&e, fields::dns::SERVER, "dns.server")?,
        record_type: text_field(&e, fields::dns::RECORD_TYPE, "dns.record_type")?,
        result: DnsResult {
            status: status_field(&e, fields::dns::STATUS, "dns.status")?,
            lookup_time: f64_field(&e, fields::dns::LOOKUP_TIME, "dns.lookup_time")?,
            error_code: opt_text_field(&e, fields::dns::ERROR_CODE),
            last_checked: timestamp_field(&e, fields::dns::LAST_CHECKED, "dns.last_checked")?,
        },
    })
}

fn decode_http(value: &Value) -> Result<HttpEntry, WireError> {
    let e = map_entries(value, "http entry")?;
    let status_code = match field(&e, fields::http::STATUS_CODE) {
        Some(Value::Integer(i)) => {
            Some(u16::try_from(i128::from(*i)).map_err(|_| malformed("http.status_code"))?)
        }
        _ => None,
    };
    Ok(HttpEntry {
        url: text_field(&e, fields::http::URL, "http.url")?,
        result: HttpResult {
            status: status_field(&e, fields::http::STATUS, "http.status")?,
            response_time: f64_field(&e, fields::http::RESPONSE_TIME, "http.response_time")?,
            status_code,
            error_code: opt_text_field(&e, fields::http::ERROR_CODE),
            last_checked: timestamp_field(&e, fields::http::LAST_CHECKED, "http.last_checked")?,
        },
    })
}

fn decode_speedtest(value: &Value) -> Result<SpeedtestEntry, WireError> {
    let e = map_entries(value, "speedtest entry")?;
    Ok(SpeedtestEntry {
        server_id: opt_text_field(&e, fields::speedtest::SERVER_ID),
        result: SpeedtestResult {
            status: status_field(&e, fields::speedtest::STATUS, "speedtest.status")?,
            download_speed: f64_field(
                &e,
                fields::speedtest::DOWNLOAD_SPEED,
                "speedtest.download_speed",
            )?,
            upload_speed: f64_field(
                &e,
                fields::speedtest::UPLOAD_SPEED,
                "speedtest.upload_speed",
            )?,
            latency: f64_field(&e, fields::speedtest::LATENCY, "speedtest.latency")?,
            jitter: f64_field(&e, fields::speedtest::JITTER, "speedtest.jitter")?,
            download_bytes: u64_field(
                &e,
                fields::speedtest::DOWNLOAD_BYTES,
                "speedtest.download_bytes",
            )?,
            upload_bytes: u64_field(
                &e,
                fields::speedtest::UPLOAD_BYTES,
                "speedtest.upload_bytes",
            )?,
            error_code: opt_text_field(&e, fields::speedtest::ERROR_CODE),
            last_checked: timestamp_field(
                &e,
                fields::speedtest::LAST_CHECKED,
                "speedtest.last_checked",
            )?,
        },
    })
}

fn decode_info(value: &Value) -> Result<SystemInfo, WireError> {
    let e = map_entries(value, "info")?;
    let float_opt = |id| match field(&e, id) {
        Some(Value::Float(f)) => Some(*f),
        Some(Value::Integer(i)) => Some(i128::from(*i) as f64),
        _ => None,
    };
    Ok(SystemInfo {
        hostname: text_field(&e, fields::info::HOSTNAME, "info.hostname")?,
        version: text_field(&e, fields::info::VERSION, "info.version")?,
        public_ip: text_field(&e, fields::info::PUBLIC_IP, "info.public_ip")?,
        isp: text_field(&e, fields::info::ISP, "info.isp")?,
        asn: text_field(&e, fields::info::ASN, "info.asn")?,
        nic_speed_mbps: float_opt(fields::info::NIC_SPEED),
        rolling_ping_rtt: float_opt(fields::info::ROLLING_PING),
        rolling_dns_lookup: float_opt(fields::info::ROLLING_DNS),
    })
}

fn decode_entry_list<T>(
    entries: &[(u64, Value)],
    id: u64,
    context: &'static str,
    decode: impl Fn(&Value) -> Result<T, WireError>,
) -> Result<Vec<T>, WireError> {
    match field(entries, id) {
        Some(Value::Array(items)) => items.iter().map(decode).collect(),
        None => Ok(Vec::new()),
        Some(_) => Err(malformed(context)),
    }
}

/// Decodes a snapshot from the wire.
///
/// # Errors
///
/// Returns [`WireError::Decode`] for invalid CBOR and
/// [`WireError::Malformed`] when the structure or a field id is wrong.
pub fn decode_combined(bytes: &[u8]) -> Result<CombinedData, WireError> {
    let value: Value = ciborium::de::from_reader(bytes).map_err(WireError::Decode)?;
    let top = map_entries(&value, "combined")?;

    let stats_value = field(&top, fields::combined::STATS).ok_or_else(|| malformed("stats"))?;
    let stats_entries = map_entries(stats_value, "stats")?;
    let stats = Stats {
        ping: decode_entry_list(&stats_entries, fields::stats::PING, "stats.ping", decode_ping)?,
        dns: decode_entry_list(&stats_entries, fields::stats::DNS, "stats.dns", decode_dns)?,
        http: decode_entry_list(&stats_entries, fields::stats::HTTP, "stats.http", decode_http)?,
        speedtest: decode_entry_list(
            &stats_entries,
            fields::stats::SPEEDTEST,
            "stats.speedtest",
            decode_speedtest,
        )?,
    };

    let info_value = field(&top, fields::combined::INFO).ok_or_else(|| malformed("info"))?;
    let info = decode_info(info_value)?;

    Ok(CombinedData { stats, info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> CombinedData {
        let checked = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        CombinedData {
            stats: Stats {
                ping: vec![PingEntry {
                    host: "8.8.8.8".to_string(),
                    result: PingResult {
                        packet_loss: 0.0,
                        min_rtt: 9.1,
                        avg_rtt: 9.5,
                        max_rtt: 9.9,
                        last_checked: checked,
                    },
                }],
                dns: vec![DnsEntry {
                    domain: "example.org".to_string(),
                    server: "1.1.1.1".to_string(),
                    record_type: "A".to_string(),
                    result: DnsResult {
                        status: ProbeStatus::Error,
                        lookup_time: 41.2,
                        error_code: Some("NXDOMAIN".to_string()),
                        last_checked: checked,
                    },
                }],
                http: vec![HttpEntry {
                    url: "https://example.org/".to_string(),
                    result: HttpResult {
                        status: ProbeStatus::Success,
                        response_time: 120.0,
                        status_code: Some(200),
                        error_code: None,
                        last_checked: checked,
                    },
                }],
                speedtest: vec![SpeedtestEntry {
                    server_id: None,
                    result: SpeedtestResult {
                        status: ProbeStatus::Success,
                        download_speed: 940.12,
                        upload_speed: 48.3,
                        latency: 4.2,
                        jitter: 0.8,
                        download_bytes: 1_200_000_000,
                        upload_bytes: 60_000_000,
                        error_code: None,
                        last_checked: checked,
                    },
                }],
            },
            info: SystemInfo {
                hostname: "edge-1".to_string(),
                version: "0.5.0".to_string(),
                public_ip: "203.0.113.9".to_string(),
                isp: "ExampleNet".to_string(),
                asn: "AS64500".to_string(),
                nic_speed_mbps: Some(1000.0),
                rolling_ping_rtt: Some(9.5),
                rolling_dns_lookup: None,
            },
        }
    }

    #[test]
    fn combined_data_round_trips_through_cbor() {
        let data = sample();
        let bytes = encode_combined(&data).unwrap();
        let decoded = decode_combined(&bytes).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn empty_snapshot_round_trips() {
        let data = CombinedData::default();
        let bytes = encode_combined(&data).unwrap();
        let decoded = decode_combined(&bytes).unwrap();
        assert!(decoded.stats.is_empty());
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(decode_combined(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn control_frames_round_trip_as_json() {
        let frames = [
            ControlFrame::DataRequest,
            ControlFrame::Ping,
            ControlFrame::Pong,
            ControlFrame::Close {
                reason: "token rotated".to_string(),
            },
        ];
        for frame in frames {
            let json = frame.to_json().unwrap();
            assert_eq!(ControlFrame::from_json(&json).unwrap(), frame);
        }
    }

    #[test]
    fn config_frame_carries_version() {
        let frame = ControlFrame::Config(VersionedConfig {
            config: crate::domain::MonitoringConfig::default(),
            version: crate::domain_types::ConfigVersion::try_new(1_700_000_000).unwrap(),
        });
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"kind\":\"config\""));
        let parsed = ControlFrame::from_json(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn key_normalization_is_idempotent() {
        assert_eq!(normalize_key("abc123"), "base64:abc123");
        assert_eq!(normalize_key("base64:abc123"), "base64:abc123");
        assert_eq!(normalize_key("  abc123\n"), "base64:abc123");
    }
}
