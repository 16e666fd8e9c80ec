//! Monitoring configuration pushed from the hub to agents
//!
//! The operator edits these structures as JSON; the hub validates, versions,
//! and pushes them over the session. Each probe class carries its own target
//! list and a 5-field cron interval (empty interval disables the class).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain_types::ConfigVersion;

/// Default ping packet count per probe run
pub const DEFAULT_PING_COUNT: u32 = 3;
/// Minimum accepted per-packet ping timeout
pub const MIN_PING_TIMEOUT: Duration = Duration::from_secs(1);
/// Default DNS lookup timeout
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);
/// Default HTTP request timeout
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default speedtest subprocess timeout
pub const DEFAULT_SPEEDTEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport used for a DNS lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DnsProtocol {
    /// Plain UDP on port 53
    #[default]
    Udp,
    /// TCP on port 53
    Tcp,
    /// DNS over TLS on port 853
    Tls,
    /// DNS over HTTPS
    Https,
}

/// ICMP ping target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingTarget {
    /// Host or address handed to fping
    pub host: String,
    /// Packets per run
    #[serde(default = "default_ping_count")]
    pub count: u32,
    /// Per-packet timeout
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// DNS lookup target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsTarget {
    /// Name to resolve
    pub domain: String,
    /// Resolver address (host or host:port)
    pub server: String,
    /// RR type; A when unset
    #[serde(default = "default_record_type", rename = "type")]
    pub record_type: String,
    /// Transport protocol
    #[serde(default)]
    pub protocol: DnsProtocol,
    /// Lookup timeout
    #[serde(default = "default_dns_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// HTTP GET target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTarget {
    /// Absolute URL
    pub url: String,
    /// Request timeout
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Bandwidth test target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedtestTarget {
    /// Specific speedtest.net server; closest server when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Subprocess timeout
    #[serde(default = "default_speedtest_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_ping_count() -> u32 {
    DEFAULT_PING_COUNT
}
fn default_ping_timeout() -> Duration {
    MIN_PING_TIMEOUT
}
fn default_record_type() -> String {
    "A".to_string()
}
fn default_dns_timeout() -> Duration {
    DEFAULT_DNS_TIMEOUT
}
fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}
fn default_speedtest_timeout() -> Duration {
    DEFAULT_SPEEDTEST_TIMEOUT
}

/// Identity of a ping target within a result map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PingKey(pub String);

/// Identity of a DNS target within a result map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsKey {
    /// Name being resolved
    pub domain: String,
    /// Resolver address
    pub server: String,
    /// RR type
    pub record_type: String,
    /// Transport
    pub protocol: DnsProtocol,
}

/// Identity of an HTTP target within a result map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpKey(pub String);

/// Identity of a speedtest target within a result map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpeedtestKey(pub Option<String>);

impl PingTarget {
    /// Result-map key for this target
    pub fn key(&self) -> PingKey {
        PingKey(self.host.clone())
    }

    /// Applies count/timeout floors
    pub fn normalized(mut self) -> Self {
        if self.count == 0 {
            self.count = DEFAULT_PING_COUNT;
        }
        if self.timeout < MIN_PING_TIMEOUT {
            self.timeout = MIN_PING_TIMEOUT;
        }
        self
    }
}

impl DnsTarget {
    /// Result-map key for this target
    pub fn key(&self) -> DnsKey {
        DnsKey {
            domain: self.domain.clone(),
            server: self.server.clone(),
            record_type: self.record_type.clone(),
            protocol: self.protocol,
        }
    }

    /// Applies the timeout default
    pub fn normalized(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_DNS_TIMEOUT;
        }
        self
    }
}

impl HttpTarget {
    /// Result-map key for this target
    pub fn key(&self) -> HttpKey {
        HttpKey(self.url.clone())
    }

    /// Applies the timeout default
    pub fn normalized(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_HTTP_TIMEOUT;
        }
        self
    }
}

impl SpeedtestTarget {
    /// Result-map key for this target
    pub fn key(&self) -> SpeedtestKey {
        SpeedtestKey(self.server_id.clone())
    }

    /// Applies the timeout default
    pub fn normalized(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_SPEEDTEST_TIMEOUT;
        }
        self
    }
}

/// Per-probe-class configuration block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig<T> {
    /// Whether the class runs at all
    #[serde(default)]
    pub enabled: bool,
    /// Targets probed on each tick
    #[serde(default = "Vec::new")]
    pub targets: Vec<T>,
    /// 5-field cron expression; empty disables scheduling
    #[serde(default)]
    pub interval: String,
}

impl<T> Default for ClassConfig<T> {
    fn default() -> Self {
        Self {
            enabled: false,
            targets: Vec::new(),
            interval: String::new(),
        }
    }
}

impl<T> ClassConfig<T> {
    /// Targets to schedule, or none when the class is disabled
    pub fn active_targets(&self) -> &[T] {
        if self.enabled { &self.targets } else { &[] }
    }
}

/// Complete per-system monitoring configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// ICMP ping class
    #[serde(default)]
    pub ping: ClassConfig<PingTarget>,
    /// DNS lookup class
    #[serde(default)]
    pub dns: ClassConfig<DnsTarget>,
    /// HTTP GET class
    #[serde(default)]
    pub http: ClassConfig<HttpTarget>,
    /// Bandwidth test class
    #[serde(default)]
    pub speedtest: ClassConfig<SpeedtestTarget>,
}

/// Config frame payload: configuration plus its epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedConfig {
    /// The monitoring configuration
    pub config: MonitoringConfig,
    /// Strictly increasing epoch per system
    pub version: ConfigVersion,
}

/// Limits applied when an operator submits a configuration
#[derive(Debug, Clone)]
pub struct ConfigLimits {
    /// Maximum targets accepted per probe class
    pub max_targets_per_class: usize,
    /// When non-empty, DNS/HTTP targets must fall under one of these domains
    pub allowed_domains: Vec<String>,
}

impl Default for ConfigLimits {
    fn default() -> Self {
        Self {
            max_targets_per_class: 50,
            allowed_domains: Vec::new(),
        }
    }
}

/// Why a submitted configuration was rejected
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    /// Too many targets in one class
    #[error("{class}: {count} targets exceeds limit of {limit}")]
    TooManyTargets {
        /// Probe class name
        class: &'static str,
        /// Submitted target count
        count: usize,
        /// Configured cap
        limit: usize,
    },
    /// Interval is neither a duration nor a 5-field cron expression
    #[error("{class}: invalid interval {interval:?}: {reason}")]
    InvalidInterval {
        /// Probe class name
        class: &'static str,
        /// Submitted interval
        interval: String,
        /// Parser diagnostic
        reason: String,
    },
    /// Target host falls outside the allow-list
    #[error("{class}: domain {domain:?} is not in the allowed-domain list")]
    DomainNotAllowed {
        /// Probe class name
        class: &'static str,
        /// Offending domain
        domain: String,
    },
}

/// Checks an interval string: empty (disabled), a humantime duration, or a
/// 5-field cron expression.
fn validate_interval(class: &'static str, interval: &str) -> Result<(), ConfigValidationError> {
    if interval.is_empty() {
        return Ok(());
    }
    if humantime::parse_duration(interval).is_ok() {
        return Ok(());
    }
    crate::probes::scheduler::parse_cron(interval).map_err(|e| {
        ConfigValidationError::InvalidInterval {
            class,
            interval: interval.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(())
}

fn domain_allowed(domain: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed
        .iter()
        .any(|a| domain == a || domain.ends_with(&format!(".{a}")))
}

impl MonitoringConfig {
    /// Validates operator input against hub limits.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule: a target-count cap, a malformed
    /// interval, or a domain outside the allow-list.
    pub fn validate(&self, limits: &ConfigLimits) -> Result<(), ConfigValidationError> {
        let caps: [(&'static str, usize, &str); 4] = [
            ("ping", self.ping.targets.len(), &self.ping.interval),
            ("dns", self.dns.targets.len(), &self.dns.interval),
            ("http", self.http.targets.len(), &self.http.interval),
            (
                "speedtest",
                self.speedtest.targets.len(),
                &self.speedtest.interval,
            ),
        ];
        for (class, count, interval) in caps {
            if count > limits.max_targets_per_class {
                return Err(ConfigValidationError::TooManyTargets {
                    class,
                    count,
                    limit: limits.max_targets_per_class,
                });
            }
            validate_interval(class, interval)?;
        }

        for t in &self.dns.targets {
            if !domain_allowed(&t.domain, &limits.allowed_domains) {
                return Err(ConfigValidationError::DomainNotAllowed {
                    class: "dns",
                    domain: t.domain.clone(),
                });
            }
        }
        for t in &self.http.targets {
            let host = url_host(&t.url).unwrap_or_default();
            if !domain_allowed(&host, &limits.allowed_domains) {
                return Err(ConfigValidationError::DomainNotAllowed {
                    class: "http",
                    domain: host,
                });
            }
        }
        Ok(())
    }

    /// Truncated SHA-256 over the canonical JSON serialization.
    ///
    /// Field order is fixed by the struct definitions, so equal configs
    /// always hash equally. Only the first 16 hex characters are kept.
    pub fn content_hash(&self) -> crate::domain_types::ConfigHash {
        use sha2::{Digest, Sha256};

        let canonical = serde_json::to_vec(self).expect("config serialization is infallible");
        let digest = Sha256::digest(&canonical);
        let hex: String = digest
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect();
        crate::domain_types::ConfigHash::try_new(hex).expect("digest prefix is 16 hex chars")
    }

    /// True when no class schedules anything
    pub fn is_empty(&self) -> bool {
        self.ping.active_targets().is_empty()
            && self.dns.active_targets().is_empty()
            && self.http.active_targets().is_empty()
            && self.speedtest.active_targets().is_empty()
    }
}

/// Host portion of an http(s) URL, without pulling in a URL parser.
fn url_host(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host_port = rest.split(['/', '?', '#']).next()?;
    let host = host_port.rsplit_once(':').map_or(host_port, |(h, _)| h);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_cfg(hosts: &[&str], interval: &str) -> MonitoringConfig {
        MonitoringConfig {
            ping: ClassConfig {
                enabled: true,
                targets: hosts
                    .iter()
                    .map(|h| PingTarget {
                        host: (*h).to_string(),
                        count: DEFAULT_PING_COUNT,
                        timeout: MIN_PING_TIMEOUT,
                    })
                    .collect(),
                interval: interval.to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn ping_target_floors_apply() {
        let t = PingTarget {
            host: "8.8.8.8".to_string(),
            count: 0,
            timeout: Duration::from_millis(100),
        }
        .normalized();
        assert_eq!(t.count, DEFAULT_PING_COUNT);
        assert_eq!(t.timeout, MIN_PING_TIMEOUT);
    }

    #[test]
    fn defaults_fill_in_on_deserialize() {
        let t: DnsTarget =
            serde_json::from_str(r#"{"domain":"example.org","server":"1.1.1.1"}"#).unwrap();
        assert_eq!(t.record_type, "A");
        assert_eq!(t.protocol, DnsProtocol::Udp);
        assert_eq!(t.timeout, DEFAULT_DNS_TIMEOUT);
    }

    #[test]
    fn disabled_class_exposes_no_targets() {
        let mut cfg = ping_cfg(&["8.8.8.8"], "*/1 * * * *");
        cfg.ping.enabled = false;
        assert!(cfg.ping.active_targets().is_empty());
        assert!(cfg.is_empty());
    }

    #[test]
    fn validate_accepts_cron_duration_and_empty_intervals() {
        let limits = ConfigLimits::default();
        assert!(ping_cfg(&["a"], "*/5 * * * *").validate(&limits).is_ok());
        assert!(ping_cfg(&["a"], "90s").validate(&limits).is_ok());
        assert!(ping_cfg(&["a"], "").validate(&limits).is_ok());
        assert!(ping_cfg(&["a"], "whenever").validate(&limits).is_err());
    }

    #[test]
    fn validate_enforces_target_cap() {
        let limits = ConfigLimits {
            max_targets_per_class: 2,
            allowed_domains: Vec::new(),
        };
        let hosts: Vec<String> = (0..3).map(|i| format!("10.0.0.{i}")).collect();
        let refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let err = ping_cfg(&refs, "").validate(&limits).unwrap_err();
        assert!(matches!(err, ConfigValidationError::TooManyTargets { .. }));
    }

    #[test]
    fn validate_enforces_domain_allow_list() {
        let limits = ConfigLimits {
            max_targets_per_class: 50,
            allowed_domains: vec!["example.org".to_string()],
        };
        let cfg = MonitoringConfig {
            http: ClassConfig {
                enabled: true,
                targets: vec![HttpTarget {
                    url: "https://evil.test/path".to_string(),
                    timeout: DEFAULT_HTTP_TIMEOUT,
                }],
                interval: String::new(),
            },
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(&limits).unwrap_err(),
            ConfigValidationError::DomainNotAllowed { .. }
        ));

        let ok = MonitoringConfig {
            http: ClassConfig {
                enabled: true,
                targets: vec![HttpTarget {
                    url: "https://www.example.org/".to_string(),
                    timeout: DEFAULT_HTTP_TIMEOUT,
                }],
                interval: String::new(),
            },
            ..Default::default()
        };
        assert!(ok.validate(&limits).is_ok());
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let a = ping_cfg(&["8.8.8.8"], "*/1 * * * *");
        let b = ping_cfg(&["8.8.8.8"], "*/1 * * * *");
        let c = ping_cfg(&["1.1.1.1"], "*/1 * * * *");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().to_string().len(), 16);
    }

    #[test]
    fn url_host_strips_scheme_port_and_path() {
        assert_eq!(
            url_host("https://example.org:8443/x?y#z"),
            Some("example.org".to_string())
        );
        assert_eq!(url_host("http://example.org"), Some("example.org".to_string()));
        assert_eq!(url_host("ftp://example.org"), None);
    }
}
