//! DNS lookup probing
//!
//! Each target gets a one-shot resolver pointed at its configured server,
//! with the transport picked by the target protocol: UDP or TCP on port 53,
//! DNS over TLS on 853, DNS over HTTPS on 443. A lookup is successful iff
//! the response code is NOERROR; any other rcode is an error carrying the
//! rcode name, and a deadline expiry is a timeout. Lookup time is wall-clock
//! across the whole exchange.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::proto::rr::RecordType;

use crate::domain::{DnsKey, DnsProtocol, DnsResult, DnsTarget, ProbeStatus};
use crate::time_provider::SharedClock;

use super::Prober;

/// Runs DNS lookups, concurrently across the batch
pub struct DnsProber {
    clock: SharedClock,
}

impl DnsProber {
    /// Creates the prober
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    async fn probe_one(clock: SharedClock, target: DnsTarget) -> DnsResult {
        let target = target.normalized();
        let started = clock.instant();
        let outcome = lookup(&target).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (status, error_code) = match outcome {
            Ok(()) => (ProbeStatus::Success, None),
            Err(LookupFailure::BadRcode(rcode)) => (ProbeStatus::Error, Some(rcode)),
            Err(LookupFailure::Transport(text)) => (ProbeStatus::Error, Some(text)),
            Err(LookupFailure::Timeout) => (ProbeStatus::Timeout, None),
        };

        DnsResult {
            status,
            lookup_time: elapsed_ms,
            error_code,
            last_checked: clock.now(),
        }
    }
}

#[async_trait]
impl Prober for DnsProber {
    type Target = DnsTarget;
    type Key = DnsKey;
    type Output = DnsResult;

    fn class(&self) -> &'static str {
        "dns"
    }

    fn key(target: &Self::Target) -> Self::Key {
        target.key()
    }

    async fn probe_all(&self, targets: &[Self::Target]) -> Vec<(Self::Key, Self::Output)> {
        let mut set = JoinSet::new();
        for target in targets.iter().cloned() {
            let clock = Arc::clone(&self.clock);
            let key = target.key();
            set.spawn(async move { (key, Self::probe_one(clock, target).await) });
        }

        let mut out = Vec::with_capacity(targets.len());
        while let Some(joined) = set.join_next().await {
            if let Ok(pair) = joined {
                out.push(pair);
            }
        }
        out
    }
}

enum LookupFailure {
    BadRcode(String),
    Transport(String),
    Timeout,
}

fn default_port(protocol: DnsProtocol) -> u16 {
    match protocol {
        DnsProtocol::Udp | DnsProtocol::Tcp => 53,
        DnsProtocol::Tls => 853,
        DnsProtocol::Https => 443,
    }
}

fn transport(protocol: DnsProtocol) -> Protocol {
    match protocol {
        DnsProtocol::Udp => Protocol::Udp,
        DnsProtocol::Tcp => Protocol::Tcp,
        DnsProtocol::Tls => Protocol::Tls,
        DnsProtocol::Https => Protocol::Https,
    }
}

/// Splits `server` into host and port, defaulting the port by protocol.
fn server_parts(server: &str, protocol: DnsProtocol) -> (String, u16) {
    if let Some((host, port)) = server.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
        && !host.contains(':')
    {
        return (host.to_string(), port);
    }
    (server.to_string(), default_port(protocol))
}

async fn resolve_server(host: &str, port: u16) -> Result<SocketAddr, String> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("server lookup failed: {e}"))?;
    addrs
        .next()
        .ok_or_else(|| format!("server {host} resolved to no addresses"))
}

async fn lookup(target: &DnsTarget) -> Result<(), LookupFailure> {
    let (host, port) = server_parts(&target.server, target.protocol);
    let socket_addr = resolve_server(&host, port)
        .await
        .map_err(LookupFailure::Transport)?;

    let mut ns = NameServerConfig::new(socket_addr, transport(target.protocol));
    if matches!(target.protocol, DnsProtocol::Tls | DnsProtocol::Https) {
        ns.tls_dns_name = Some(host);
    }
    let mut config = ResolverConfig::new();
    config.add_name_server(ns);

    let mut opts = ResolverOpts::default();
    opts.timeout = target.timeout;
    opts.attempts = 1;

    let record_type = RecordType::from_str(&target.record_type).unwrap_or_else(|_| {
        warn!(record_type = %target.record_type, "unknown RR type, probing A");
        RecordType::A
    });

    let resolver = TokioAsyncResolver::tokio(config, opts);
    match tokio::time::timeout(target.timeout, resolver.lookup(target.domain.clone(), record_type))
        .await
    {
        Err(_) => Err(LookupFailure::Timeout),
        Ok(Ok(answer)) => {
            debug!(domain = %target.domain, records = answer.iter().count(), "lookup ok");
            Ok(())
        }
        Ok(Err(e)) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                if *response_code == ResponseCode::NoError {
                    // Empty answer with NOERROR still counts as resolved.
                    Ok(())
                } else {
                    Err(LookupFailure::BadRcode(response_code.to_string()))
                }
            }
            ResolveErrorKind::Timeout => Err(LookupFailure::Timeout),
            other => Err(LookupFailure::Transport(other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_parts_splits_explicit_port() {
        assert_eq!(
            server_parts("1.1.1.1:5353", DnsProtocol::Udp),
            ("1.1.1.1".to_string(), 5353)
        );
    }

    #[test]
    fn server_parts_defaults_port_by_protocol() {
        assert_eq!(server_parts("1.1.1.1", DnsProtocol::Udp).1, 53);
        assert_eq!(server_parts("1.1.1.1", DnsProtocol::Tcp).1, 53);
        assert_eq!(server_parts("1.1.1.1", DnsProtocol::Tls).1, 853);
        assert_eq!(server_parts("dns.google", DnsProtocol::Https).1, 443);
    }

    #[test]
    fn ipv6_literal_is_not_split_as_port() {
        let (host, port) = server_parts("2606:4700:4700::1111", DnsProtocol::Udp);
        assert_eq!(host, "2606:4700:4700::1111");
        assert_eq!(port, 53);
    }

    #[tokio::test]
    async fn unresolvable_server_reports_transport_error() {
        let target = DnsTarget {
            domain: "example.org".to_string(),
            server: "resolver.invalid".to_string(),
            record_type: "A".to_string(),
            protocol: DnsProtocol::Udp,
            timeout: std::time::Duration::from_secs(1),
        };
        let clock = crate::time_provider::system_clock();
        let result = DnsProber::probe_one(clock, target).await;
        assert_eq!(result.status, ProbeStatus::Error);
        assert!(result.error_code.is_some());
    }
}
