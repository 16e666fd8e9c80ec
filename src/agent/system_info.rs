//! Host identity: hostname, version, public IP, ISP, ASN, NIC speed
//!
//! Public IP and network ownership come from the GeoJS endpoint; the
//! primary NIC link speed is read from sysfs. A background manager
//! refreshes the geolocation periodically (default six hours) and logs
//! only the fields that changed.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::SystemInfo;
use crate::time_provider::SharedClock;

/// GeoJS lookup endpoint
pub const GEO_ENDPOINT: &str = "https://get.geojs.io/v1/ip/geo.json";

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    organization_name: String,
    #[serde(default)]
    asn: Option<u64>,
}

/// Queries geolocation once and folds the result into `info`, logging only
/// the fields that changed.
async fn refresh_geo(client: &reqwest::Client, info: &RwLock<SystemInfo>) {
    let geo = match client
        .get(GEO_ENDPOINT)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
    {
        Ok(resp) => match resp.json::<GeoResponse>().await {
            Ok(geo) => geo,
            Err(e) => {
                warn!(error = %e, "geolocation response malformed");
                return;
            }
        },
        Err(e) => {
            warn!(error = %e, "geolocation refresh failed");
            return;
        }
    };

    let asn = geo.asn.map(|n| format!("AS{n}")).unwrap_or_default();
    let mut info = info.write().await;
    if info.public_ip != geo.ip {
        info!(old = %info.public_ip, new = %geo.ip, "public IP changed");
        info.public_ip = geo.ip;
    }
    if info.isp != geo.organization_name {
        info!(old = %info.isp, new = %geo.organization_name, "ISP changed");
        info.isp = geo.organization_name;
    }
    if info.asn != asn {
        info!(old = %info.asn, new = %asn, "ASN changed");
        info.asn = asn;
    }
}

/// Owns the process-wide [`SystemInfo`] and refreshes it periodically
pub struct SystemInfoManager {
    info: Arc<RwLock<SystemInfo>>,
    client: reqwest::Client,
    refresh: Duration,
    clock: SharedClock,
    token: CancellationToken,
}

impl SystemInfoManager {
    /// Creates the manager and fills in the static fields.
    ///
    /// # Errors
    ///
    /// Returns the client builder error when the TLS backend cannot
    /// initialize.
    pub fn new(refresh: Duration, clock: SharedClock) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lightspeed-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;

        let info = SystemInfo {
            hostname: hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            nic_speed_mbps: primary_nic_speed(),
            ..Default::default()
        };

        Ok(Self {
            info: Arc::new(RwLock::new(info)),
            client,
            refresh,
            clock,
            token: CancellationToken::new(),
        })
    }

    /// Snapshot of the current info
    pub async fn current(&self) -> SystemInfo {
        self.info.read().await.clone()
    }

    /// Shared handle for the sampler to update rolling means on
    pub fn handle(&self) -> Arc<RwLock<SystemInfo>> {
        Arc::clone(&self.info)
    }

    /// Runs one geolocation refresh immediately.
    pub async fn refresh_once(&self) {
        refresh_geo(&self.client, &self.info).await;
    }

    /// Performs the first refresh and spawns the periodic task.
    pub async fn start(&self) {
        self.refresh_once().await;

        let info = Arc::clone(&self.info);
        let client = self.client.clone();
        let refresh = self.refresh;
        let clock = Arc::clone(&self.clock);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = clock.sleep(refresh) => {}
                }
                refresh_geo(&client, &info).await;
            }
        });
        debug!(interval = ?self.refresh, "system info refresh scheduled");
    }

    /// Stops the refresh task
    pub fn stop(&self) {
        self.token.cancel();
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Link speed of the first up, non-loopback interface, in Mbps.
fn primary_nic_speed() -> Option<f64> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "lo" {
            continue;
        }
        let base = entry.path();
        let operstate = std::fs::read_to_string(base.join("operstate")).unwrap_or_default();
        if operstate.trim() != "up" {
            continue;
        }
        if let Ok(raw) = std::fs::read_to_string(base.join("speed"))
            && let Some(mbps) = parse_link_speed(raw.trim())
        {
            return Some(mbps);
        }
    }
    None
}

/// Parses a link speed string into Mbps.
///
/// Accepts the bare sysfs number ("1000") and ethtool-style suffixes:
/// "1000Mb/s", "1Gb/s", "10000Kb".
fn parse_link_speed(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('-') {
        return None;
    }
    if let Ok(mbps) = raw.parse::<f64>() {
        return Some(mbps);
    }

    let lower = raw.to_ascii_lowercase();
    let (number, scale) = if let Some(n) = lower.find("gb") {
        (&lower[..n], 1000.0)
    } else if let Some(n) = lower.find("mb") {
        (&lower[..n], 1.0)
    } else if let Some(n) = lower.find("kb") {
        (&lower[..n], 0.001)
    } else {
        return None;
    };
    number.trim().parse::<f64>().ok().map(|v| v * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_speed_parses_bare_and_suffixed_forms() {
        assert_eq!(parse_link_speed("1000"), Some(1000.0));
        assert_eq!(parse_link_speed("1000Mb/s"), Some(1000.0));
        assert_eq!(parse_link_speed("1Gb/s"), Some(1000.0));
        assert_eq!(parse_link_speed("2.5Gb/s"), Some(2500.0));
        assert_eq!(parse_link_speed("10000Kb"), Some(10.0));
    }

    #[test]
    fn link_speed_rejects_unknown_and_down_interfaces() {
        assert_eq!(parse_link_speed(""), None);
        // sysfs reports -1 when the link is down
        assert_eq!(parse_link_speed("-1"), None);
        assert_eq!(parse_link_speed("fast"), None);
    }

    #[test]
    fn geo_response_parses_geojs_shape() {
        let raw =
            r#"{"ip":"203.0.113.9","organization_name":"ExampleNet","asn":64500,"country":"NL"}"#;
        let geo: GeoResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(geo.ip, "203.0.113.9");
        assert_eq!(geo.organization_name, "ExampleNet");
        assert_eq!(geo.asn, Some(64500));
    }
}
