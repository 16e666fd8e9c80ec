//! Environment and flag configuration
//!
//! Agent settings resolve with an optional `BESZEL_AGENT_` prefix falling
//! back to the bare name; hub settings use the `BESZEL_HUB_` prefix. Bad
//! values (malformed durations, missing key material) fail fast at startup.

use std::time::Duration;
use thiserror::Error;

use crate::wire::normalize_key;

/// Prefix for agent environment variables
pub const AGENT_ENV_PREFIX: &str = "BESZEL_AGENT_";
/// Prefix for hub environment variables
pub const HUB_ENV_PREFIX: &str = "BESZEL_HUB_";

/// Default period between system-info refreshes
pub const DEFAULT_INFO_REFRESH: Duration = Duration::from_secs(6 * 60 * 60);

/// Startup configuration problems; all of these abort the process
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No shared key from flag, env, or key file
    #[error("missing shared key: pass -key, set KEY, or set KEY_FILE")]
    MissingKey,
    /// KEY_FILE was set but unreadable
    #[error("key file {path} unreadable: {source}")]
    KeyFileUnreadable {
        /// Configured path
        path: String,
        /// Underlying I/O failure
        source: std::io::Error,
    },
    /// A duration-valued variable did not parse
    #[error("invalid duration in {name}: {value:?}: {reason}")]
    BadDuration {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
        /// Parser diagnostic
        reason: String,
    },
    /// The hub URL is required for the agent
    #[error("missing hub URL: set HUB_URL")]
    MissingHubUrl,
}

/// Reads an agent variable, preferring the prefixed name.
pub fn agent_env(name: &str) -> Option<String> {
    std::env::var(format!("{AGENT_ENV_PREFIX}{name}"))
        .or_else(|_| std::env::var(name))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Reads a hub variable, preferring the prefixed name.
pub fn hub_env(name: &str) -> Option<String> {
    std::env::var(format!("{HUB_ENV_PREFIX}{name}"))
        .or_else(|_| std::env::var(name))
        .ok()
        .filter(|v| !v.is_empty())
}

fn parse_env_duration(
    name: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(&raw).map_err(|e| ConfigError::BadDuration {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

/// Resolved agent settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Hub base URL (http(s)://…)
    pub hub_url: String,
    /// Normalized shared key (`base64:` form)
    pub key: String,
    /// Agent auth token presented in `X-Token`
    pub token: String,
    /// Period between system-info refreshes
    pub info_refresh: Duration,
    /// Heartbeat file location
    pub health_file: std::path::PathBuf,
}

impl AgentSettings {
    /// Resolves settings from a flag-provided key and the environment.
    ///
    /// Key resolution order: flag, `KEY`, `KEY_FILE` contents.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the key or hub URL is missing or a
    /// duration fails strict parsing.
    pub fn resolve(flag_key: Option<String>) -> Result<Self, ConfigError> {
        let key = match flag_key.or_else(|| agent_env("KEY")) {
            Some(k) => k,
            None => match agent_env("KEY_FILE") {
                Some(path) => std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::KeyFileUnreadable { path, source })?
                    .trim()
                    .to_string(),
                None => return Err(ConfigError::MissingKey),
            },
        };

        let hub_url = agent_env("HUB_URL").ok_or(ConfigError::MissingHubUrl)?;
        let token = agent_env("TOKEN").unwrap_or_default();
        let info_refresh = parse_env_duration(
            "SYSTEM_INFO_REFRESH_INTERVAL",
            agent_env("SYSTEM_INFO_REFRESH_INTERVAL"),
            DEFAULT_INFO_REFRESH,
        )?;
        let health_file = agent_env("HEALTH_FILE")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(crate::agent::health::default_health_file);

        Ok(Self {
            hub_url,
            key: normalize_key(&key),
            token,
            info_refresh,
            health_file,
        })
    }

    /// WebSocket endpoint derived from the hub base URL.
    pub fn connect_url(&self) -> String {
        let base = self.hub_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/api/beszel/agent-connect")
    }
}

/// Resolved hub settings
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Public base URL of the hub
    pub app_url: String,
    /// Listen address
    pub listen: String,
    /// SQLite database location
    pub database: String,
    /// Shared key agents must present
    pub key: String,
    /// Bearer token for the admin surface
    pub admin_token: Option<String>,
    /// Disable password auth on the outer surface (informational here)
    pub disable_password_auth: bool,
    /// Allow self-service user creation (informational here)
    pub user_creation: bool,
    /// Content-Security-Policy header override
    pub csp: Option<String>,
    /// Days of probe stats to keep
    pub retention_days: u32,
    /// Alert history rows kept per (user, system)
    pub alerts_history_keep: u32,
}

impl HubSettings {
    /// Resolves hub settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadDuration`] style errors for malformed
    /// numeric values.
    pub fn resolve() -> Result<Self, ConfigError> {
        let retention_days = std::env::var("BESZEL_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let alerts_history_keep = std::env::var("BESZEL_ALERTS_HISTORY_KEEP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(200);

        Ok(Self {
            app_url: hub_env("APP_URL").unwrap_or_else(|| "http://localhost:8090".to_string()),
            listen: hub_env("LISTEN").unwrap_or_else(|| "0.0.0.0:8090".to_string()),
            database: hub_env("DATABASE").unwrap_or_else(|| "lightspeed.db".to_string()),
            key: hub_env("KEY").map(|k| normalize_key(&k)).unwrap_or_default(),
            admin_token: hub_env("ADMIN_TOKEN"),
            disable_password_auth: hub_env("DISABLE_PASSWORD_AUTH")
                .is_some_and(|v| v == "true" || v == "1"),
            user_creation: hub_env("USER_CREATION").is_some_and(|v| v == "true" || v == "1"),
            csp: hub_env("CSP"),
            retention_days,
            alerts_history_keep,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_swaps_scheme_and_appends_path() {
        let settings = AgentSettings {
            hub_url: "https://hub.example.org/".to_string(),
            key: "base64:k".to_string(),
            token: "t".to_string(),
            info_refresh: DEFAULT_INFO_REFRESH,
            health_file: std::path::PathBuf::from("/tmp/x"),
        };
        assert_eq!(
            settings.connect_url(),
            "wss://hub.example.org/api/beszel/agent-connect"
        );

        let plain = AgentSettings {
            hub_url: "http://10.0.0.5:8090".to_string(),
            ..settings
        };
        assert_eq!(
            plain.connect_url(),
            "ws://10.0.0.5:8090/api/beszel/agent-connect"
        );
    }
}
