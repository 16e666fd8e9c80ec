//! Persistence behind a narrow repository
//!
//! The hub core talks to this trait only; nothing outside this module
//! imports the database driver. [`sqlite::SqliteRepository`] is the
//! production implementation, [`memory::MemoryRepository`] backs unit
//! tests.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{CurrentAverages, MonitoringConfig, ProbeStatus, SystemInfo, SystemStatus};
use crate::domain_types::{ConfigVersion, FingerprintValue, SystemId, SystemName, TokenValue};

/// Storage failures surfaced to the hub core
#[derive(Debug, Error)]
pub enum StoreError {
    /// Driver-level failure
    #[error("database error: {0}")]
    Database(String),
    /// A stored value failed to decode into its domain type
    #[error("corrupt record in {table}: {detail}")]
    Corrupt {
        /// Table the record came from
        table: &'static str,
        /// What failed to decode
        detail: String,
    },
    /// The requested record does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Identifier looked up
        id: String,
    },
}

/// Result alias for repository calls
pub type StoreResult<T> = Result<T, StoreError>;

/// A monitored system as persisted
#[derive(Debug, Clone, PartialEq)]
pub struct SystemRecord {
    /// Opaque identifier
    pub id: SystemId,
    /// Display name
    pub name: SystemName,
    /// Host or address the operator entered
    pub host: String,
    /// Lifecycle status
    pub status: SystemStatus,
    /// Last reported host info; cleared on pause
    pub info: Option<SystemInfo>,
    /// Current rolling averages
    pub current_averages: Option<CurrentAverages>,
    /// Users allowed to see this system
    pub users: Vec<String>,
    /// Creation time
    pub created: DateTime<Utc>,
}

/// Auth material bound to a system
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintRecord {
    /// Owning system
    pub system: SystemId,
    /// Rotatable auth token
    pub token: TokenValue,
    /// Agent identity bound on first connect
    pub fingerprint: Option<FingerprintValue>,
    /// Last change time
    pub updated: DateTime<Utc>,
}

/// One ping stats row
#[derive(Debug, Clone, PartialEq)]
pub struct PingRow {
    /// Owning system
    pub system: SystemId,
    /// Probed host
    pub host: String,
    /// Loss percentage
    pub packet_loss: f64,
    /// Fastest RTT, ms
    pub min_rtt: f64,
    /// Slowest RTT, ms
    pub max_rtt: f64,
    /// Mean RTT, ms
    pub avg_rtt: f64,
    /// Measurement time
    pub created: DateTime<Utc>,
}

/// One DNS stats row
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRow {
    /// Owning system
    pub system: SystemId,
    /// Resolved name
    pub domain: String,
    /// Resolver used
    pub server: String,
    /// RR type
    pub record_type: String,
    /// Outcome
    pub status: ProbeStatus,
    /// Lookup time, ms
    pub lookup_time: f64,
    /// Error detail
    pub error_code: Option<String>,
    /// Measurement time
    pub created: DateTime<Utc>,
}

/// One HTTP stats row
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRow {
    /// Owning system
    pub system: SystemId,
    /// Requested URL
    pub url: String,
    /// Outcome
    pub status: ProbeStatus,
    /// Response time, ms
    pub response_time: f64,
    /// HTTP status code
    pub status_code: Option<u16>,
    /// Error detail
    pub error_code: Option<String>,
    /// Measurement time
    pub created: DateTime<Utc>,
}

/// One speedtest stats row
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedtestRow {
    /// Owning system
    pub system: SystemId,
    /// Pinned server id
    pub server_id: Option<String>,
    /// Outcome
    pub status: ProbeStatus,
    /// Download bandwidth, Mbps
    pub download_speed: f64,
    /// Upload bandwidth, Mbps
    pub upload_speed: f64,
    /// Idle latency, ms
    pub latency: f64,
    /// Idle jitter, ms
    pub jitter: f64,
    /// Download phase bytes
    pub download_bytes: u64,
    /// Upload phase bytes
    pub upload_bytes: u64,
    /// Error detail
    pub error_code: Option<String>,
    /// Measurement time
    pub created: DateTime<Utc>,
}

/// One historical averages row
#[derive(Debug, Clone, PartialEq)]
pub struct AveragesRow {
    /// Owning system
    pub system: SystemId,
    /// Mean ping RTT, ms
    pub ping_latency: f64,
    /// Mean packet loss, percent
    pub ping_packet_loss: f64,
    /// Mean DNS lookup, ms
    pub dns_latency: f64,
    /// DNS failure rate, percent
    pub dns_failure_rate: f64,
    /// Mean HTTP response, ms
    pub http_latency: f64,
    /// HTTP failure rate, percent
    pub http_failure_rate: f64,
    /// Mean download bandwidth, Mbps
    pub download_speed: f64,
    /// Mean upload bandwidth, Mbps
    pub upload_speed: f64,
    /// Snapshot time
    pub created: DateTime<Utc>,
}

/// An alert definition with its trigger state
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    /// Owning user
    pub user: String,
    /// Watched system
    pub system: SystemId,
    /// Metric name (see `hub::alerts::AlertMetric`)
    pub name: String,
    /// Threshold value
    pub value: f64,
    /// Minutes of coverage required before firing
    pub min: u32,
    /// Whether the alert is currently firing
    pub triggered: bool,
}

/// One alert transition for the history view
#[derive(Debug, Clone, PartialEq)]
pub struct AlertHistoryRow {
    /// Owning user
    pub user: String,
    /// Watched system
    pub system: SystemId,
    /// Metric name
    pub name: String,
    /// Metric value at the crossing
    pub value: f64,
    /// When the alert fired
    pub created: DateTime<Utc>,
    /// When it cleared, while unresolved `None`
    pub resolved: Option<DateTime<Utc>>,
}

/// Narrow persistence interface for the hub core
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    // Systems

    /// All systems, any status
    async fn find_systems(&self) -> StoreResult<Vec<SystemRecord>>;

    /// One system by id
    async fn get_system(&self, id: &SystemId) -> StoreResult<SystemRecord>;

    /// Inserts or replaces a system record
    async fn upsert_system(&self, record: &SystemRecord) -> StoreResult<()>;

    /// Updates only the status field
    async fn update_system_status(&self, id: &SystemId, status: SystemStatus) -> StoreResult<()>;

    /// Updates status, info, and current averages after a sample
    async fn update_system_sample(
        &self,
        id: &SystemId,
        status: SystemStatus,
        info: &SystemInfo,
        averages: &CurrentAverages,
    ) -> StoreResult<()>;

    /// Clears the info blob (on pause)
    async fn clear_system_info(&self, id: &SystemId) -> StoreResult<()>;

    /// Removes the system and everything it owns
    async fn delete_system(&self, id: &SystemId) -> StoreResult<()>;

    /// Whether any system exists yet
    async fn any_systems(&self) -> StoreResult<bool>;

    // Fingerprints

    /// Fingerprint row by token value
    async fn get_fingerprint_by_token(
        &self,
        token: &TokenValue,
    ) -> StoreResult<Option<FingerprintRecord>>;

    /// Fingerprint row by system
    async fn get_fingerprint(&self, system: &SystemId) -> StoreResult<FingerprintRecord>;

    /// Creates the fingerprint slot for a new system
    async fn insert_fingerprint(&self, record: &FingerprintRecord) -> StoreResult<()>;

    /// Binds the agent identity on first connect
    async fn bind_fingerprint(
        &self,
        system: &SystemId,
        fingerprint: &FingerprintValue,
    ) -> StoreResult<()>;

    /// Replaces the token; the caller closes any live session
    async fn rotate_token(&self, system: &SystemId, token: &TokenValue) -> StoreResult<()>;

    // Monitoring config

    /// Stored config and version for a system
    async fn get_monitoring_config(
        &self,
        system: &SystemId,
    ) -> StoreResult<Option<(MonitoringConfig, ConfigVersion)>>;

    /// Stores config and version
    async fn put_monitoring_config(
        &self,
        system: &SystemId,
        config: &MonitoringConfig,
        version: ConfigVersion,
    ) -> StoreResult<()>;

    // Stats rows

    /// Appends a ping row
    async fn insert_ping_row(&self, row: &PingRow) -> StoreResult<()>;
    /// Appends a DNS row
    async fn insert_dns_row(&self, row: &DnsRow) -> StoreResult<()>;
    /// Appends an HTTP row
    async fn insert_http_row(&self, row: &HttpRow) -> StoreResult<()>;
    /// Appends a speedtest row
    async fn insert_speedtest_row(&self, row: &SpeedtestRow) -> StoreResult<()>;

    /// Newest ping rows, newest first
    async fn recent_ping_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<PingRow>>;
    /// Newest DNS rows, newest first
    async fn recent_dns_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<DnsRow>>;
    /// Newest HTTP rows, newest first
    async fn recent_http_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<HttpRow>>;
    /// Newest speedtest rows, newest first
    async fn recent_speedtest_rows(
        &self,
        system: &SystemId,
        limit: u32,
    ) -> StoreResult<Vec<SpeedtestRow>>;

    // Averages

    /// Appends a historical averages snapshot
    async fn insert_averages_row(&self, row: &AveragesRow) -> StoreResult<()>;

    /// Averages rows since `since`, oldest first
    async fn averages_window(
        &self,
        system: &SystemId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AveragesRow>>;

    // Alerts

    /// Alerts bound to one system
    async fn list_alerts(&self, system: &SystemId) -> StoreResult<Vec<AlertRecord>>;

    /// Inserts or replaces an alert by (user, system, name)
    async fn save_alert(&self, alert: &AlertRecord) -> StoreResult<()>;

    /// Sets triggered=false on every alert of a system; returns how many
    /// were cleared
    async fn deactivate_alerts(&self, system: &SystemId) -> StoreResult<u64>;

    /// Appends an alert-history row
    async fn insert_alert_history(&self, row: &AlertHistoryRow) -> StoreResult<()>;

    /// Resolves the newest open history row for (user, system, name)
    async fn resolve_alert_history(
        &self,
        user: &str,
        system: &SystemId,
        name: &str,
        resolved: DateTime<Utc>,
    ) -> StoreResult<()>;

    // Retention

    /// Deletes stats rows strictly older than `cutoff`; returns rows removed
    async fn prune_stats(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Trims alert history to the newest `keep` rows per (user, system)
    async fn prune_alerts_history(&self, keep: u32) -> StoreResult<u64>;
}

/// Shared repository handle used across the hub
pub type SharedRepository = Arc<dyn Repository>;
