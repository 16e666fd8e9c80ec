//! SQLite repository
//!
//! SQL text and row mapping are pure and live in their own modules; the
//! [`SqliteRepository`] shell only does I/O. Timestamps are stored as epoch
//! milliseconds, JSON-shaped values (info, averages, users, config) as
//! serialized text columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use crate::domain::{CurrentAverages, MonitoringConfig, SystemInfo, SystemStatus};
use crate::domain_types::{ConfigVersion, FingerprintValue, SystemId, SystemName, TokenValue};

use super::{
    AlertHistoryRow, AlertRecord, AveragesRow, DnsRow, FingerprintRecord, HttpRow, PingRow,
    Repository, SpeedtestRow, StoreError, StoreResult, SystemRecord,
};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

mod sql {
    pub(super) const CREATE_TABLES: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS systems (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            host TEXT NOT NULL,
            status TEXT NOT NULL,
            info TEXT,
            current_averages TEXT,
            users TEXT NOT NULL DEFAULT '[]',
            created INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS fingerprints (
            system TEXT PRIMARY KEY,
            token TEXT NOT NULL UNIQUE,
            fingerprint TEXT,
            updated INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS monitoring_config (
            system TEXT PRIMARY KEY,
            config TEXT NOT NULL,
            version INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS ping_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            system TEXT NOT NULL,
            host TEXT NOT NULL,
            packet_loss REAL NOT NULL,
            min_rtt REAL NOT NULL,
            max_rtt REAL NOT NULL,
            avg_rtt REAL NOT NULL,
            created INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS dns_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            system TEXT NOT NULL,
            domain TEXT NOT NULL,
            server TEXT NOT NULL,
            type TEXT NOT NULL,
            status TEXT NOT NULL,
            lookup_time REAL NOT NULL,
            error_code TEXT,
            created INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS http_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            system TEXT NOT NULL,
            url TEXT NOT NULL,
            status TEXT NOT NULL,
            response_time REAL NOT NULL,
            status_code INTEGER,
            error_code TEXT,
            created INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS speedtest_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            system TEXT NOT NULL,
            server_id TEXT,
            status TEXT NOT NULL,
            download_speed REAL NOT NULL,
            upload_speed REAL NOT NULL,
            latency REAL NOT NULL,
            jitter REAL NOT NULL,
            download_bytes INTEGER NOT NULL,
            upload_bytes INTEGER NOT NULL,
            error_code TEXT,
            created INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS system_averages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            system TEXT NOT NULL,
            ping_latency REAL NOT NULL,
            ping_packet_loss REAL NOT NULL,
            dns_latency REAL NOT NULL,
            dns_failure_rate REAL NOT NULL,
            http_latency REAL NOT NULL,
            http_failure_rate REAL NOT NULL,
            download_speed REAL NOT NULL,
            upload_speed REAL NOT NULL,
            created INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS alerts (
            user TEXT NOT NULL,
            system TEXT NOT NULL,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            min INTEGER NOT NULL,
            triggered INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user, system, name)
        )",
        "CREATE TABLE IF NOT EXISTS alerts_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user TEXT NOT NULL,
            system TEXT NOT NULL,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            created INTEGER NOT NULL,
            resolved INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_ping_stats_system_created
            ON ping_stats (system, created DESC)",
        "CREATE INDEX IF NOT EXISTS idx_dns_stats_system_created
            ON dns_stats (system, created DESC)",
        "CREATE INDEX IF NOT EXISTS idx_http_stats_system_created
            ON http_stats (system, created DESC)",
        "CREATE INDEX IF NOT EXISTS idx_speedtest_stats_system_created
            ON speedtest_stats (system, created DESC)",
        "CREATE INDEX IF NOT EXISTS idx_system_averages_system_created
            ON system_averages (system, created DESC)",
    ];

    pub(super) const UPSERT_SYSTEM: &str = "INSERT OR REPLACE INTO systems
        (id, name, host, status, info, current_averages, users, created)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

    pub(super) const SELECT_SYSTEMS: &str =
        "SELECT id, name, host, status, info, current_averages, users, created FROM systems";

    pub(super) const SELECT_SYSTEM: &str =
        "SELECT id, name, host, status, info, current_averages, users, created
         FROM systems WHERE id = ?";

    pub(super) const UPDATE_SYSTEM_STATUS: &str = "UPDATE systems SET status = ? WHERE id = ?";

    pub(super) const UPDATE_SYSTEM_SAMPLE: &str =
        "UPDATE systems SET status = ?, info = ?, current_averages = ? WHERE id = ?";

    pub(super) const CLEAR_SYSTEM_INFO: &str = "UPDATE systems SET info = NULL WHERE id = ?";

    pub(super) const COUNT_SYSTEMS: &str = "SELECT COUNT(*) AS n FROM systems";

    pub(super) const SELECT_FINGERPRINT_BY_TOKEN: &str =
        "SELECT system, token, fingerprint, updated FROM fingerprints WHERE token = ?";

    pub(super) const SELECT_FINGERPRINT: &str =
        "SELECT system, token, fingerprint, updated FROM fingerprints WHERE system = ?";

    pub(super) const INSERT_FINGERPRINT: &str = "INSERT OR REPLACE INTO fingerprints
        (system, token, fingerprint, updated) VALUES (?, ?, ?, ?)";

    pub(super) const BIND_FINGERPRINT: &str =
        "UPDATE fingerprints SET fingerprint = ?, updated = ? WHERE system = ?";

    pub(super) const ROTATE_TOKEN: &str =
        "UPDATE fingerprints SET token = ?, fingerprint = NULL, updated = ? WHERE system = ?";

    pub(super) const SELECT_CONFIG: &str =
        "SELECT config, version FROM monitoring_config WHERE system = ?";

    pub(super) const PUT_CONFIG: &str = "INSERT OR REPLACE INTO monitoring_config
        (system, config, version) VALUES (?, ?, ?)";

    pub(super) const INSERT_PING: &str = "INSERT INTO ping_stats
        (system, host, packet_loss, min_rtt, max_rtt, avg_rtt, created)
        VALUES (?, ?, ?, ?, ?, ?, ?)";

    pub(super) const INSERT_DNS: &str = "INSERT INTO dns_stats
        (system, domain, server, type, status, lookup_time, error_code, created)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

    pub(super) const INSERT_HTTP: &str = "INSERT INTO http_stats
        (system, url, status, response_time, status_code, error_code, created)
        VALUES (?, ?, ?, ?, ?, ?, ?)";

    pub(super) const INSERT_SPEEDTEST: &str = "INSERT INTO speedtest_stats
        (system, server_id, status, download_speed, upload_speed, latency, jitter,
         download_bytes, upload_bytes, error_code, created)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

    pub(super) const RECENT_PING: &str =
        "SELECT system, host, packet_loss, min_rtt, max_rtt, avg_rtt, created
         FROM ping_stats WHERE system = ? ORDER BY created DESC LIMIT ?";

    pub(super) const RECENT_DNS: &str =
        "SELECT system, domain, server, type, status, lookup_time, error_code, created
         FROM dns_stats WHERE system = ? ORDER BY created DESC LIMIT ?";

    pub(super) const RECENT_HTTP: &str =
        "SELECT system, url, status, response_time, status_code, error_code, created
         FROM http_stats WHERE system = ? ORDER BY created DESC LIMIT ?";

    pub(super) const RECENT_SPEEDTEST: &str =
        "SELECT system, server_id, status, download_speed, upload_speed, latency, jitter,
                download_bytes, upload_bytes, error_code, created
         FROM speedtest_stats WHERE system = ? ORDER BY created DESC LIMIT ?";

    pub(super) const INSERT_AVERAGES: &str = "INSERT INTO system_averages
        (system, ping_latency, ping_packet_loss, dns_latency, dns_failure_rate,
         http_latency, http_failure_rate, download_speed, upload_speed, created)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

    pub(super) const AVERAGES_WINDOW: &str =
        "SELECT system, ping_latency, ping_packet_loss, dns_latency, dns_failure_rate,
                http_latency, http_failure_rate, download_speed, upload_speed, created
         FROM system_averages WHERE system = ? AND created >= ? ORDER BY created ASC";

    pub(super) const LIST_ALERTS: &str =
        "SELECT user, system, name, value, min, triggered FROM alerts WHERE system = ?";

    pub(super) const SAVE_ALERT: &str = "INSERT OR REPLACE INTO alerts
        (user, system, name, value, min, triggered) VALUES (?, ?, ?, ?, ?, ?)";

    pub(super) const DEACTIVATE_ALERTS: &str =
        "UPDATE alerts SET triggered = 0 WHERE system = ? AND triggered = 1";

    pub(super) const INSERT_ALERT_HISTORY: &str = "INSERT INTO alerts_history
        (user, system, name, value, created, resolved) VALUES (?, ?, ?, ?, ?, ?)";

    pub(super) const RESOLVE_ALERT_HISTORY: &str = "UPDATE alerts_history SET resolved = ?
        WHERE id = (
            SELECT id FROM alerts_history
            WHERE user = ? AND system = ? AND name = ? AND resolved IS NULL
            ORDER BY created DESC LIMIT 1
        )";

    pub(super) const PRUNE_ALERT_HISTORY: &str = "DELETE FROM alerts_history WHERE id IN (
            SELECT id FROM (
                SELECT id, ROW_NUMBER() OVER (
                    PARTITION BY user, system ORDER BY created DESC
                ) AS rn FROM alerts_history
            ) WHERE rn > ?
        )";

    pub(super) const DELETE_SYSTEM_ROWS: &[&str] = &[
        "DELETE FROM ping_stats WHERE system = ?",
        "DELETE FROM dns_stats WHERE system = ?",
        "DELETE FROM http_stats WHERE system = ?",
        "DELETE FROM speedtest_stats WHERE system = ?",
        "DELETE FROM system_averages WHERE system = ?",
        "DELETE FROM alerts WHERE system = ?",
        "DELETE FROM alerts_history WHERE system = ?",
        "DELETE FROM monitoring_config WHERE system = ?",
        "DELETE FROM fingerprints WHERE system = ?",
        "DELETE FROM systems WHERE id = ?",
    ];

    pub(super) const PRUNE_STATS: &[&str] = &[
        "DELETE FROM ping_stats WHERE created < ?",
        "DELETE FROM dns_stats WHERE created < ?",
        "DELETE FROM http_stats WHERE created < ?",
        "DELETE FROM speedtest_stats WHERE created < ?",
        "DELETE FROM system_averages WHERE created < ?",
    ];
}

mod mapping {
    use super::*;

    pub(super) fn millis(ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis()
    }

    pub(super) fn from_millis(ms: i64, table: &'static str) -> StoreResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(ms).ok_or(StoreError::Corrupt {
            table,
            detail: format!("bad timestamp {ms}"),
        })
    }

    pub(super) fn system_id(raw: &str, table: &'static str) -> StoreResult<SystemId> {
        SystemId::try_new(raw.to_string()).map_err(|e| StoreError::Corrupt {
            table,
            detail: format!("bad system id: {e}"),
        })
    }

    pub(super) fn probe_status(
        raw: &str,
        table: &'static str,
    ) -> StoreResult<crate::domain::ProbeStatus> {
        crate::domain::ProbeStatus::parse(raw).ok_or(StoreError::Corrupt {
            table,
            detail: format!("bad status {raw:?}"),
        })
    }

    pub(super) fn json<T: serde::Serialize>(value: &T) -> String {
        serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
    }

    pub(super) fn opt_json<T: serde::de::DeserializeOwned>(
        raw: Option<String>,
        table: &'static str,
    ) -> StoreResult<Option<T>> {
        match raw {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    table,
                    detail: format!("bad json: {e}"),
                }),
        }
    }

    pub(super) fn system_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<SystemRecord> {
        let id: String = row.get("id");
        let name: String = row.get("name");
        let status: String = row.get("status");
        let info: Option<String> = row.get("info");
        let averages: Option<String> = row.get("current_averages");
        let users: String = row.get("users");
        let created: i64 = row.get("created");

        Ok(SystemRecord {
            id: system_id(&id, "systems")?,
            name: SystemName::try_new(name).map_err(|e| StoreError::Corrupt {
                table: "systems",
                detail: format!("bad name: {e}"),
            })?,
            host: row.get("host"),
            status: SystemStatus::parse(&status).ok_or(StoreError::Corrupt {
                table: "systems",
                detail: format!("bad status {status:?}"),
            })?,
            info: opt_json::<SystemInfo>(info, "systems")?,
            current_averages: opt_json::<CurrentAverages>(averages, "systems")?,
            users: serde_json::from_str(&users).map_err(|e| StoreError::Corrupt {
                table: "systems",
                detail: format!("bad users: {e}"),
            })?,
            created: from_millis(created, "systems")?,
        })
    }

    pub(super) fn fingerprint_record(
        row: &sqlx::sqlite::SqliteRow,
    ) -> StoreResult<FingerprintRecord> {
        let system: String = row.get("system");
        let token: String = row.get("token");
        let fingerprint: Option<String> = row.get("fingerprint");
        let updated: i64 = row.get("updated");

        Ok(FingerprintRecord {
            system: system_id(&system, "fingerprints")?,
            token: TokenValue::try_new(token).map_err(|e| StoreError::Corrupt {
                table: "fingerprints",
                detail: format!("bad token: {e}"),
            })?,
            fingerprint: fingerprint
                .map(|f| {
                    FingerprintValue::try_new(f).map_err(|e| StoreError::Corrupt {
                        table: "fingerprints",
                        detail: format!("bad fingerprint: {e}"),
                    })
                })
                .transpose()?,
            updated: from_millis(updated, "fingerprints")?,
        })
    }
}

/// SQLite-backed [`Repository`]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Opens (creating if missing) the database and ensures the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the file cannot be opened or
    /// the schema statements fail.
    pub async fn open(path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    /// In-memory database for tests and ephemeral runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the pool cannot be created.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        // One connection, never recycled: an in-memory database lives and
        // dies with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in sql::CREATE_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn find_systems(&self) -> StoreResult<Vec<SystemRecord>> {
        let rows = sqlx::query(sql::SELECT_SYSTEMS).fetch_all(&self.pool).await?;
        rows.iter().map(mapping::system_record).collect()
    }

    async fn get_system(&self, id: &SystemId) -> StoreResult<SystemRecord> {
        let row = sqlx::query(sql::SELECT_SYSTEM)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "system",
                id: id.to_string(),
            })?;
        mapping::system_record(&row)
    }

    async fn upsert_system(&self, record: &SystemRecord) -> StoreResult<()> {
        sqlx::query(sql::UPSERT_SYSTEM)
            .bind(record.id.to_string())
            .bind(record.name.to_string())
            .bind(&record.host)
            .bind(record.status.to_string())
            .bind(record.info.as_ref().map(mapping::json))
            .bind(record.current_averages.as_ref().map(mapping::json))
            .bind(mapping::json(&record.users))
            .bind(mapping::millis(record.created))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_system_status(&self, id: &SystemId, status: SystemStatus) -> StoreResult<()> {
        sqlx::query(sql::UPDATE_SYSTEM_STATUS)
            .bind(status.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_system_sample(
        &self,
        id: &SystemId,
        status: SystemStatus,
        info: &SystemInfo,
        averages: &CurrentAverages,
    ) -> StoreResult<()> {
        sqlx::query(sql::UPDATE_SYSTEM_SAMPLE)
            .bind(status.to_string())
            .bind(mapping::json(info))
            .bind(mapping::json(averages))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_system_info(&self, id: &SystemId) -> StoreResult<()> {
        sqlx::query(sql::CLEAR_SYSTEM_INFO)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_system(&self, id: &SystemId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in sql::DELETE_SYSTEM_ROWS {
            sqlx::query(statement)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn any_systems(&self) -> StoreResult<bool> {
        let row = sqlx::query(sql::COUNT_SYSTEMS).fetch_one(&self.pool).await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    async fn get_fingerprint_by_token(
        &self,
        token: &TokenValue,
    ) -> StoreResult<Option<FingerprintRecord>> {
        let row = sqlx::query(sql::SELECT_FINGERPRINT_BY_TOKEN)
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(mapping::fingerprint_record).transpose()
    }

    async fn get_fingerprint(&self, system: &SystemId) -> StoreResult<FingerprintRecord> {
        let row = sqlx::query(sql::SELECT_FINGERPRINT)
            .bind(system.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "fingerprint",
                id: system.to_string(),
            })?;
        mapping::fingerprint_record(&row)
    }

    async fn insert_fingerprint(&self, record: &FingerprintRecord) -> StoreResult<()> {
        sqlx::query(sql::INSERT_FINGERPRINT)
            .bind(record.system.to_string())
            .bind(record.token.to_string())
            .bind(record.fingerprint.as_ref().map(ToString::to_string))
            .bind(mapping::millis(record.updated))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bind_fingerprint(
        &self,
        system: &SystemId,
        fingerprint: &FingerprintValue,
    ) -> StoreResult<()> {
        sqlx::query(sql::BIND_FINGERPRINT)
            .bind(fingerprint.to_string())
            .bind(mapping::millis(Utc::now()))
            .bind(system.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rotate_token(&self, system: &SystemId, token: &TokenValue) -> StoreResult<()> {
        sqlx::query(sql::ROTATE_TOKEN)
            .bind(token.to_string())
            .bind(mapping::millis(Utc::now()))
            .bind(system.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_monitoring_config(
        &self,
        system: &SystemId,
    ) -> StoreResult<Option<(MonitoringConfig, ConfigVersion)>> {
        let row = sqlx::query(sql::SELECT_CONFIG)
            .bind(system.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };

        let raw: String = row.get("config");
        let version: i64 = row.get("version");
        let config = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            table: "monitoring_config",
            detail: format!("bad json: {e}"),
        })?;
        let version = ConfigVersion::try_new(version).map_err(|e| StoreError::Corrupt {
            table: "monitoring_config",
            detail: format!("bad version: {e}"),
        })?;
        Ok(Some((config, version)))
    }

    async fn put_monitoring_config(
        &self,
        system: &SystemId,
        config: &MonitoringConfig,
        version: ConfigVersion,
    ) -> StoreResult<()> {
        sqlx::query(sql::PUT_CONFIG)
            .bind(system.to_string())
            .bind(mapping::json(config))
            .bind(version.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_ping_row(&self, row: &PingRow) -> StoreResult<()> {
        sqlx::query(sql::INSERT_PING)
            .bind(row.system.to_string())
            .bind(&row.host)
            .bind(row.packet_loss)
            .bind(row.min_rtt)
            .bind(row.max_rtt)
            .bind(row.avg_rtt)
            .bind(mapping::millis(row.created))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_dns_row(&self, row: &DnsRow) -> StoreResult<()> {
        sqlx::query(sql::INSERT_DNS)
            .bind(row.system.to_string())
            .bind(&row.domain)
            .bind(&row.server)
            .bind(&row.record_type)
            .bind(row.status.as_str())
            .bind(row.lookup_time)
            .bind(&row.error_code)
            .bind(mapping::millis(row.created))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_http_row(&self, row: &HttpRow) -> StoreResult<()> {
        sqlx::query(sql::INSERT_HTTP)
            .bind(row.system.to_string())
            .bind(&row.url)
            .bind(row.status.as_str())
            .bind(row.response_time)
            .bind(row.status_code.map(i64::from))
            .bind(&row.error_code)
            .bind(mapping::millis(row.created))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_speedtest_row(&self, row: &SpeedtestRow) -> StoreResult<()> {
        sqlx::query(sql::INSERT_SPEEDTEST)
            .bind(row.system.to_string())
            .bind(&row.server_id)
            .bind(row.status.as_str())
            .bind(row.download_speed)
            .bind(row.upload_speed)
            .bind(row.latency)
            .bind(row.jitter)
            .bind(row.download_bytes as i64)
            .bind(row.upload_bytes as i64)
            .bind(&row.error_code)
            .bind(mapping::millis(row.created))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_ping_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<PingRow>> {
        let rows = sqlx::query(sql::RECENT_PING)
            .bind(system.to_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let system: String = row.get("system");
                let created: i64 = row.get("created");
                Ok(PingRow {
                    system: mapping::system_id(&system, "ping_stats")?,
                    host: row.get("host"),
                    packet_loss: row.get("packet_loss"),
                    min_rtt: row.get("min_rtt"),
                    max_rtt: row.get("max_rtt"),
                    avg_rtt: row.get("avg_rtt"),
                    created: mapping::from_millis(created, "ping_stats")?,
                })
            })
            .collect()
    }

    async fn recent_dns_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<DnsRow>> {
        let rows = sqlx::query(sql::RECENT_DNS)
            .bind(system.to_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let system: String = row.get("system");
                let status: String = row.get("status");
                let created: i64 = row.get("created");
                Ok(DnsRow {
                    system: mapping::system_id(&system, "dns_stats")?,
                    domain: row.get("domain"),
                    server: row.get("server"),
                    record_type: row.get("type"),
                    status: mapping::probe_status(&status, "dns_stats")?,
                    lookup_time: row.get("lookup_time"),
                    error_code: row.get("error_code"),
                    created: mapping::from_millis(created, "dns_stats")?,
                })
            })
            .collect()
    }

    async fn recent_http_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<HttpRow>> {
        let rows = sqlx::query(sql::RECENT_HTTP)
            .bind(system.to_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let system: String = row.get("system");
                let status: String = row.get("status");
                let status_code: Option<i64> = row.get("status_code");
                let created: i64 = row.get("created");
                Ok(HttpRow {
                    system: mapping::system_id(&system, "http_stats")?,
                    url: row.get("url"),
                    status: mapping::probe_status(&status, "http_stats")?,
                    response_time: row.get("response_time"),
                    status_code: status_code.map(|c| c as u16),
                    error_code: row.get("error_code"),
                    created: mapping::from_millis(created, "http_stats")?,
                })
            })
            .collect()
    }

    async fn recent_speedtest_rows(
        &self,
        system: &SystemId,
        limit: u32,
    ) -> StoreResult<Vec<SpeedtestRow>> {
        let rows = sqlx::query(sql::RECENT_SPEEDTEST)
            .bind(system.to_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let system: String = row.get("system");
                let status: String = row.get("status");
                let download_bytes: i64 = row.get("download_bytes");
                let upload_bytes: i64 = row.get("upload_bytes");
                let created: i64 = row.get("created");
                Ok(SpeedtestRow {
                    system: mapping::system_id(&system, "speedtest_stats")?,
                    server_id: row.get("server_id"),
                    status: mapping::probe_status(&status, "speedtest_stats")?,
                    download_speed: row.get("download_speed"),
                    upload_speed: row.get("upload_speed"),
                    latency: row.get("latency"),
                    jitter: row.get("jitter"),
                    download_bytes: download_bytes.max(0) as u64,
                    upload_bytes: upload_bytes.max(0) as u64,
                    error_code: row.get("error_code"),
                    created: mapping::from_millis(created, "speedtest_stats")?,
                })
            })
            .collect()
    }

    async fn insert_averages_row(&self, row: &AveragesRow) -> StoreResult<()> {
        sqlx::query(sql::INSERT_AVERAGES)
            .bind(row.system.to_string())
            .bind(row.ping_latency)
            .bind(row.ping_packet_loss)
            .bind(row.dns_latency)
            .bind(row.dns_failure_rate)
            .bind(row.http_latency)
            .bind(row.http_failure_rate)
            .bind(row.download_speed)
            .bind(row.upload_speed)
            .bind(mapping::millis(row.created))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn averages_window(
        &self,
        system: &SystemId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AveragesRow>> {
        let rows = sqlx::query(sql::AVERAGES_WINDOW)
            .bind(system.to_string())
            .bind(mapping::millis(since))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let system: String = row.get("system");
                let created: i64 = row.get("created");
                Ok(AveragesRow {
                    system: mapping::system_id(&system, "system_averages")?,
                    ping_latency: row.get("ping_latency"),
                    ping_packet_loss: row.get("ping_packet_loss"),
                    dns_latency: row.get("dns_latency"),
                    dns_failure_rate: row.get("dns_failure_rate"),
                    http_latency: row.get("http_latency"),
                    http_failure_rate: row.get("http_failure_rate"),
                    download_speed: row.get("download_speed"),
                    upload_speed: row.get("upload_speed"),
                    created: mapping::from_millis(created, "system_averages")?,
                })
            })
            .collect()
    }

    async fn list_alerts(&self, system: &SystemId) -> StoreResult<Vec<AlertRecord>> {
        let rows = sqlx::query(sql::LIST_ALERTS)
            .bind(system.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let system: String = row.get("system");
                let min: i64 = row.get("min");
                let triggered: i64 = row.get("triggered");
                Ok(AlertRecord {
                    user: row.get("user"),
                    system: mapping::system_id(&system, "alerts")?,
                    name: row.get("name"),
                    value: row.get("value"),
                    min: min.max(0) as u32,
                    triggered: triggered != 0,
                })
            })
            .collect()
    }

    async fn save_alert(&self, alert: &AlertRecord) -> StoreResult<()> {
        sqlx::query(sql::SAVE_ALERT)
            .bind(&alert.user)
            .bind(alert.system.to_string())
            .bind(&alert.name)
            .bind(alert.value)
            .bind(i64::from(alert.min))
            .bind(i64::from(alert.triggered))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deactivate_alerts(&self, system: &SystemId) -> StoreResult<u64> {
        let done = sqlx::query(sql::DEACTIVATE_ALERTS)
            .bind(system.to_string())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn insert_alert_history(&self, row: &AlertHistoryRow) -> StoreResult<()> {
        sqlx::query(sql::INSERT_ALERT_HISTORY)
            .bind(&row.user)
            .bind(row.system.to_string())
            .bind(&row.name)
            .bind(row.value)
            .bind(mapping::millis(row.created))
            .bind(row.resolved.map(mapping::millis))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_alert_history(
        &self,
        user: &str,
        system: &SystemId,
        name: &str,
        resolved: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(sql::RESOLVE_ALERT_HISTORY)
            .bind(mapping::millis(resolved))
            .bind(user)
            .bind(system.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_stats(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut removed = 0;
        for statement in sql::PRUNE_STATS {
            let done = sqlx::query(statement)
                .bind(mapping::millis(cutoff))
                .execute(&self.pool)
                .await?;
            removed += done.rows_affected();
        }
        Ok(removed)
    }

    async fn prune_alerts_history(&self, keep: u32) -> StoreResult<u64> {
        let done = sqlx::query(sql::PRUNE_ALERT_HISTORY)
            .bind(i64::from(keep))
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(id: &SystemId) -> SystemRecord {
        SystemRecord {
            id: id.clone(),
            name: SystemName::try_new("edge-1".to_string()).unwrap(),
            host: "edge-1.example.org".to_string(),
            status: SystemStatus::Pending,
            info: None,
            current_averages: None,
            users: vec!["ops".to_string()],
            created: Utc::now(),
        }
    }

    fn ping_row(id: &SystemId, avg: f64, at: DateTime<Utc>) -> PingRow {
        PingRow {
            system: id.clone(),
            host: "8.8.8.8".to_string(),
            packet_loss: 0.0,
            min_rtt: avg - 0.4,
            max_rtt: avg + 0.4,
            avg_rtt: avg,
            created: at,
        }
    }

    #[tokio::test]
    async fn system_round_trips() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let id = SystemId::generate();
        let record = system(&id);
        repo.upsert_system(&record).await.unwrap();

        let loaded = repo.get_system(&id).await.unwrap();
        assert_eq!(loaded.name.to_string(), "edge-1");
        assert_eq!(loaded.status, SystemStatus::Pending);
        assert_eq!(loaded.users, vec!["ops".to_string()]);
        assert!(repo.any_systems().await.unwrap());
    }

    #[tokio::test]
    async fn missing_system_is_not_found() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let err = repo.get_system(&SystemId::generate()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn recent_rows_honor_the_limit_and_order() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let id = SystemId::generate();
        repo.upsert_system(&system(&id)).await.unwrap();

        let base = Utc::now();
        for i in 0..12 {
            repo.insert_ping_row(&ping_row(
                &id,
                10.0 + f64::from(i),
                base + chrono::Duration::seconds(i64::from(i)),
            ))
            .await
            .unwrap();
        }

        let rows = repo.recent_ping_rows(&id, 10).await.unwrap();
        assert_eq!(rows.len(), 10);
        // newest first
        assert_eq!(rows[0].avg_rtt, 21.0);
        assert_eq!(rows[9].avg_rtt, 12.0);
    }

    #[tokio::test]
    async fn fingerprint_token_lookup_and_rotation() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let id = SystemId::generate();
        repo.upsert_system(&system(&id)).await.unwrap();

        let token = TokenValue::try_new("tok-1".to_string()).unwrap();
        repo.insert_fingerprint(&FingerprintRecord {
            system: id.clone(),
            token: token.clone(),
            fingerprint: None,
            updated: Utc::now(),
        })
        .await
        .unwrap();

        let fp = FingerprintValue::try_new("agent-hash".to_string()).unwrap();
        repo.bind_fingerprint(&id, &fp).await.unwrap();
        let loaded = repo.get_fingerprint_by_token(&token).await.unwrap().unwrap();
        assert_eq!(loaded.fingerprint, Some(fp));

        let new_token = TokenValue::try_new("tok-2".to_string()).unwrap();
        repo.rotate_token(&id, &new_token).await.unwrap();
        assert!(repo.get_fingerprint_by_token(&token).await.unwrap().is_none());
        let rotated = repo
            .get_fingerprint_by_token(&new_token)
            .await
            .unwrap()
            .unwrap();
        // rotation unbinds the agent identity
        assert_eq!(rotated.fingerprint, None);
    }

    #[tokio::test]
    async fn prune_deletes_strictly_older_rows() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let id = SystemId::generate();
        repo.upsert_system(&system(&id)).await.unwrap();

        let cutoff = Utc::now();
        repo.insert_ping_row(&ping_row(&id, 9.0, cutoff - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        repo.insert_ping_row(&ping_row(&id, 10.0, cutoff))
            .await
            .unwrap();
        repo.insert_ping_row(&ping_row(&id, 11.0, cutoff + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let removed = repo.prune_stats(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        let rows = repo.recent_ping_rows(&id, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn alert_history_resolution_targets_newest_open_row() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let id = SystemId::generate();
        let base = Utc::now();

        for offset in [0, 60] {
            repo.insert_alert_history(&AlertHistoryRow {
                user: "ops".to_string(),
                system: id.clone(),
                name: "PingLatency".to_string(),
                value: 62.0,
                created: base + chrono::Duration::seconds(offset),
                resolved: None,
            })
            .await
            .unwrap();
        }

        repo.resolve_alert_history("ops", &id, "PingLatency", base + chrono::Duration::seconds(120))
            .await
            .unwrap();

        // one row resolved, one still open; trimming to 1 keeps the newest
        let removed = repo.prune_alerts_history(1).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn monitoring_config_round_trips_with_version() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let id = SystemId::generate();
        let config = MonitoringConfig::default();
        let version = ConfigVersion::try_new(1_700_000_000).unwrap();

        repo.put_monitoring_config(&id, &config, version).await.unwrap();
        let (loaded, loaded_version) = repo.get_monitoring_config(&id).await.unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded_version, version);
    }
}
