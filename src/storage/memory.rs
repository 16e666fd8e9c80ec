//! In-memory repository for unit tests
//!
//! Mirrors the SQLite semantics (ordering, pruning, resolution targeting)
//! closely enough that hub components can be exercised without a database
//! file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{CurrentAverages, MonitoringConfig, SystemInfo, SystemStatus};
use crate::domain_types::{ConfigVersion, FingerprintValue, SystemId, TokenValue};

use super::{
    AlertHistoryRow, AlertRecord, AveragesRow, DnsRow, FingerprintRecord, HttpRow, PingRow,
    Repository, SpeedtestRow, StoreError, StoreResult, SystemRecord,
};

#[derive(Default)]
struct Inner {
    systems: HashMap<SystemId, SystemRecord>,
    fingerprints: HashMap<SystemId, FingerprintRecord>,
    configs: HashMap<SystemId, (MonitoringConfig, ConfigVersion)>,
    ping: Vec<PingRow>,
    dns: Vec<DnsRow>,
    http: Vec<HttpRow>,
    speedtest: Vec<SpeedtestRow>,
    averages: Vec<AveragesRow>,
    alerts: HashMap<(String, SystemId, String), AlertRecord>,
    history: Vec<AlertHistoryRow>,
}

/// Heap-backed [`Repository`] with SQLite-equivalent semantics
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    /// Creates an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("repository mutex poisoned")
    }
}

fn recent<T: Clone>(
    rows: &[T],
    system: &SystemId,
    limit: u32,
    owner: impl Fn(&T) -> SystemId,
    created: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T> {
    let mut matching: Vec<T> = rows.iter().filter(|r| owner(r) == *system).cloned().collect();
    matching.sort_by_key(|r| std::cmp::Reverse(created(r)));
    matching.truncate(limit as usize);
    matching
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_systems(&self) -> StoreResult<Vec<SystemRecord>> {
        Ok(self.lock().systems.values().cloned().collect())
    }

    async fn get_system(&self, id: &SystemId) -> StoreResult<SystemRecord> {
        self.lock()
            .systems
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "system",
                id: id.to_string(),
            })
    }

    async fn upsert_system(&self, record: &SystemRecord) -> StoreResult<()> {
        self.lock().systems.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_system_status(&self, id: &SystemId, status: SystemStatus) -> StoreResult<()> {
        if let Some(record) = self.lock().systems.get_mut(id) {
            record.status = status;
        }
        Ok(())
    }

    async fn update_system_sample(
        &self,
        id: &SystemId,
        status: SystemStatus,
        info: &SystemInfo,
        averages: &CurrentAverages,
    ) -> StoreResult<()> {
        if let Some(record) = self.lock().systems.get_mut(id) {
            record.status = status;
            record.info = Some(info.clone());
            record.current_averages = Some(averages.clone());
        }
        Ok(())
    }

    async fn clear_system_info(&self, id: &SystemId) -> StoreResult<()> {
        if let Some(record) = self.lock().systems.get_mut(id) {
            record.info = None;
        }
        Ok(())
    }

    async fn delete_system(&self, id: &SystemId) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.systems.remove(id);
        inner.fingerprints.remove(id);
        inner.configs.remove(id);
        inner.ping.retain(|r| r.system != *id);
        inner.dns.retain(|r| r.system != *id);
        inner.http.retain(|r| r.system != *id);
        inner.speedtest.retain(|r| r.system != *id);
        inner.averages.retain(|r| r.system != *id);
        inner.alerts.retain(|(_, s, _), _| s != id);
        inner.history.retain(|r| r.system != *id);
        Ok(())
    }

    async fn any_systems(&self) -> StoreResult<bool> {
        Ok(!self.lock().systems.is_empty())
    }

    async fn get_fingerprint_by_token(
        &self,
        token: &TokenValue,
    ) -> StoreResult<Option<FingerprintRecord>> {
        Ok(self
            .lock()
            .fingerprints
            .values()
            .find(|f| f.token == *token)
            .cloned())
    }

    async fn get_fingerprint(&self, system: &SystemId) -> StoreResult<FingerprintRecord> {
        self.lock()
            .fingerprints
            .get(system)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "fingerprint",
                id: system.to_string(),
            })
    }

    async fn insert_fingerprint(&self, record: &FingerprintRecord) -> StoreResult<()> {
        self.lock()
            .fingerprints
            .insert(record.system.clone(), record.clone());
        Ok(())
    }

    async fn bind_fingerprint(
        &self,
        system: &SystemId,
        fingerprint: &FingerprintValue,
    ) -> StoreResult<()> {
        if let Some(record) = self.lock().fingerprints.get_mut(system) {
            record.fingerprint = Some(fingerprint.clone());
            record.updated = Utc::now();
        }
        Ok(())
    }

    async fn rotate_token(&self, system: &SystemId, token: &TokenValue) -> StoreResult<()> {
        if let Some(record) = self.lock().fingerprints.get_mut(system) {
            record.token = token.clone();
            record.fingerprint = None;
            record.updated = Utc::now();
        }
        Ok(())
    }

    async fn get_monitoring_config(
        &self,
        system: &SystemId,
    ) -> StoreResult<Option<(MonitoringConfig, ConfigVersion)>> {
        Ok(self.lock().configs.get(system).cloned())
    }

    async fn put_monitoring_config(
        &self,
        system: &SystemId,
        config: &MonitoringConfig,
        version: ConfigVersion,
    ) -> StoreResult<()> {
        self.lock()
            .configs
            .insert(system.clone(), (config.clone(), version));
        Ok(())
    }

    async fn insert_ping_row(&self, row: &PingRow) -> StoreResult<()> {
        self.lock().ping.push(row.clone());
        Ok(())
    }

    async fn insert_dns_row(&self, row: &DnsRow) -> StoreResult<()> {
        self.lock().dns.push(row.clone());
        Ok(())
    }

    async fn insert_http_row(&self, row: &HttpRow) -> StoreResult<()> {
        self.lock().http.push(row.clone());
        Ok(())
    }

    async fn insert_speedtest_row(&self, row: &SpeedtestRow) -> StoreResult<()> {
        self.lock().speedtest.push(row.clone());
        Ok(())
    }

    async fn recent_ping_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<PingRow>> {
        Ok(recent(
            &self.lock().ping,
            system,
            limit,
            |r| r.system.clone(),
            |r| r.created,
        ))
    }

    async fn recent_dns_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<DnsRow>> {
        Ok(recent(
            &self.lock().dns,
            system,
            limit,
            |r| r.system.clone(),
            |r| r.created,
        ))
    }

    async fn recent_http_rows(&self, system: &SystemId, limit: u32) -> StoreResult<Vec<HttpRow>> {
        Ok(recent(
            &self.lock().http,
            system,
            limit,
            |r| r.system.clone(),
            |r| r.created,
        ))
    }

    async fn recent_speedtest_rows(
        &self,
        system: &SystemId,
        limit: u32,
    ) -> StoreResult<Vec<SpeedtestRow>> {
        Ok(recent(
            &self.lock().speedtest,
            system,
            limit,
            |r| r.system.clone(),
            |r| r.created,
        ))
    }

    async fn insert_averages_row(&self, row: &AveragesRow) -> StoreResult<()> {
        self.lock().averages.push(row.clone());
        Ok(())
    }

    async fn averages_window(
        &self,
        system: &SystemId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AveragesRow>> {
        let mut rows: Vec<AveragesRow> = self
            .lock()
            .averages
            .iter()
            .filter(|r| r.system == *system && r.created >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created);
        Ok(rows)
    }

    async fn list_alerts(&self, system: &SystemId) -> StoreResult<Vec<AlertRecord>> {
        Ok(self
            .lock()
            .alerts
            .values()
            .filter(|a| a.system == *system)
            .cloned()
            .collect())
    }

    async fn save_alert(&self, alert: &AlertRecord) -> StoreResult<()> {
        self.lock().alerts.insert(
            (alert.user.clone(), alert.system.clone(), alert.name.clone()),
            alert.clone(),
        );
        Ok(())
    }

    async fn deactivate_alerts(&self, system: &SystemId) -> StoreResult<u64> {
        let mut cleared = 0;
        for alert in self.lock().alerts.values_mut() {
            if alert.system == *system && alert.triggered {
                alert.triggered = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn insert_alert_history(&self, row: &AlertHistoryRow) -> StoreResult<()> {
        self.lock().history.push(row.clone());
        Ok(())
    }

    async fn resolve_alert_history(
        &self,
        user: &str,
        system: &SystemId,
        name: &str,
        resolved: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(row) = inner
            .history
            .iter_mut()
            .filter(|r| {
                r.user == user && r.system == *system && r.name == name && r.resolved.is_none()
            })
            .max_by_key(|r| r.created)
        {
            row.resolved = Some(resolved);
        }
        Ok(())
    }

    async fn prune_stats(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock();
        let before = inner.ping.len()
            + inner.dns.len()
            + inner.http.len()
            + inner.speedtest.len()
            + inner.averages.len();
        inner.ping.retain(|r| r.created >= cutoff);
        inner.dns.retain(|r| r.created >= cutoff);
        inner.http.retain(|r| r.created >= cutoff);
        inner.speedtest.retain(|r| r.created >= cutoff);
        inner.averages.retain(|r| r.created >= cutoff);
        let after = inner.ping.len()
            + inner.dns.len()
            + inner.http.len()
            + inner.speedtest.len()
            + inner.averages.len();
        Ok((before - after) as u64)
    }

    async fn prune_alerts_history(&self, keep: u32) -> StoreResult<u64> {
        let mut inner = self.lock();
        let mut grouped: HashMap<(String, SystemId), Vec<usize>> = HashMap::new();
        for (idx, row) in inner.history.iter().enumerate() {
            grouped
                .entry((row.user.clone(), row.system.clone()))
                .or_default()
                .push(idx);
        }

        let mut drop: Vec<usize> = Vec::new();
        for indexes in grouped.into_values() {
            let mut ordered = indexes;
            ordered.sort_by_key(|&i| std::cmp::Reverse(inner.history[i].created));
            drop.extend(ordered.into_iter().skip(keep as usize));
        }
        drop.sort_unstable_by(|a, b| b.cmp(a));
        let removed = drop.len() as u64;
        for idx in drop {
            inner.history.remove(idx);
        }
        Ok(removed)
    }
}
