//! Single-entry snapshot cache
//!
//! When several sessions sample the agent in quick succession, recomputing
//! the snapshot would drain the probe managers for nothing. The last
//! snapshot is cached under the session id that produced it with a short
//! lease: a *different* session asking within the lease gets the cached
//! copy, while the producing session (or anyone after expiry) forces a
//! recompute.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::CombinedData;
use crate::time_provider::SharedClock;

/// Default lease on a cached snapshot
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

struct Entry {
    session_id: String,
    data: CombinedData,
    cached_at: chrono::DateTime<chrono::Utc>,
}

/// Caches the last snapshot under the session that produced it
pub struct SessionCache {
    entry: Mutex<Option<Entry>>,
    lease: Duration,
    clock: SharedClock,
}

impl SessionCache {
    /// Creates a cache with the given lease
    pub fn new(lease: Duration, clock: SharedClock) -> Self {
        Self {
            entry: Mutex::new(None),
            lease,
            clock,
        }
    }

    /// Returns the cached snapshot when `session_id` is not the producer
    /// and the lease has not expired.
    pub async fn get(&self, session_id: &str) -> Option<CombinedData> {
        let entry = self.entry.lock().await;
        let entry = entry.as_ref()?;
        if entry.session_id == session_id {
            return None;
        }
        let age = (self.clock.now() - entry.cached_at).to_std().ok()?;
        if age <= self.lease {
            Some(entry.data.clone())
        } else {
            None
        }
    }

    /// Stores a fresh snapshot under its producing session
    pub async fn put(&self, session_id: &str, data: CombinedData) {
        *self.entry.lock().await = Some(Entry {
            session_id: session_id.to_string(),
            data,
            cached_at: self.clock.now(),
        });
    }

    /// Drops the cached snapshot
    pub async fn clear(&self) {
        *self.entry.lock().await = None;
    }

    /// Shared construction with the default lease
    pub fn shared(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self::new(DEFAULT_LEASE, clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::system_clock;

    fn snapshot(version: &str) -> CombinedData {
        CombinedData {
            info: crate::domain::SystemInfo {
                version: version.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn producer_session_always_recomputes() {
        let cache = SessionCache::new(Duration::from_secs(60), system_clock());
        cache.put("primary", snapshot("a")).await;
        assert!(cache.get("primary").await.is_none());
    }

    #[tokio::test]
    async fn other_sessions_get_the_cached_copy_within_lease() {
        let cache = SessionCache::new(Duration::from_secs(60), system_clock());
        cache.put("primary", snapshot("a")).await;
        let hit = cache.get("secondary").await.unwrap();
        assert_eq!(hit.info.version, "a");
    }

    #[tokio::test]
    async fn zero_lease_expires_immediately() {
        let cache = SessionCache::new(Duration::ZERO, system_clock());
        cache.put("primary", snapshot("a")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("secondary").await.is_none());
    }
}
