//! Agent-side probe managers
//!
//! Four probe classes share one manager shape: a target map, a latest-result
//! map, a cron job, and a cancellation scope. Results are drained with
//! snapshot semantics; applying a new configuration always clears the result
//! map so stale measurements never leak across config epochs.

pub mod dns;
pub mod http;
pub mod ping;
pub mod scheduler;
pub mod speedtest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::time_provider::SharedClock;
pub use scheduler::{JobSpec, ScheduleError, parse_cron, parse_interval};

/// Ping results stay readable for this long to bridge sampling gaps
pub const PING_RESULT_GRACE: Duration = Duration::from_secs(5 * 60);

/// One probe class: how to key targets and measure them
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Configured target type
    type Target: Clone + Send + Sync + 'static;
    /// Result-map key derived from a target
    type Key: Eq + Hash + Clone + Send + Sync + 'static;
    /// Measurement produced per target
    type Output: Clone + Send + Sync + 'static;

    /// Class name for logs
    fn class(&self) -> &'static str;

    /// Result-map key for a target
    fn key(target: &Self::Target) -> Self::Key;

    /// Measures every target. Implementations fan out concurrently except
    /// where parallel runs would interfere (bandwidth tests). A target that
    /// produces nothing is simply absent from the output; failures never
    /// abort the batch.
    async fn probe_all(&self, targets: &[Self::Target]) -> Vec<(Self::Key, Self::Output)>;
}

struct ManagerState<P: Prober> {
    targets: HashMap<P::Key, P::Target>,
    results: HashMap<P::Key, P::Output>,
    last_result: Option<DateTime<Utc>>,
}

impl<P: Prober> Default for ManagerState<P> {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
            results: HashMap::new(),
            last_result: None,
        }
    }
}

/// Schedules one probe class and buffers its latest results
pub struct ProbeManager<P: Prober> {
    prober: Arc<P>,
    state: Arc<RwLock<ManagerState<P>>>,
    /// Read grace for drained results; `None` means drain-on-read
    retention: Option<Duration>,
    clock: SharedClock,
    job: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<P: Prober> ProbeManager<P> {
    /// Creates a manager with drain-on-read semantics
    pub fn new(prober: P, clock: SharedClock) -> Self {
        Self::with_retention(prober, clock, None)
    }

    /// Creates a manager whose results stay readable for `retention`
    pub fn with_retention(prober: P, clock: SharedClock, retention: Option<Duration>) -> Self {
        Self {
            prober: Arc::new(prober),
            state: Arc::new(RwLock::new(ManagerState::default())),
            retention,
            clock,
            job: Mutex::new(None),
        }
    }

    /// Replaces targets and reschedules the job.
    ///
    /// The result map is always cleared on apply. An empty interval stops
    /// the job; targets are still stored so a later interval can pick them
    /// up.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when the interval is neither empty, a
    /// duration, nor a 5-field cron expression; nothing is applied then.
    pub async fn update_config(
        &self,
        targets: Vec<P::Target>,
        interval: &str,
    ) -> Result<(), ScheduleError> {
        let spec = parse_interval(interval)?;

        self.cancel_job().await;

        {
            let mut state = self.state.write().await;
            state.targets = targets.into_iter().map(|t| (P::key(&t), t)).collect();
            state.results.clear();
            state.last_result = None;
        }

        let target_count = self.state.read().await.targets.len();
        match spec {
            Some(spec) if target_count > 0 => {
                info!(
                    class = self.prober.class(),
                    targets = target_count,
                    interval,
                    "probe job scheduled"
                );
                self.spawn_job(spec).await;
            }
            _ => {
                debug!(
                    class = self.prober.class(),
                    targets = target_count,
                    "probe job disabled"
                );
            }
        }
        Ok(())
    }

    /// Drains the current results.
    ///
    /// Returns a deep copy of the result map and clears it. With a retention
    /// window configured, fresh results are returned without clearing;
    /// results older than the window are dropped and `None` is returned.
    pub async fn get_results(&self) -> Option<HashMap<P::Key, P::Output>> {
        let mut state = self.state.write().await;
        if state.results.is_empty() {
            return None;
        }

        match self.retention {
            None => Some(std::mem::take(&mut state.results)),
            Some(grace) => {
                let age = state
                    .last_result
                    .map(|at| self.clock.now() - at)
                    .and_then(|d| d.to_std().ok());
                match age {
                    Some(age) if age <= grace => Some(state.results.clone()),
                    _ => {
                        state.results.clear();
                        state.last_result = None;
                        None
                    }
                }
            }
        }
    }

    /// Runs the probe batch immediately and stores the output
    pub async fn run_once(&self) {
        let targets: Vec<P::Target> = {
            let state = self.state.read().await;
            state.targets.values().cloned().collect()
        };
        if targets.is_empty() {
            return;
        }

        let produced = self.prober.probe_all(&targets).await;
        debug!(
            class = self.prober.class(),
            produced = produced.len(),
            "probe batch finished"
        );

        let mut state = self.state.write().await;
        for (key, output) in produced {
            state.results.insert(key, output);
        }
        state.last_result = Some(self.clock.now());
    }

    /// Cancels the scope and stops the cron job
    pub async fn stop(&self) {
        self.cancel_job().await;
        debug!(class = self.prober.class(), "probe manager stopped");
    }

    async fn spawn_job(&self, spec: JobSpec) {
        let token = CancellationToken::new();
        let state = Arc::clone(&self.state);
        let prober = Arc::clone(&self.prober);
        let clock = Arc::clone(&self.clock);
        let tick_clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(scheduler::run_job(spec, clock, token.clone(), move || {
            let state = Arc::clone(&state);
            let prober = Arc::clone(&prober);
            let clock = Arc::clone(&tick_clock);
            async move {
                let targets: Vec<P::Target> =
                    { state.read().await.targets.values().cloned().collect() };
                if targets.is_empty() {
                    return;
                }
                let produced = prober.probe_all(&targets).await;
                let mut state = state.write().await;
                for (key, output) in produced {
                    state.results.insert(key, output);
                }
                state.last_result = Some(clock.now());
            }
        }));

        *self.job.lock().await = Some((token, handle));
    }

    async fn cancel_job(&self) {
        if let Some((token, handle)) = self.job.lock().await.take() {
            token.cancel();
            handle.abort();
        }
    }
}

/// Checks whether an external probe binary responds to `--version`.
///
/// A missing binary marks the probe class unavailable; the agent keeps
/// running and skips the class instead of crashing.
pub async fn binary_available(binary: &str) -> bool {
    match tokio::process::Command::new(binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::{SharedClock, TimeProvider, fast_forward_clock};

    /// Prober that echoes target names with a run counter
    struct EchoProber {
        runs: std::sync::atomic::AtomicUsize,
    }

    impl EchoProber {
        fn new() -> Self {
            Self {
                runs: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for EchoProber {
        type Target = String;
        type Key = String;
        type Output = usize;

        fn class(&self) -> &'static str {
            "echo"
        }

        fn key(target: &Self::Target) -> Self::Key {
            target.clone()
        }

        async fn probe_all(&self, targets: &[Self::Target]) -> Vec<(Self::Key, Self::Output)> {
            let run = self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            targets.iter().map(|t| (t.clone(), run)).collect()
        }
    }

    /// Clock whose "now" can be pushed forward from the test
    #[derive(Debug)]
    struct SteppingClock {
        offset: std::sync::Mutex<chrono::Duration>,
    }

    impl SteppingClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                offset: std::sync::Mutex::new(chrono::Duration::zero()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut offset = self.offset.lock().unwrap();
            *offset += chrono::Duration::from_std(by).unwrap();
        }
    }

    #[async_trait]
    impl TimeProvider for SteppingClock {
        async fn sleep(&self, _duration: Duration) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        fn now(&self) -> DateTime<Utc> {
            Utc::now() + *self.offset.lock().unwrap()
        }
    }

    #[tokio::test]
    async fn get_results_drains_the_map() {
        let mgr = ProbeManager::new(EchoProber::new(), fast_forward_clock());
        mgr.update_config(vec!["a".to_string(), "b".to_string()], "")
            .await
            .unwrap();
        mgr.run_once().await;

        let first = mgr.get_results().await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(mgr.get_results().await.is_none(), "second read is empty");
    }

    #[tokio::test]
    async fn update_config_clears_previous_results() {
        let mgr = ProbeManager::new(EchoProber::new(), fast_forward_clock());
        mgr.update_config(vec!["a".to_string()], "").await.unwrap();
        mgr.run_once().await;

        mgr.update_config(vec!["a".to_string()], "").await.unwrap();
        assert!(mgr.get_results().await.is_none());
    }

    #[tokio::test]
    async fn bad_interval_rejected_without_applying() {
        let mgr = ProbeManager::new(EchoProber::new(), fast_forward_clock());
        mgr.update_config(vec!["a".to_string()], "").await.unwrap();
        mgr.run_once().await;

        assert!(
            mgr.update_config(vec!["b".to_string()], "not-a-schedule")
                .await
                .is_err()
        );
        // previous state untouched
        let results = mgr.get_results().await.unwrap();
        assert!(results.contains_key("a"));
    }

    #[tokio::test]
    async fn retention_keeps_results_within_grace() {
        let clock: Arc<SteppingClock> = SteppingClock::new();
        let shared: SharedClock = Arc::clone(&clock) as SharedClock;
        let mgr = ProbeManager::with_retention(EchoProber::new(), shared, Some(PING_RESULT_GRACE));
        mgr.update_config(vec!["a".to_string()], "").await.unwrap();
        mgr.run_once().await;

        // Just inside the window: still readable, twice.
        clock.advance(Duration::from_secs(4 * 60 + 59));
        assert!(mgr.get_results().await.is_some());
        assert!(mgr.get_results().await.is_some());

        // Past the window: cleared on read.
        clock.advance(Duration::from_secs(2));
        assert!(mgr.get_results().await.is_none());
        assert!(mgr.get_results().await.is_none());
    }

    #[tokio::test]
    async fn scheduled_job_produces_results() {
        let mgr = ProbeManager::new(EchoProber::new(), fast_forward_clock());
        mgr.update_config(vec!["a".to_string()], "30s").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mgr.get_results().await.is_some());
        mgr.stop().await;
    }
}
