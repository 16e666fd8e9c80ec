//! Injected time source
//!
//! Long-lived actors (updaters, tickers, reconnect loops) take a
//! [`TimeProvider`] instead of calling the clock directly, so tests drive
//! them without real sleeps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep as tokio_sleep;

/// Clock and sleep abstraction for time-dependent actors
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Suspends the caller for the given duration
    async fn sleep(&self, duration: Duration);

    /// Current wall-clock time
    #[must_use]
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant for elapsed-time measurements
    #[must_use]
    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Production clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl TimeProvider for SystemClock {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that compresses every sleep to at most one millisecond,
/// keeping yield points without the wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastForwardClock;

#[async_trait]
impl TimeProvider for FastForwardClock {
    async fn sleep(&self, duration: Duration) {
        if duration > Duration::from_millis(1) {
            tokio_sleep(Duration::from_millis(1)).await;
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle passed into actors
pub type SharedClock = Arc<dyn TimeProvider>;

/// The production clock as a shared handle
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// The compressed test clock as a shared handle
#[must_use]
pub fn fast_forward_clock() -> SharedClock {
    Arc::new(FastForwardClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_forward_clock_compresses_sleeps() {
        let clock = FastForwardClock;
        let start = Instant::now();
        clock.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
