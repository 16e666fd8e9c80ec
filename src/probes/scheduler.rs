//! Probe job scheduling
//!
//! Intervals arrive from the hub as either a 5-field cron expression
//! (minute, hour, day-of-month, month, day-of-week) or a plain duration
//! string. An empty interval disables the job. The job loop sleeps through
//! the injected clock so tests can compress it.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::time_provider::SharedClock;

/// Interval string rejected by both parsers
#[derive(Debug, Clone, Error)]
#[error("invalid schedule {expr:?}: {reason}")]
pub struct ScheduleError {
    /// Submitted interval
    pub expr: String,
    /// Parser diagnostic
    pub reason: String,
}

/// Parsed probe interval
#[derive(Debug, Clone)]
pub enum JobSpec {
    /// Fire on cron matches
    Cron(Box<Schedule>),
    /// Fire on a fixed period
    Every(Duration),
}

/// Parses a 5-field cron expression.
///
/// The underlying parser wants a seconds field, so a zero-seconds column is
/// prepended; callers only ever see minute-level resolution.
///
/// # Errors
///
/// Returns [`ScheduleError`] when the expression does not have five fields
/// or any field fails to parse.
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ScheduleError {
            expr: expr.to_string(),
            reason: format!("expected 5 fields, got {}", fields.len()),
        });
    }
    let with_seconds = format!("0 {}", fields.join(" "));
    Schedule::from_str(&with_seconds).map_err(|e| ScheduleError {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Parses an interval string into a job spec; `None` disables the job.
///
/// # Errors
///
/// Returns [`ScheduleError`] when the value is neither empty, a duration,
/// nor a 5-field cron expression.
pub fn parse_interval(expr: &str) -> Result<Option<JobSpec>, ScheduleError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(None);
    }
    if let Ok(period) = humantime::parse_duration(expr) {
        return Ok(Some(JobSpec::Every(period)));
    }
    parse_cron(expr).map(|s| Some(JobSpec::Cron(Box::new(s))))
}

impl JobSpec {
    /// Time to wait from `now` until the next fire.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Every(period) => Some(*period),
            Self::Cron(schedule) => {
                let next = schedule.after(&now).next()?;
                (next - now).to_std().ok()
            }
        }
    }
}

/// Runs `tick` on every fire until the token is cancelled.
///
/// Tick panics cannot happen by construction (probe runs catch their own
/// failures); a schedule with no future fire ends the loop with a warning.
pub async fn run_job<F, Fut>(spec: JobSpec, clock: SharedClock, token: CancellationToken, tick: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    loop {
        let Some(delay) = spec.next_delay(clock.now()) else {
            warn!("schedule has no upcoming fire, stopping job");
            return;
        };
        tokio::select! {
            () = token.cancelled() => return,
            () = clock.sleep(delay) => {}
        }
        tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn five_field_expressions_parse() {
        assert!(parse_cron("*/1 * * * *").is_ok());
        assert!(parse_cron("0 6 * * 1-5").is_ok());
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(parse_cron("*/1 * * *").is_err());
        assert!(parse_cron("0 */1 * * * *").is_err());
        assert!(parse_cron("").is_err());
    }

    #[test]
    fn interval_accepts_durations_crons_and_empty() {
        assert!(matches!(parse_interval("90s"), Ok(Some(JobSpec::Every(d))) if d == Duration::from_secs(90)));
        assert!(matches!(parse_interval("*/5 * * * *"), Ok(Some(JobSpec::Cron(_)))));
        assert!(matches!(parse_interval(""), Ok(None)));
        assert!(matches!(parse_interval("  "), Ok(None)));
        assert!(parse_interval("soonish").is_err());
    }

    #[test]
    fn cron_next_delay_is_within_the_minute() {
        let spec = JobSpec::Cron(Box::new(parse_cron("*/1 * * * *").unwrap()));
        let delay = spec.next_delay(Utc::now()).unwrap();
        assert!(delay <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn job_fires_until_cancelled() {
        let clock = crate::time_provider::fast_forward_clock();
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_job = Arc::clone(&fired);
        let job = tokio::spawn(run_job(
            JobSpec::Every(Duration::from_secs(60)),
            clock,
            token.clone(),
            move || {
                let fired = Arc::clone(&fired_in_job);
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        job.await.unwrap();
        assert!(fired.load(Ordering::SeqCst) > 0);
    }
}
