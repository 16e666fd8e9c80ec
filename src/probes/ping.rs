//! ICMP ping probing through fping
//!
//! fping runs once per target with `-c <count> -t <per-packet ms> -q` and
//! prints its summary on stderr. Both summary shapes occur: with replies the
//! line carries loss and min/avg/max, on total loss the RTT section is
//! absent. A line without the loss section is unparseable and the target is
//! dropped from the batch rather than recorded as a failure.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::{PingKey, PingResult, PingTarget};
use crate::time_provider::SharedClock;

use super::Prober;

/// The external binary this prober shells out to
pub const FPING_BIN: &str = "fping";

/// Runs fping per target, concurrently across the batch
pub struct PingProber {
    clock: SharedClock,
}

impl PingProber {
    /// Creates the prober
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    async fn probe_one(clock: SharedClock, target: PingTarget) -> Option<PingResult> {
        let target = target.normalized();
        let timeout_ms = target.timeout.as_millis().to_string();
        let count = target.count.to_string();

        let output = tokio::process::Command::new(FPING_BIN)
            .args(["-c", &count, "-t", &timeout_ms, "-q", &target.host])
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(host = %target.host, error = %e, "fping failed to start");
                return None;
            }
        };

        // fping -q writes the per-host summary to stderr; a nonzero exit
        // just means packets were lost.
        let summary = String::from_utf8_lossy(&output.stderr);
        let parsed = summary.lines().find_map(parse_summary_line);
        let Some((loss, rtt)) = parsed else {
            debug!(host = %target.host, "fping summary missing, dropping result");
            return None;
        };

        let (min_rtt, avg_rtt, max_rtt) = rtt.unwrap_or((0.0, 0.0, 0.0));
        Some(PingResult {
            packet_loss: loss,
            min_rtt,
            avg_rtt,
            max_rtt,
            last_checked: clock.now(),
        })
    }
}

#[async_trait]
impl Prober for PingProber {
    type Target = PingTarget;
    type Key = PingKey;
    type Output = PingResult;

    fn class(&self) -> &'static str {
        "ping"
    }

    fn key(target: &Self::Target) -> Self::Key {
        target.key()
    }

    async fn probe_all(&self, targets: &[Self::Target]) -> Vec<(Self::Key, Self::Output)> {
        let mut set = JoinSet::new();
        for target in targets.iter().cloned() {
            let clock = std::sync::Arc::clone(&self.clock);
            let key = target.key();
            set.spawn(async move {
                Self::probe_one(clock, target).await.map(|r| (key, r))
            });
        }

        let mut out = Vec::with_capacity(targets.len());
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(pair)) = joined {
                out.push(pair);
            }
        }
        out
    }
}

/// Parses one fping `-q` summary line.
///
/// `8.8.8.8 : xmt/rcv/%loss = 3/3/0%, min/avg/max = 9.1/9.5/9.9`
/// `10.0.0.1 : xmt/rcv/%loss = 3/0/100%`
///
/// Returns the loss percentage and, when present, (min, avg, max).
fn parse_summary_line(line: &str) -> Option<(f64, Option<(f64, f64, f64)>)> {
    let (_, after_loss) = line.split_once("xmt/rcv/%loss = ")?;
    let loss_part = after_loss.split(',').next()?.trim();
    let loss_str = loss_part.split('/').nth(2)?.trim_end_matches('%');
    let loss: f64 = loss_str.parse().ok()?;

    let rtt = after_loss.split_once("min/avg/max = ").and_then(|(_, rest)| {
        let mut it = rest.trim().split('/');
        let min: f64 = it.next()?.parse().ok()?;
        let avg: f64 = it.next()?.parse().ok()?;
        let max: f64 = it.next()?.parse().ok()?;
        Some((min, avg, max))
    });

    Some((loss, rtt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_summary_parses_loss_and_rtt() {
        let line = "8.8.8.8 : xmt/rcv/%loss = 3/3/0%, min/avg/max = 9.1/9.5/9.9";
        let (loss, rtt) = parse_summary_line(line).unwrap();
        assert_eq!(loss, 0.0);
        assert_eq!(rtt, Some((9.1, 9.5, 9.9)));
    }

    #[test]
    fn total_loss_summary_has_no_rtt_section() {
        let line = "10.0.0.1 : xmt/rcv/%loss = 3/0/100%";
        let (loss, rtt) = parse_summary_line(line).unwrap();
        assert_eq!(loss, 100.0);
        assert_eq!(rtt, None);
    }

    #[test]
    fn partial_loss_parses() {
        let line = "1.1.1.1 : xmt/rcv/%loss = 3/2/33%, min/avg/max = 10.0/11.0/12.0";
        let (loss, rtt) = parse_summary_line(line).unwrap();
        assert_eq!(loss, 33.0);
        assert_eq!(rtt.unwrap().1, 11.0);
    }

    #[test]
    fn unrelated_lines_are_dropped() {
        assert!(parse_summary_line("ICMP Host Unreachable from 10.0.0.2").is_none());
        assert!(parse_summary_line("").is_none());
    }
}
