//! System lifecycle state machine
//!
//! A monitored system moves between `pending`, `up`, `down`, and `paused`.
//! Transitions are validated here so the rest of the hub never mutates the
//! status field directly; side effects (alert firing, info clearing) are
//! derived from the transition, not from the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Connection/health status of a monitored system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    /// Created by the operator, never sampled yet
    #[default]
    Pending,
    /// Last sample succeeded
    Up,
    /// Session lost or last sample failed
    Down,
    /// Operator suspended monitoring
    Paused,
}

/// What caused a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A sample round-trip completed successfully
    SampleOk,
    /// A sample failed or the session was lost
    SampleFailed,
    /// Operator paused the system
    OperatorPause,
    /// Operator resumed a paused system
    OperatorResume,
}

/// Rejected status transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status transition: {from} on {event:?}")]
pub struct StatusTransitionError {
    /// State the system was in
    pub from: SystemStatus,
    /// Event that was not applicable
    pub event: StatusEvent,
}

/// Side effects the system manager must perform after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionEffects {
    /// Fire the up/down status alert
    pub fire_status_alert: bool,
    /// Re-evaluate metric alerts (on recovery to `up`)
    pub evaluate_metric_alerts: bool,
    /// Deactivate triggered alerts and clear system info (on pause)
    pub deactivate_alerts: bool,
}

impl SystemStatus {
    /// True while the agent should not be scheduled or sampled
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// True once the system has been sampled at least once successfully
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }

    /// Applies a lifecycle event, returning the next state and its effects.
    ///
    /// # Errors
    ///
    /// Returns [`StatusTransitionError`] when the event is not applicable in
    /// the current state (e.g. a sample result arriving for a paused system).
    pub fn transition(
        self,
        event: StatusEvent,
    ) -> Result<(Self, TransitionEffects), StatusTransitionError> {
        let reject = || StatusTransitionError { from: self, event };

        match (self, event) {
            (Self::Pending, StatusEvent::SampleOk) => Ok((
                Self::Up,
                TransitionEffects {
                    evaluate_metric_alerts: true,
                    ..Default::default()
                },
            )),
            (Self::Pending, StatusEvent::SampleFailed) => {
                Ok((Self::Down, TransitionEffects::default()))
            }
            (Self::Up, StatusEvent::SampleOk) => Ok((Self::Up, TransitionEffects::default())),
            (Self::Up, StatusEvent::SampleFailed) => Ok((
                Self::Down,
                TransitionEffects {
                    fire_status_alert: true,
                    ..Default::default()
                },
            )),
            (Self::Down, StatusEvent::SampleOk) => Ok((
                Self::Up,
                TransitionEffects {
                    fire_status_alert: true,
                    evaluate_metric_alerts: true,
                    ..Default::default()
                },
            )),
            (Self::Down, StatusEvent::SampleFailed) => {
                Ok((Self::Down, TransitionEffects::default()))
            }
            (Self::Pending | Self::Up | Self::Down, StatusEvent::OperatorPause) => Ok((
                Self::Paused,
                TransitionEffects {
                    deactivate_alerts: true,
                    ..Default::default()
                },
            )),
            (Self::Paused, StatusEvent::OperatorResume) => {
                Ok((Self::Pending, TransitionEffects::default()))
            }
            (Self::Paused, StatusEvent::SampleOk | StatusEvent::SampleFailed) => Err(reject()),
            (Self::Paused, StatusEvent::OperatorPause) => Err(reject()),
            (_, StatusEvent::OperatorResume) => Err(reject()),
        }
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Up => "up",
            Self::Down => "down",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

impl SystemStatus {
    /// Parses the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_goes_up_on_first_good_sample() {
        let (next, fx) = SystemStatus::Pending
            .transition(StatusEvent::SampleOk)
            .unwrap();
        assert_eq!(next, SystemStatus::Up);
        assert!(!fx.fire_status_alert);
        assert!(fx.evaluate_metric_alerts);
    }

    #[test]
    fn up_down_crossings_fire_status_alert() {
        let (next, fx) = SystemStatus::Up
            .transition(StatusEvent::SampleFailed)
            .unwrap();
        assert_eq!(next, SystemStatus::Down);
        assert!(fx.fire_status_alert);

        let (next, fx) = next.transition(StatusEvent::SampleOk).unwrap();
        assert_eq!(next, SystemStatus::Up);
        assert!(fx.fire_status_alert);
        assert!(fx.evaluate_metric_alerts);
    }

    #[test]
    fn repeated_failures_do_not_refire() {
        let (next, fx) = SystemStatus::Down
            .transition(StatusEvent::SampleFailed)
            .unwrap();
        assert_eq!(next, SystemStatus::Down);
        assert!(!fx.fire_status_alert);
    }

    #[test]
    fn pause_deactivates_alerts_and_blocks_samples() {
        let (next, fx) = SystemStatus::Up
            .transition(StatusEvent::OperatorPause)
            .unwrap();
        assert_eq!(next, SystemStatus::Paused);
        assert!(fx.deactivate_alerts);

        let err = next.transition(StatusEvent::SampleOk).unwrap_err();
        assert_eq!(err.from, SystemStatus::Paused);
    }

    #[test]
    fn resume_prefers_pending_until_sampled() {
        let (next, _) = SystemStatus::Paused
            .transition(StatusEvent::OperatorResume)
            .unwrap();
        assert_eq!(next, SystemStatus::Pending);
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            SystemStatus::Pending,
            SystemStatus::Up,
            SystemStatus::Down,
            SystemStatus::Paused,
        ] {
            assert_eq!(SystemStatus::parse(&status.to_string()), Some(status));
        }
    }
}
