//! Core domain model shared by the hub and the agent
//!
//! Pure types and state machines; no I/O lives here.

pub mod monitoring;
pub mod stats;
pub mod system_status;

pub use monitoring::{
    ClassConfig, ConfigLimits, ConfigValidationError, DnsKey, DnsProtocol, DnsTarget, HttpKey,
    HttpTarget, MonitoringConfig, PingKey, PingTarget, SpeedtestKey, SpeedtestTarget,
    VersionedConfig,
};
pub use stats::{
    CombinedData, CurrentAverages, DnsEntry, DnsResult, HttpEntry, HttpResult, PingEntry,
    PingResult, ProbeStatus, SpeedtestEntry, SpeedtestResult, Stats, SystemInfo, mean2, round2,
};
pub use system_status::{StatusEvent, StatusTransitionError, SystemStatus, TransitionEffects};
