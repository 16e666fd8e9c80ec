//! # lightspeed — distributed network-health monitoring
//!
//! A central **hub** configures and samples a fleet of **agents**, one per
//! monitored host. Agents run scheduled active probes (ICMP ping via fping,
//! DNS over UDP/TCP/DoT/DoH, HTTP GET, Ookla speedtest) and hold results
//! until the hub samples them over a persistent authenticated WebSocket
//! session. The hub persists per-probe stats rows, keeps rolling averages,
//! and evaluates threshold alerts with hysteresis.
//!
//! Module map:
//! - [`domain`] — pure types: monitoring config, probe results, the system
//!   status state machine
//! - [`probes`] — agent-side probe managers and their cron scheduling
//! - [`agent`] — agent core, connection manager, hub session client, CLI
//! - [`wire`] — session frames; JSON control plane, CBOR telemetry
//! - [`hub`] — session registry, per-system updaters, config push,
//!   averages, alerts, HTTP surface
//! - [`storage`] — repository trait with SQLite and in-memory backends

pub mod agent;
pub mod config;
pub mod domain;
pub mod domain_types;
pub mod error;
pub mod hub;
pub mod observability;
pub mod probes;
pub mod storage;
pub mod time_provider;
pub mod wire;

pub use error::LightspeedError;
