//! Crate-level error aggregation
//!
//! Subsystems define their own error enums at their seams; this alias rolls
//! them up for callers that cross several.

use thiserror::Error;

/// Any failure the library surfaces to a binary
#[derive(Debug, Error)]
pub enum LightspeedError {
    /// Startup configuration problem; fatal
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// Persistence failure
    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),
    /// Agent construction failure
    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),
    /// System-manager failure
    #[error(transparent)]
    SystemManager(#[from] crate::hub::system_manager::SystemManagerError),
    /// Session codec failure
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
}
