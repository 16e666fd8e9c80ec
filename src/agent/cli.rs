//! Agent command-line interface

use clap::{Parser, Subcommand};

/// Network-health monitoring agent
#[derive(Debug, Parser)]
#[command(name = "lightspeed-agent", version, about, disable_version_flag = true)]
pub struct Cli {
    /// Agent-hub shared key (base64); falls back to KEY / KEY_FILE env
    #[arg(short = 'k', long = "key", value_name = "base64")]
    pub key: Option<String>,

    /// Print the agent version
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Agent subcommands; the service runs when none is given
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the monitoring service (default)
    Agent,
    /// Print the agent version
    Version,
    /// Check GitHub releases for a newer agent
    Update,
    /// Exit 0 when the running agent's heartbeat is fresh
    Health,
}

/// The `version` output line
pub fn version_line() -> String {
    format!("lightspeed-agent {}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_service_command() {
        let cli = Cli::parse_from(["lightspeed-agent"]);
        assert!(cli.command.is_none());
        assert!(!cli.version);
    }

    #[test]
    fn key_flag_is_accepted() {
        let cli = Cli::parse_from(["lightspeed-agent", "--key", "abc123"]);
        assert_eq!(cli.key.as_deref(), Some("abc123"));
    }

    #[test]
    fn short_v_prints_version() {
        let cli = Cli::parse_from(["lightspeed-agent", "-v"]);
        assert!(cli.version);
    }

    #[test]
    fn version_line_names_the_agent() {
        let line = version_line();
        assert!(line.starts_with("lightspeed-agent "));
        assert!(line.contains(env!("CARGO_PKG_VERSION")));
    }
}
