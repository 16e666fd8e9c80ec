//! lightspeed agent entry point

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use lightspeed::agent::cli::{Cli, Command, version_line};
use lightspeed::agent::connection::ConnectionManager;
use lightspeed::agent::update::{UpdateCheck, check_latest};
use lightspeed::agent::{Agent, health};
use lightspeed::config::AgentSettings;
use lightspeed::time_provider::system_clock;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", version_line());
        return Ok(());
    }

    match cli.command {
        Some(Command::Version) => {
            println!("{}", version_line());
            Ok(())
        }
        Some(Command::Health) => health_command(),
        Some(Command::Update) => update_command().await,
        Some(Command::Agent) | None => run_service(cli.key).await,
    }
}

/// Exits non-zero when the running agent's heartbeat is stale.
fn health_command() -> Result<()> {
    let path = lightspeed::config::agent_env("HEALTH_FILE")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(health::default_health_file);
    if health::is_fresh(&path) {
        println!("ok");
        Ok(())
    } else {
        bail!("health file stale or missing: {}", path.display());
    }
}

async fn update_command() -> Result<()> {
    match check_latest().await.context("release check")? {
        UpdateCheck::UpToDate { current } => {
            println!("lightspeed-agent {current} is up to date");
        }
        UpdateCheck::Available { current, latest } => {
            println!("update available: {current} -> {latest}");
            println!("fetch it from https://github.com/svenvg93/lightspeed/releases");
        }
    }
    Ok(())
}

async fn run_service(flag_key: Option<String>) -> Result<()> {
    lightspeed::observability::init("lightspeed=info");

    let settings = AgentSettings::resolve(flag_key).context("agent configuration")?;
    info!(hub = %settings.hub_url, "starting lightspeed agent");

    let clock = system_clock();
    let agent = Arc::new(
        Agent::new(settings.info_refresh, Arc::clone(&clock))
            .await
            .context("agent init")?,
    );
    agent.start().await;

    health::beat(&settings.health_file).context("writing the health file")?;

    let manager = ConnectionManager::new(settings, agent, clock);
    manager.run().await.context("connection manager")?;

    info!("agent shut down");
    Ok(())
}
