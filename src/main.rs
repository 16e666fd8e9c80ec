//! lightspeed hub entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use lightspeed::config::HubSettings;
use lightspeed::hub::Hub;
use lightspeed::hub::alerts::{LogNotifier, SharedNotifier};
use lightspeed::storage::SharedRepository;
use lightspeed::storage::sqlite::SqliteRepository;
use lightspeed::time_provider::system_clock;

#[tokio::main]
async fn main() -> Result<()> {
    lightspeed::observability::init("lightspeed=info");

    let settings = HubSettings::resolve().context("hub configuration")?;
    info!(
        listen = %settings.listen,
        database = %settings.database,
        retention_days = settings.retention_days,
        "starting lightspeed hub"
    );

    let repo: SharedRepository = Arc::new(
        SqliteRepository::open(&settings.database)
            .await
            .context("opening the database")?,
    );
    let notifier: SharedNotifier = Arc::new(LogNotifier);

    let listen = settings.listen.clone();
    let hub = Hub::new(settings, repo, notifier, system_clock());
    let router = hub.start().await.context("hub startup")?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(addr = %listener.local_addr()?, "hub listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.stop();
    info!("hub shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(_) => {
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}
