//! # Edge Agent
//!
//! Entry point: load settings, start the supervision tree, run until SIGINT, SIGTERM
//! or SIGQUIT, then stop every service.
//!
//! ```bash
//! EDGE_AGENT__CONFIG_DIR=./conf RUST_LOG=edge_agent=debug edge-agent
//! ```

use agent_framework::tracing::setup_tracing_with_default;
use anyhow::Context;
use edge_agent::{AgentSettings, EdgeSystem};
use tracing::{info, info_span, Instrument};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing_with_default("info");

    let settings = AgentSettings::load().context("loading agent settings")?;
    info!(config_dir = %settings.config_dir.display(), "Starting edge agent");

    let system = EdgeSystem::start(settings).context("assembling services")?;
    for line in system.details() {
        info!("{line}");
    }

    wait_for_shutdown_signal()
        .await
        .context("installing signal handlers")?;
    info!("Shutdown signal received");

    system
        .shutdown()
        .instrument(info_span!("shutdown"))
        .await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
