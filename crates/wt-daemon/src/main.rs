//! watchtower daemon: runs the scheduler, health and retention loops and
//! serves the management API.

use anyhow::{Context, Result};
use tracing::info;
use wt_core::config::Config;
use wt_daemon::daemon::Daemon;
use wt_daemon::signals;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    wt_telemetry::logging::init_logging_for(
        "watchtower-daemon",
        &config.general.log_level,
        config.general.json_logs(),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "watchtower daemon starting"
    );

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        signals::termination().await;
        shutdown.trigger();
    });

    daemon.run().await
}
