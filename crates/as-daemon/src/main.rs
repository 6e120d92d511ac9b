//! as-daemon: health sweeps, completion rollup and worker top-up on the
//! polling interval.

use anyhow::{Context, Result};
use as_core::config::Config;
use as_daemon::daemon::Daemon;
use tracing::{info, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    as_telemetry::logging::init(
        "as-daemon",
        &config.general.log_level,
        config.general.log_json,
    );
    let span = as_telemetry::logging::process_span("as-daemon", None);

    async move {
        info!(version = env!("CARGO_PKG_VERSION"), "as-daemon starting");
        let daemon = Daemon::new(config).await?;
        tokio::spawn(daemon.shutdown_handle().listen_for_ctrl_c());

        daemon.run().await;
        info!("as-daemon stopped");
        Ok::<_, anyhow::Error>(())
    }
    .instrument(span)
    .await
}
