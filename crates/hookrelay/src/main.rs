mod bootstrap;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use relay_core::settings::Settings;
use relay_runtime::manager::ClientManager;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();
    settings.validate()?;

    bootstrap::setup_logging(&settings.log_level)?;
    bootstrap::ensure_data_dir(&settings.data_dir)?;

    tracing::info!("hookrelay v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        data_dir = %settings.data_dir.display(),
        forwarder = %settings.forwarder_bin.display(),
        auto_restart = settings.auto_restart,
        "configuration loaded"
    );

    let manager = Arc::new(ClientManager::from_settings(&settings)?);

    let resumed = manager.resume_clients();
    let started = resumed.successful;
    match resumed.into_result() {
        Ok(_) => tracing::info!(started, "resumed previously running clients"),
        Err(e) => tracing::warn!(started, error = %e, "some clients could not be resumed"),
    }

    let sweeper = (settings.event_retention_days > 0).then(|| {
        let manager = Arc::clone(&manager);
        let days = settings.event_retention_days;
        let mut ticker = tokio::time::interval(settings.retention_sweep_interval());
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let manager = Arc::clone(&manager);
                match tokio::task::spawn_blocking(move || manager.sweep_retention(days)).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "retention sweep removed expired data"),
                    Err(e) => tracing::warn!(error = %e, "retention sweep task failed"),
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received; stopping forwarders");

    if let Some(handle) = sweeper {
        handle.abort();
    }
    manager.shutdown().await;

    tracing::info!("hookrelay stopped");
    Ok(())
}
