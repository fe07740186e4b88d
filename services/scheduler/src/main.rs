//! nexus Scheduler
//!
//! Resolves the cluster master, selects the persistence backend, registers
//! in service discovery and runs the scheduling engine until shutdown.

use std::sync::Arc;

use anyhow::Result;
use nexus_scheduler::{bootstrap, Config, StandbyScheduler};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first so NEXUS_LOG_LEVEL can seed the filter
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting nexus scheduler");
    info!(
        coordination_endpoints = ?config.coordination_endpoints,
        master_namespace = %config.master_namespace,
        master_override = config.master_address.is_some(),
        advertise_addr = %config.advertise_addr,
        "Configuration loaded"
    );

    let driver = match bootstrap(&config, Arc::new(StandbyScheduler::new())).await {
        Ok(driver) => driver,
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "Scheduler bootstrap failed");
            return Err(e.into());
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut driver_handle = tokio::spawn(driver.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            match (&mut driver_handle).await {
                Ok(Ok(())) => info!("Driver exited normally"),
                Ok(Err(e)) => error!(error = %e, "Driver error"),
                Err(e) => error!(error = %e, "Driver task panicked"),
            }
        }
        result = &mut driver_handle => {
            match result {
                Ok(Ok(())) => info!("Driver exited normally"),
                Ok(Err(e)) => {
                    error!(error = %e, "Driver error");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Driver task panicked"),
            }
        }
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
