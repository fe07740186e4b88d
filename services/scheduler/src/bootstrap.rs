//! Scheduler startup sequence.
//!
//! Steps run strictly in order:
//!
//! 1. Build the coordination capability
//! 2. Register in the discovery registry (failure is logged, not fatal)
//! 3. Select the persistence backend
//! 4. Resolve the cluster master (failure is fatal)
//! 5. Open the store and bind everything into a [`DriverHandle`]
//!
//! A persistence misconfiguration found in step 3 is reported only after
//! step 4, so an unresolvable master always takes precedence.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::coordination::Coordination;
use crate::driver::{DriverHandle, Scheduler};
use crate::error::BootstrapError;
use crate::{master, persistence, registrar};

/// Bootstrap the scheduler from configuration.
pub async fn bootstrap(
    config: &Config,
    scheduler: Arc<dyn Scheduler>,
) -> Result<DriverHandle, BootstrapError> {
    let coordination = Coordination::from_config(config);
    bootstrap_with(config, coordination, scheduler).await
}

/// Bootstrap with an already constructed coordination capability.
pub async fn bootstrap_with(
    config: &Config,
    coordination: Coordination,
    scheduler: Arc<dyn Scheduler>,
) -> Result<DriverHandle, BootstrapError> {
    info!(
        scheduler = scheduler.name(),
        coordination = coordination.is_enabled(),
        "Bootstrapping scheduler"
    );

    let registration = match registrar::register(config, &coordination).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!(
                namespace = %config.scheduler_namespace,
                error = %e,
                "Failed to register scheduler in discovery registry, continuing unregistered"
            );
            None
        }
    };

    let selection = persistence::select(config);
    match &selection {
        Ok(backend) => info!(backend = %backend, "Persistence backend selected"),
        Err(e) => warn!(error = %e, "No usable persistence backend"),
    }

    let resolution = master::resolve(config, &coordination)
        .await
        .map_err(BootstrapError::master_unresolved)?;

    let backend = selection?;
    let store = backend.open(&coordination)?;

    info!(
        master = %resolution.master,
        backend = %backend,
        registered = registration.is_some(),
        "Scheduler bootstrap complete"
    );

    Ok(DriverHandle::new(
        scheduler,
        resolution.master,
        backend,
        store,
        coordination,
        registration,
        resolution.leader_watch,
    ))
}
