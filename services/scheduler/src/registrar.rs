//! Service discovery registration for the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use nexus_coordination::{CoordinationError, EndpointStatus, ServerSet, Status};
use tracing::info;

use crate::config::Config;
use crate::coordination::Coordination;

/// This scheduler's entry in the discovery registry.
///
/// The entry is ephemeral: it disappears with the coordination session and
/// is not re-created if the session is lost.
pub struct Registration {
    status: EndpointStatus,
}

impl Registration {
    pub fn member_path(&self) -> &str {
        self.status.member_path()
    }

    /// Remove the entry.
    pub async fn withdraw(self) -> Result<(), CoordinationError> {
        self.status.leave().await
    }
}

/// Advertise this scheduler under the configured namespace.
///
/// Returns `Ok(None)` without side effects when coordination is disabled.
pub async fn register(
    config: &Config,
    coordination: &Coordination,
) -> Result<Option<Registration>, CoordinationError> {
    let Some(client) = coordination.client() else {
        info!("No coordination client, service registration disabled");
        return Ok(None);
    };

    let server_set = ServerSet::new(Arc::clone(client), config.scheduler_namespace.clone());
    let status = server_set
        .join(config.advertise_addr, HashMap::new(), Status::Alive)
        .await?;

    info!(
        namespace = %config.scheduler_namespace,
        member = %status.member_path(),
        advertise_addr = %config.advertise_addr,
        "Registered scheduler in discovery registry"
    );
    Ok(Some(Registration { status }))
}
