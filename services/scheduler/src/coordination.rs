//! Coordination capability for the scheduler.
//!
//! Coordination is optional: with no endpoints configured the scheduler runs
//! with an explicit `Disabled` capability, and every consumer must check for
//! a client before using one.

use std::sync::Arc;

use nexus_coordination::{CoordinationClient, ZkClient};
use tracing::info;

use crate::config::Config;

/// Whether a coordination service is available.
#[derive(Clone)]
pub enum Coordination {
    /// No endpoints configured; coordination features are off.
    Disabled,
    /// A shared client. Never mutated after construction.
    Enabled(Arc<dyn CoordinationClient>),
}

impl Coordination {
    /// Build the coordination capability from configuration.
    ///
    /// The client is constructed eagerly but does not dial out; connection
    /// errors surface on its first operation.
    pub fn from_config(config: &Config) -> Self {
        if config.coordination_endpoints.is_empty() {
            info!("Coordination endpoints not specified, coordination disabled");
            return Self::Disabled;
        }

        info!(
            endpoints = ?config.coordination_endpoints,
            session_timeout_secs = config.session_timeout.as_secs(),
            "Coordination client created"
        );
        Self::Enabled(Arc::new(ZkClient::new(
            config.coordination_endpoints.clone(),
            config.session_timeout,
        )))
    }

    /// The client, if coordination is enabled.
    pub fn client(&self) -> Option<&Arc<dyn CoordinationClient>> {
        match self {
            Self::Disabled => None,
            Self::Enabled(client) => Some(client),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }
}

impl std::fmt::Debug for Coordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled(_) => f.write_str("Enabled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_endpoints_disables_coordination() {
        let config = Config::from_vars(|_| None).unwrap();
        let coordination = Coordination::from_config(&config);
        assert!(!coordination.is_enabled());
        assert!(coordination.client().is_none());
    }

    #[tokio::test]
    async fn test_endpoints_enable_coordination_without_dialing() {
        let mut config = Config::from_vars(|_| None).unwrap();
        // Unroutable on purpose: construction must not connect.
        config.coordination_endpoints = vec!["192.0.2.1:2181".to_string()];

        let coordination = Coordination::from_config(&config);
        assert!(coordination.is_enabled());
        assert_eq!(
            coordination.client().unwrap().session_timeout(),
            config.session_timeout
        );
    }
}
