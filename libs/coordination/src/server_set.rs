//! Service discovery registrations.
//!
//! A server set is a group whose members publish a JSON `ServiceInstance`
//! describing where a process can be reached.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};
use crate::group::{Group, Membership};
use crate::CoordinationClient;

/// Host and port of an advertised endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Advertised health of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Dead,
    Starting,
    Alive,
    Stopping,
    Stopped,
    Warning,
}

/// Discovery record published by a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_endpoint: Endpoint,
    #[serde(default)]
    pub additional_endpoints: HashMap<String, Endpoint>,
    pub status: Status,
}

/// A discovery namespace.
pub struct ServerSet {
    group: Group,
}

impl ServerSet {
    pub fn new(client: Arc<dyn CoordinationClient>, path: impl Into<String>) -> Self {
        Self {
            group: Group::new(client, path),
        }
    }

    pub fn path(&self) -> &str {
        self.group.path()
    }

    /// Advertise `endpoint` until the returned status is dropped with the session
    /// or explicitly left.
    pub async fn join(
        &self,
        endpoint: SocketAddr,
        additional_endpoints: HashMap<String, SocketAddr>,
        status: Status,
    ) -> Result<EndpointStatus> {
        let instance = ServiceInstance {
            service_endpoint: endpoint.into(),
            additional_endpoints: additional_endpoints
                .into_iter()
                .map(|(name, addr)| (name, addr.into()))
                .collect(),
            status,
        };
        let data = serde_json::to_vec(&instance)
            .map_err(|e| CoordinationError::Codec(format!("service instance: {e}")))?;

        let membership = self.group.join(&data).await?;
        Ok(EndpointStatus {
            membership,
            instance,
        })
    }

    /// Decode every member's published instance.
    pub async fn instances(&self) -> Result<Vec<ServiceInstance>> {
        let mut instances = Vec::new();
        for member in self.group.member_ids().await? {
            let data = self.group.member_data(&member).await?;
            let instance = serde_json::from_slice(&data)
                .map_err(|e| CoordinationError::Codec(format!("{member}: {e}")))?;
            instances.push(instance);
        }
        Ok(instances)
    }
}

/// A live discovery registration.
pub struct EndpointStatus {
    membership: Membership,
    instance: ServiceInstance,
}

impl EndpointStatus {
    pub fn member_path(&self) -> &str {
        self.membership.member_path()
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// Withdraw the registration.
    pub async fn leave(self) -> Result<()> {
        self.membership.cancel().await
    }
}
