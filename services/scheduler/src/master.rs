//! Locating the elected cluster master.
//!
//! Resolution happens once per bootstrap:
//!
//! 1. A configured master address is used verbatim, without touching the
//!    coordination service.
//! 2. Otherwise the master election group is read, a leader-change listener
//!    is registered, and the current leader's published address is returned.
//!
//! Leader changes after resolution are only logged; the scheduler stays
//! attached to the master it resolved at startup.

use std::fmt;
use std::sync::Arc;

use nexus_coordination::{Candidate, CoordinationClient, CoordinationError, Group, LeaderWatch};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::coordination::Coordination;
use crate::error::UnresolvedCause;

/// Where the master address came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterSource {
    /// Static configuration.
    Override,
    /// Leader of the election group at `namespace`.
    Election { namespace: String },
}

/// The resolved master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterHandle {
    address: String,
    source: MasterSource,
}

impl MasterHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn source(&self) -> &MasterSource {
        &self.source
    }
}

impl fmt::Display for MasterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Outcome of master resolution.
pub struct Resolution {
    pub master: MasterHandle,
    /// Leader-change notifications; present only for elected masters.
    pub leader_watch: Option<LeaderWatch>,
}

/// Resolve the master address.
pub async fn resolve(
    config: &Config,
    coordination: &Coordination,
) -> Result<Resolution, UnresolvedCause> {
    if let Some(address) = &config.master_address {
        info!(master = %address, "Using configured nexus master");
        return Ok(Resolution {
            master: MasterHandle {
                address: address.clone(),
                source: MasterSource::Override,
            },
            leader_watch: None,
        });
    }

    let Some(client) = coordination.client() else {
        let cause = UnresolvedCause::CoordinationDisabled;
        error!(reason = cause.reason_code(), "{cause}");
        return Err(cause);
    };

    info!(namespace = %config.master_namespace, "Fetching elected nexus master");
    match resolve_elected(&config.master_namespace, Arc::clone(client)).await {
        Ok(resolution) => {
            info!(master = %resolution.master, "Elected master id");
            Ok(resolution)
        }
        Err(cause) => {
            error!(
                namespace = %config.master_namespace,
                reason = cause.reason_code(),
                error = %cause,
                "Failed to resolve elected nexus master"
            );
            Err(cause)
        }
    }
}

async fn resolve_elected(
    namespace: &str,
    client: Arc<dyn CoordinationClient>,
) -> Result<Resolution, UnresolvedCause> {
    let session_timeout = client.session_timeout();
    let group = Group::new(client, namespace).accept_all();

    let members = group.member_ids().await?;
    debug!(namespace, members = members.len(), "Read master group membership");

    let candidate = Candidate::new(group);
    let watched_namespace = namespace.to_string();
    let leader_watch = candidate
        .watch_leader(move |leader| {
            info!(
                namespace = %watched_namespace,
                leader = leader.as_deref().unwrap_or("<none>"),
                "Received notification of nexus master group change"
            );
        })
        .await?;

    let leader = timeout(session_timeout, candidate.leader_id())
        .await
        .map_err(|_| CoordinationError::Timeout(session_timeout))??;

    let address = match leader {
        Some(address) if !address.trim().is_empty() => address,
        Some(_) => {
            return Err(UnresolvedCause::EmptyLeader {
                namespace: namespace.to_string(),
            })
        }
        None => {
            return Err(UnresolvedCause::NoLeader {
                namespace: namespace.to_string(),
            })
        }
    };

    Ok(Resolution {
        master: MasterHandle {
            address,
            source: MasterSource::Election {
                namespace: namespace.to_string(),
            },
        },
        leader_watch: Some(leader_watch),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ENDPOINTS_VAR, MASTER_ADDRESS_VAR};
    use nexus_coordination::{CreateMode, InMemoryCoordination};
    use rstest::rstest;

    fn config(master_address: Option<&str>) -> Config {
        let master_address = master_address.map(str::to_string);
        Config::from_vars(|var| match var {
            MASTER_ADDRESS_VAR => master_address.clone(),
            ENDPOINTS_VAR => Some("zk1:2181".to_string()),
            _ => None,
        })
        .unwrap()
    }

    async fn election(members: &[&str]) -> Arc<InMemoryCoordination> {
        let zk = Arc::new(InMemoryCoordination::new());
        let group = Group::new(zk.clone(), "/nexus/master");
        for member in members {
            group.join(member.as_bytes()).await.unwrap();
        }
        zk
    }

    #[rstest]
    #[case::enabled(true)]
    #[case::disabled(false)]
    #[tokio::test]
    async fn test_override_never_touches_coordination(#[case] enabled: bool) {
        let zk = Arc::new(InMemoryCoordination::new());
        let coordination = if enabled {
            Coordination::Enabled(zk.clone())
        } else {
            Coordination::Disabled
        };

        let resolution = resolve(&config(Some("10.0.0.5:5050")), &coordination)
            .await
            .unwrap();
        assert_eq!(resolution.master.address(), "10.0.0.5:5050");
        assert_eq!(resolution.master.source(), &MasterSource::Override);
        assert!(resolution.leader_watch.is_none());
        assert_eq!(zk.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_override_and_no_coordination() {
        let cause = resolve(&config(None), &Coordination::Disabled)
            .await
            .err()
            .unwrap();
        assert!(matches!(cause, UnresolvedCause::CoordinationDisabled));
    }

    #[tokio::test]
    async fn test_elected_leader_resolved() {
        let zk = election(&["10.0.0.9:5050", "10.0.0.10:5050"]).await;

        let resolution = resolve(&config(None), &Coordination::Enabled(zk))
            .await
            .unwrap();
        assert_eq!(resolution.master.address(), "10.0.0.9:5050");
        assert_eq!(
            resolution.master.source(),
            &MasterSource::Election {
                namespace: "/nexus/master".to_string()
            }
        );
        assert!(resolution.leader_watch.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_foreign_member_names_are_considered() {
        let zk = Arc::new(InMemoryCoordination::new());
        nexus_coordination::ensure_path(zk.as_ref(), "/nexus/master")
            .await
            .unwrap();
        zk.create(
            "/nexus/master/0000000004",
            b"10.0.0.4:5050",
            CreateMode::Ephemeral,
        )
        .await
        .unwrap();

        let resolution = resolve(&config(None), &Coordination::Enabled(zk))
            .await
            .unwrap();
        assert_eq!(resolution.master.address(), "10.0.0.4:5050");
    }

    #[tokio::test]
    async fn test_empty_group_is_unresolved() {
        let zk = election(&[]).await;
        let cause = resolve(&config(None), &Coordination::Enabled(zk))
            .await
            .err()
            .unwrap();
        assert!(matches!(cause, UnresolvedCause::NoLeader { .. }));
    }

    #[tokio::test]
    async fn test_empty_leader_data_is_unresolved() {
        let zk = election(&[""]).await;
        let cause = resolve(&config(None), &Coordination::Enabled(zk))
            .await
            .err()
            .unwrap();
        assert_eq!(cause.reason_code(), "empty_leader");
    }

    #[tokio::test]
    async fn test_missing_group_is_protocol_failure() {
        let zk = Arc::new(InMemoryCoordination::new());
        let cause = resolve(&config(None), &Coordination::Enabled(zk))
            .await
            .err()
            .unwrap();
        assert_eq!(cause.reason_code(), "coordination_protocol");
    }

    #[tokio::test]
    async fn test_connection_failure_is_unresolved() {
        let zk = Arc::new(InMemoryCoordination::unreachable());
        let cause = resolve(&config(None), &Coordination::Enabled(zk))
            .await
            .err()
            .unwrap();
        assert_eq!(cause.reason_code(), "coordination_connection");
    }
}
