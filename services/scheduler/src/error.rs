//! Error types for scheduler bootstrap.

use nexus_coordination::{CoordinationError, ErrorKind};
use thiserror::Error;

use crate::config::ConfigError;
use crate::persistence::PersistenceError;

/// Why the cluster master could not be located.
#[derive(Debug, Error)]
pub enum UnresolvedCause {
    /// No static override and no coordination client to ask.
    #[error("no master address configured and coordination is disabled")]
    CoordinationDisabled,

    /// The election group has no members.
    #[error("no elected master in {namespace}")]
    NoLeader { namespace: String },

    /// The leader published an empty identity.
    #[error("elected master in {namespace} published an empty address")]
    EmptyLeader { namespace: String },

    /// The coordination service failed while reading the election.
    #[error("{}: {source}", describe(.source))]
    Coordination {
        #[source]
        source: CoordinationError,
    },
}

fn describe(source: &CoordinationError) -> &'static str {
    match (source, source.kind()) {
        (CoordinationError::Watch { .. }, _) => "failed to watch master group for leader changes",
        (_, ErrorKind::Connection) => "failed to connect to coordination service",
        (_, ErrorKind::Protocol) => "failed while reading from coordination service",
        (_, ErrorKind::Interrupted) => "interrupted while reading from coordination service",
    }
}

impl From<CoordinationError> for UnresolvedCause {
    fn from(source: CoordinationError) -> Self {
        Self::Coordination { source }
    }
}

impl UnresolvedCause {
    /// Get the standardized reason code for this cause.
    pub fn reason_code(&self) -> &'static str {
        match self {
            UnresolvedCause::CoordinationDisabled => "coordination_disabled",
            UnresolvedCause::NoLeader { .. } => "no_leader",
            UnresolvedCause::EmptyLeader { .. } => "empty_leader",
            UnresolvedCause::Coordination { source } => match source {
                CoordinationError::Watch { .. } => "watch_failed",
                _ => match source.kind() {
                    ErrorKind::Connection => "coordination_connection",
                    ErrorKind::Protocol => "coordination_protocol",
                    ErrorKind::Interrupted => "interrupted",
                },
            },
        }
    }
}

/// Fatal bootstrap failures. The process must not start scheduling.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The cluster master could not be located.
    #[error("unable to continue without nexus master: {cause}")]
    MasterUnresolved {
        #[source]
        cause: UnresolvedCause,
    },

    /// The selected persistence backend could not be opened.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl BootstrapError {
    pub fn master_unresolved(cause: impl Into<UnresolvedCause>) -> Self {
        Self::MasterUnresolved {
            cause: cause.into(),
        }
    }

    pub fn is_master_unresolved(&self) -> bool {
        matches!(self, BootstrapError::MasterUnresolved { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, BootstrapError::Configuration(_))
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BootstrapError::Configuration(e) => e.reason_code(),
            BootstrapError::MasterUnresolved { .. } => "master_unresolved",
            BootstrapError::Persistence(_) => "persistence_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_coordination::ErrorCode;

    #[test]
    fn test_cause_messages_follow_error_kind() {
        let cause = UnresolvedCause::from(CoordinationError::ConnectionLoss);
        assert_eq!(cause.reason_code(), "coordination_connection");
        assert!(cause.to_string().starts_with("failed to connect"));

        let cause = UnresolvedCause::from(CoordinationError::server(ErrorCode::NoNode, "/m"));
        assert_eq!(cause.reason_code(), "coordination_protocol");
        assert!(cause.to_string().starts_with("failed while reading"));

        let cause = UnresolvedCause::from(CoordinationError::watch(
            "/m",
            CoordinationError::ConnectionLoss,
        ));
        assert_eq!(cause.reason_code(), "watch_failed");

        let cause = UnresolvedCause::from(CoordinationError::Interrupted);
        assert_eq!(cause.reason_code(), "interrupted");
    }

    #[test]
    fn test_master_unresolved_keeps_cause() {
        let err = BootstrapError::master_unresolved(UnresolvedCause::CoordinationDisabled);
        assert!(err.is_master_unresolved());
        assert_eq!(err.reason_code(), "master_unresolved");

        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(
            source.to_string(),
            "no master address configured and coordination is disabled"
        );
    }
}
