//! Configuration for the scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors. All of them abort startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// Coordinated persistence needs both a path and a version.
    #[error("coordinated persistence requires both {path_var} and {version_var}")]
    IncompleteCoordinatedPersistence {
        path_var: &'static str,
        version_var: &'static str,
    },

    /// Neither a local nor a coordinated persistence location is set.
    #[error("no persistence location configured: set a local path or a coordinated path")]
    MissingPersistencePath,

    /// Coordinated persistence was selected but coordination is disabled.
    #[error("coordinated persistence at {path} requires coordination endpoints")]
    CoordinatedPersistenceUnavailable { path: String },
}

impl ConfigError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "config_invalid",
            ConfigError::IncompleteCoordinatedPersistence { .. } => "persistence_incomplete",
            ConfigError::MissingPersistencePath => "persistence_missing",
            ConfigError::CoordinatedPersistenceUnavailable { .. } => "persistence_unavailable",
        }
    }
}

/// Location and format version of coordination-backed scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatedStore {
    pub path: String,
    pub version: u32,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordination service endpoints (host:port). Empty disables coordination.
    pub coordination_endpoints: Vec<String>,

    /// Coordination session timeout; also bounds blocking reads.
    pub session_timeout: Duration,

    /// Election group of the cluster masters.
    pub master_namespace: String,

    /// Static master address; bypasses election when set.
    pub master_address: Option<String>,

    /// Discovery namespace this scheduler registers under.
    pub scheduler_namespace: String,

    /// Address advertised in the discovery registry.
    pub advertise_addr: SocketAddr,

    /// Local persistence file, used when no coordinated store is set.
    pub local_persistence_path: Option<PathBuf>,

    /// Coordination-backed persistence.
    pub coordinated_persistence: Option<CoordinatedStore>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

pub const ENDPOINTS_VAR: &str = "NEXUS_COORDINATION_ENDPOINTS";
pub const SESSION_TIMEOUT_VAR: &str = "NEXUS_COORDINATION_SESSION_TIMEOUT_SECS";
pub const MASTER_NAMESPACE_VAR: &str = "NEXUS_MASTER_NAMESPACE";
pub const MASTER_ADDRESS_VAR: &str = "NEXUS_MASTER_ADDRESS";
pub const SCHEDULER_NAMESPACE_VAR: &str = "NEXUS_SCHEDULER_NAMESPACE";
pub const ADVERTISE_ADDR_VAR: &str = "NEXUS_ADVERTISE_ADDR";
pub const LOCAL_PATH_VAR: &str = "NEXUS_PERSISTENCE_LOCAL_PATH";
pub const COORDINATED_PATH_VAR: &str = "NEXUS_PERSISTENCE_COORDINATED_PATH";
pub const COORDINATED_VERSION_VAR: &str = "NEXUS_PERSISTENCE_COORDINATED_VERSION";
pub const LOG_LEVEL_VAR: &str = "NEXUS_LOG_LEVEL";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`. Blank values count as unset.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let coordination_endpoints = get(ENDPOINTS_VAR)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let session_timeout_secs: u64 =
            parse(SESSION_TIMEOUT_VAR, get(SESSION_TIMEOUT_VAR))?.unwrap_or(5);
        if session_timeout_secs == 0 {
            return Err(invalid(SESSION_TIMEOUT_VAR, "0", "must be positive"));
        }

        let master_namespace = namespace(
            MASTER_NAMESPACE_VAR,
            get(MASTER_NAMESPACE_VAR).unwrap_or_else(|| "/nexus/master".to_string()),
        )?;

        let scheduler_namespace = namespace(
            SCHEDULER_NAMESPACE_VAR,
            get(SCHEDULER_NAMESPACE_VAR).unwrap_or_else(|| "/nexus/scheduler".to_string()),
        )?;

        let advertise_addr = parse(ADVERTISE_ADDR_VAR, get(ADVERTISE_ADDR_VAR))?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8081)));

        let coordinated_path = get(COORDINATED_PATH_VAR);
        let coordinated_version: Option<u32> =
            parse(COORDINATED_VERSION_VAR, get(COORDINATED_VERSION_VAR))?;
        let coordinated_persistence = match (coordinated_path, coordinated_version) {
            (Some(path), Some(version)) => Some(CoordinatedStore {
                path: namespace(COORDINATED_PATH_VAR, path)?,
                version,
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::IncompleteCoordinatedPersistence {
                    path_var: COORDINATED_PATH_VAR,
                    version_var: COORDINATED_VERSION_VAR,
                })
            }
        };

        Ok(Self {
            coordination_endpoints,
            session_timeout: Duration::from_secs(session_timeout_secs),
            master_namespace,
            master_address: get(MASTER_ADDRESS_VAR),
            scheduler_namespace,
            advertise_addr,
            local_persistence_path: get(LOCAL_PATH_VAR).map(PathBuf::from),
            coordinated_persistence,
            log_level: get(LOG_LEVEL_VAR).unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| v.parse().map_err(|e| invalid(var, &v, e)))
        .transpose()
}

fn namespace(var: &'static str, value: String) -> Result<String, ConfigError> {
    let well_formed = value.starts_with('/')
        && (value == "/" || (!value.ends_with('/') && !value[1..].split('/').any(str::is_empty)));
    if !well_formed {
        return Err(invalid(var, &value, "must be an absolute path"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert!(config.coordination_endpoints.is_empty());
        assert_eq!(config.session_timeout, Duration::from_secs(5));
        assert_eq!(config.master_namespace, "/nexus/master");
        assert_eq!(config.scheduler_namespace, "/nexus/scheduler");
        assert_eq!(config.master_address, None);
        assert_eq!(config.local_persistence_path, None);
        assert_eq!(config.coordinated_persistence, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_endpoints_split_and_trimmed() {
        let config = load(&[(ENDPOINTS_VAR, "zk1:2181, zk2:2181,,")]).unwrap();
        assert_eq!(config.coordination_endpoints, vec!["zk1:2181", "zk2:2181"]);
    }

    #[test]
    fn test_coordinated_persistence_pair() {
        let config = load(&[
            (COORDINATED_PATH_VAR, "/nexus/state"),
            (COORDINATED_VERSION_VAR, "3"),
            (LOCAL_PATH_VAR, "/var/nexus"),
        ])
        .unwrap();
        assert_eq!(
            config.coordinated_persistence,
            Some(CoordinatedStore {
                path: "/nexus/state".to_string(),
                version: 3,
            })
        );
        assert_eq!(config.local_persistence_path, Some(PathBuf::from("/var/nexus")));
    }

    #[test]
    fn test_coordinated_path_without_version_rejected() {
        let err = load(&[(COORDINATED_PATH_VAR, "/nexus/state")]).unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteCoordinatedPersistence { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = load(&[(SESSION_TIMEOUT_VAR, "soon")]).unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");

        let err = load(&[(SESSION_TIMEOUT_VAR, "0")]).unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");

        let err = load(&[(MASTER_NAMESPACE_VAR, "nexus/master")]).unwrap_err();
        assert!(err.to_string().contains(MASTER_NAMESPACE_VAR));

        assert!(load(&[(ADVERTISE_ADDR_VAR, "not-an-addr")]).is_err());
    }

    #[test]
    fn test_blank_master_address_is_unset() {
        let config = load(&[(MASTER_ADDRESS_VAR, "  ")]).unwrap();
        assert_eq!(config.master_address, None);
    }
}
