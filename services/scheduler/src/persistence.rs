//! Durable scheduler state.
//!
//! The backend is chosen once at startup by [`select`] and bound for the
//! scheduler's whole run:
//!
//! - `Coordinated(path, version)` whenever a coordinated path is configured,
//!   even if a local path is also present
//! - `Local(path)` otherwise
//!
//! With neither configured there is no safe default and selection fails.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nexus_coordination::{ensure_path, CoordinationClient, CoordinationError, CreateMode};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, ConfigError};
use crate::coordination::Coordination;

/// Errors from reading or writing scheduler state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),
}

/// Selected persistence backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceBackend {
    /// A file on the local filesystem.
    Local(PathBuf),
    /// A node in the coordination service, with a state format version.
    Coordinated { path: String, version: u32 },
}

impl fmt::Display for PersistenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "local:{}", path.display()),
            Self::Coordinated { path, version } => write!(f, "coordinated:{path}@v{version}"),
        }
    }
}

/// Choose the persistence backend. Pure; performs no I/O.
pub fn select(config: &Config) -> Result<PersistenceBackend, ConfigError> {
    if let Some(store) = &config.coordinated_persistence {
        return Ok(PersistenceBackend::Coordinated {
            path: store.path.clone(),
            version: store.version,
        });
    }

    config
        .local_persistence_path
        .clone()
        .map(PersistenceBackend::Local)
        .ok_or(ConfigError::MissingPersistencePath)
}

impl PersistenceBackend {
    /// Open the store behind this backend.
    pub fn open(
        &self,
        coordination: &Coordination,
    ) -> Result<Arc<dyn PersistenceLayer>, ConfigError> {
        let layer: Arc<dyn PersistenceLayer> = match self {
            Self::Local(path) => Arc::new(FileSystemPersistence::new(path.clone())),
            Self::Coordinated { path, version } => {
                let client = coordination.client().ok_or_else(|| {
                    ConfigError::CoordinatedPersistenceUnavailable { path: path.clone() }
                })?;
                Arc::new(CoordinatedPersistence::new(
                    Arc::clone(client),
                    path.clone(),
                    *version,
                ))
            }
        };
        info!(backend = %self, "Persistence backend opened");
        Ok(layer)
    }
}

/// Storage for serialized scheduler state.
#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    /// Load the last committed state, `None` if nothing was stored yet.
    async fn fetch(&self) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace the stored state.
    async fn commit(&self, data: &[u8]) -> Result<(), PersistenceError>;
}

/// State kept in a single local file.
pub struct FileSystemPersistence {
    path: PathBuf,
}

impl FileSystemPersistence {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl PersistenceLayer for FileSystemPersistence {
    async fn fetch(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(&self.path, e)),
        }
    }

    async fn commit(&self, data: &[u8]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(parent, e))?;
        }

        // Write a sibling and rename so readers never see a partial file.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| self.io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(&self.path, e))?;

        debug!(path = %self.path.display(), bytes = data.len(), "Committed scheduler state");
        Ok(())
    }
}

/// State kept in a coordination service node.
///
/// Each format version lives in its own child node (`<path>/v<version>`).
pub struct CoordinatedPersistence {
    client: Arc<dyn CoordinationClient>,
    base_path: String,
    node_path: String,
}

impl CoordinatedPersistence {
    pub fn new(client: Arc<dyn CoordinationClient>, path: String, version: u32) -> Self {
        let node_path = format!("{}/v{version}", path.trim_end_matches('/'));
        Self {
            client,
            base_path: path,
            node_path,
        }
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }
}

#[async_trait]
impl PersistenceLayer for CoordinatedPersistence {
    async fn fetch(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        match self.client.get_data(&self.node_path).await {
            Ok((data, _)) => Ok(Some(data)),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, data: &[u8]) -> Result<(), PersistenceError> {
        match self.client.set_data(&self.node_path, data, None).await {
            Ok(_) => {}
            Err(e) if e.is_no_node() => {
                ensure_path(self.client.as_ref(), &self.base_path).await?;
                match self
                    .client
                    .create(&self.node_path, data, CreateMode::Persistent)
                    .await
                {
                    Ok(_) => {}
                    // Lost a race with another writer; overwrite.
                    Err(e) if e.is_node_exists() => {
                        self.client.set_data(&self.node_path, data, None).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        debug!(path = %self.node_path, bytes = data.len(), "Committed scheduler state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatedStore;
    use nexus_coordination::InMemoryCoordination;
    use rstest::rstest;

    fn config(local: Option<&str>, coordinated: Option<(&str, u32)>) -> Config {
        let mut config = Config::from_vars(|_| None).unwrap();
        config.local_persistence_path = local.map(PathBuf::from);
        config.coordinated_persistence = coordinated.map(|(path, version)| CoordinatedStore {
            path: path.to_string(),
            version,
        });
        config
    }

    #[rstest]
    #[case(None, Some(("/nexus/state", 3)))]
    #[case(Some("/var/nexus"), Some(("/nexus/state", 3)))]
    fn test_coordinated_path_wins(
        #[case] local: Option<&str>,
        #[case] coordinated: Option<(&str, u32)>,
    ) {
        let backend = select(&config(local, coordinated)).unwrap();
        assert_eq!(
            backend,
            PersistenceBackend::Coordinated {
                path: "/nexus/state".to_string(),
                version: 3,
            }
        );
    }

    #[test]
    fn test_local_path_selected_without_coordinated() {
        let backend = select(&config(Some("/var/nexus"), None)).unwrap();
        assert_eq!(backend, PersistenceBackend::Local(PathBuf::from("/var/nexus")));
    }

    #[test]
    fn test_no_path_is_configuration_error() {
        let err = select(&config(None, None)).unwrap_err();
        assert_eq!(err, ConfigError::MissingPersistencePath);
    }

    #[test]
    fn test_selection_is_repeatable() {
        let config = config(Some("/var/nexus"), Some(("/nexus/state", 7)));
        assert_eq!(select(&config).unwrap(), select(&config).unwrap());
    }

    #[test]
    fn test_coordinated_backend_needs_coordination() {
        let backend = PersistenceBackend::Coordinated {
            path: "/nexus/state".to_string(),
            version: 1,
        };
        let err = backend.open(&Coordination::Disabled).err().unwrap();
        assert_eq!(err.reason_code(), "persistence_unavailable");
    }

    #[tokio::test]
    async fn test_file_system_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemPersistence::new(dir.path().join("state").join("scheduler.json"));

        assert_eq!(store.fetch().await.unwrap(), None);
        store.commit(b"first").await.unwrap();
        store.commit(b"second").await.unwrap();
        assert_eq!(store.fetch().await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_coordinated_store_is_versioned() {
        let zk: Arc<dyn CoordinationClient> = Arc::new(InMemoryCoordination::new());
        let v1 = CoordinatedPersistence::new(Arc::clone(&zk), "/nexus/state".to_string(), 1);
        let v2 = CoordinatedPersistence::new(Arc::clone(&zk), "/nexus/state".to_string(), 2);
        assert_eq!(v1.node_path(), "/nexus/state/v1");

        assert_eq!(v1.fetch().await.unwrap(), None);
        v1.commit(b"old format").await.unwrap();
        v1.commit(b"old format, updated").await.unwrap();

        assert_eq!(v1.fetch().await.unwrap(), Some(b"old format, updated".to_vec()));
        assert_eq!(v2.fetch().await.unwrap(), None);
    }
}
