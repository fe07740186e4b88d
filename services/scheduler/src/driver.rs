//! Driver handle binding a scheduling engine to the resolved master.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use nexus_coordination::LeaderWatch;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::coordination::Coordination;
use crate::master::MasterHandle;
use crate::persistence::{PersistenceBackend, PersistenceLayer};
use crate::registrar::Registration;

/// What a scheduling engine is handed when it starts.
#[derive(Clone)]
pub struct SchedulerContext {
    pub master: MasterHandle,
    pub persistence: Arc<dyn PersistenceLayer>,
}

/// A scheduling engine driven by the [`DriverHandle`].
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `shutdown` flips to `true` or the engine fails.
    async fn run(
        &self,
        context: SchedulerContext,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}

/// Everything bootstrap produced, ready to drive the scheduler.
pub struct DriverHandle {
    scheduler: Arc<dyn Scheduler>,
    master: MasterHandle,
    backend: PersistenceBackend,
    store: Arc<dyn PersistenceLayer>,
    coordination: Coordination,
    registration: Option<Registration>,
    leader_watch: Option<LeaderWatch>,
}

impl DriverHandle {
    pub(crate) fn new(
        scheduler: Arc<dyn Scheduler>,
        master: MasterHandle,
        backend: PersistenceBackend,
        store: Arc<dyn PersistenceLayer>,
        coordination: Coordination,
        registration: Option<Registration>,
        leader_watch: Option<LeaderWatch>,
    ) -> Self {
        Self {
            scheduler,
            master,
            backend,
            store,
            coordination,
            registration,
            leader_watch,
        }
    }

    pub fn master(&self) -> &MasterHandle {
        &self.master
    }

    pub fn backend(&self) -> &PersistenceBackend {
        &self.backend
    }

    pub fn store(&self) -> &Arc<dyn PersistenceLayer> {
        &self.store
    }

    pub fn coordination(&self) -> &Coordination {
        &self.coordination
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn scheduler_name(&self) -> &str {
        self.scheduler.name()
    }

    /// Whether leader-change notifications are still being received.
    pub fn is_watching_leader(&self) -> bool {
        self.leader_watch
            .as_ref()
            .map(LeaderWatch::is_active)
            .unwrap_or(false)
    }

    /// Drive the scheduler until shutdown, then withdraw from discovery.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Self {
            scheduler,
            master,
            backend,
            store,
            registration,
            leader_watch,
            ..
        } = self;

        info!(
            master = %master,
            scheduler = scheduler.name(),
            backend = %backend,
            "Connecting to nexus master"
        );

        let context = SchedulerContext {
            master,
            persistence: store,
        };
        let result = scheduler.run(context, shutdown).await;
        drop(leader_watch);

        if let Some(registration) = registration {
            let member = registration.member_path().to_string();
            match registration.withdraw().await {
                Ok(()) => info!(member = %member, "Withdrew scheduler from discovery registry"),
                Err(e) => warn!(member = %member, error = %e, "Failed to withdraw registration"),
            }
        }

        result.with_context(|| format!("scheduler {} failed", scheduler.name()))
    }
}

/// State recorded by [`StandbyScheduler`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyState {
    /// Number of times the scheduler has started against this store.
    pub starts: u64,
    /// Master the last start was bound to.
    pub last_master: Option<String>,
}

/// Engine that records its start in persistence and idles until shutdown.
#[derive(Debug, Default)]
pub struct StandbyScheduler;

impl StandbyScheduler {
    pub fn new() -> Self {
        Self
    }

    async fn load(persistence: &dyn PersistenceLayer) -> anyhow::Result<StandbyState> {
        let Some(data) = persistence.fetch().await? else {
            info!("No persisted scheduler state, starting fresh");
            return Ok(StandbyState::default());
        };

        info!(bytes = data.len(), "Loaded persisted scheduler state");
        match serde_json::from_slice(&data) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = %e, "Persisted scheduler state unreadable, starting fresh");
                Ok(StandbyState::default())
            }
        }
    }
}

#[async_trait]
impl Scheduler for StandbyScheduler {
    fn name(&self) -> &str {
        "standby"
    }

    async fn run(
        &self,
        context: SchedulerContext,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut state = Self::load(context.persistence.as_ref()).await?;
        state.starts += 1;
        state.last_master = Some(context.master.address().to_string());

        let data = serde_json::to_vec(&state).context("failed to encode scheduler state")?;
        context.persistence.commit(&data).await?;
        info!(starts = state.starts, master = %context.master, "Standby scheduler ready");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Standby scheduler shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::master;
    use crate::persistence::FileSystemPersistence;
    use crate::registrar;
    use nexus_coordination::{CoordinationClient, InMemoryCoordination};
    use std::path::PathBuf;

    async fn override_master() -> MasterHandle {
        let config = Config::from_vars(|var| {
            (var == crate::config::MASTER_ADDRESS_VAR).then(|| "10.0.0.5:5050".to_string())
        })
        .unwrap();
        master::resolve(&config, &Coordination::Disabled)
            .await
            .unwrap()
            .master
    }

    fn local_handle(
        scheduler: Arc<dyn Scheduler>,
        master: MasterHandle,
        path: PathBuf,
    ) -> DriverHandle {
        DriverHandle::new(
            scheduler,
            master,
            PersistenceBackend::Local(path.clone()),
            Arc::new(FileSystemPersistence::new(path)),
            Coordination::Disabled,
            None,
            None,
        )
    }

    struct FailingScheduler;

    #[async_trait]
    impl Scheduler for FailingScheduler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(
            &self,
            _context: SchedulerContext,
            _shutdown: watch::Receiver<bool>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("engine crashed")
        }
    }

    #[tokio::test]
    async fn test_standby_records_each_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        let master = override_master().await;

        for expected in 1..=2 {
            let handle =
                local_handle(Arc::new(StandbyScheduler::new()), master.clone(), path.clone());
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let run = tokio::spawn(handle.run(shutdown_rx));
            shutdown_tx.send(true).unwrap();
            run.await.unwrap().unwrap();

            let store = FileSystemPersistence::new(path.clone());
            let data = store.fetch().await.unwrap().unwrap();
            let state: StandbyState = serde_json::from_slice(&data).unwrap();
            assert_eq!(state.starts, expected);
            assert_eq!(state.last_master.as_deref(), Some("10.0.0.5:5050"));
        }
    }

    #[tokio::test]
    async fn test_standby_recovers_from_unreadable_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        std::fs::write(&path, b"not json").unwrap();

        let handle = local_handle(
            Arc::new(StandbyScheduler::new()),
            override_master().await,
            path.clone(),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        handle.run(shutdown_rx).await.unwrap();

        let state: StandbyState = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(state.starts, 1);
    }

    #[tokio::test]
    async fn test_run_withdraws_registration() {
        let zk = Arc::new(InMemoryCoordination::new());
        let coordination = Coordination::Enabled(zk.clone());
        let config = Config::from_vars(|_| None).unwrap();
        let registration = registrar::register(&config, &coordination).await.unwrap();
        assert!(registration.is_some());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        let handle = DriverHandle::new(
            Arc::new(StandbyScheduler::new()),
            override_master().await,
            PersistenceBackend::Local(path.clone()),
            Arc::new(FileSystemPersistence::new(path)),
            coordination,
            registration,
            None,
        );
        assert!(handle.registration().is_some());
        assert!(!handle.is_watching_leader());

        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        handle.run(shutdown_rx).await.unwrap();
        assert!(zk.get_children("/nexus/scheduler").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let handle = local_handle(
            Arc::new(FailingScheduler),
            override_master().await,
            dir.path().join("scheduler.json"),
        );
        assert_eq!(handle.scheduler_name(), "failing");

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = handle.run(shutdown_rx).await.unwrap_err();
        assert_eq!(err.to_string(), "scheduler failing failed");
        assert_eq!(err.root_cause().to_string(), "engine crashed");
    }
}
