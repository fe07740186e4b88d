//! nexus Scheduler Library
//!
//! Startup wiring for the cluster scheduler: locating the elected master,
//! choosing where scheduler state is persisted, advertising the scheduler in
//! the discovery registry, and binding it all into a driver.
//!
//! ## Bootstrap
//!
//! ```text
//! Config
//!  └── Coordination (optional client)
//!       ├── registrar   (discovery registration, best effort)
//!       ├── persistence (backend selection)
//!       └── master      (override or elected leader, fatal on failure)
//!            └── DriverHandle (scheduler + master + store)
//! ```
//!
//! ## Modules
//!
//! - `bootstrap`: the ordered startup sequence
//! - `config`: environment configuration
//! - `coordination`: the optional coordination capability
//! - `driver`: scheduler trait, driver handle and the standby engine
//! - `master`: master resolution
//! - `persistence`: backend selection and stores
//! - `registrar`: discovery registration

pub mod bootstrap;
pub mod config;
pub mod coordination;
pub mod driver;
pub mod error;
pub mod master;
pub mod persistence;
pub mod registrar;

pub use bootstrap::{bootstrap, bootstrap_with};
pub use config::{Config, ConfigError, CoordinatedStore};
pub use coordination::Coordination;
pub use driver::{DriverHandle, Scheduler, SchedulerContext, StandbyScheduler, StandbyState};
pub use error::{BootstrapError, UnresolvedCause};
pub use master::{MasterHandle, MasterSource, Resolution};
pub use persistence::{PersistenceBackend, PersistenceError, PersistenceLayer};
pub use registrar::Registration;
