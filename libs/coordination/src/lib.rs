//! nexus coordination client library
//!
//! Talks to a consensus-backed coordination service (ZooKeeper) and builds
//! the cluster primitives the scheduler needs on top of it.
//!
//! ## Modules
//!
//! - `client`: the lazily-connected ZooKeeper session (`ZkClient`)
//! - `proto`: jute wire encoding for requests, replies and notifications
//! - `group`: election groups, membership and leader candidates
//! - `server_set`: service discovery registrations
//! - `memory`: in-process implementation for tests and local runs
//! - `path`: namespace path helpers

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

pub mod client;
pub mod error;
pub mod group;
pub mod memory;
pub mod path;
pub mod proto;
pub mod server_set;

pub use client::ZkClient;
pub use error::{CoordinationError, ErrorCode, ErrorKind, Result};
pub use group::{Candidate, Group, LeaderWatch, Membership};
pub use memory::InMemoryCoordination;
pub use path::ensure_path;
pub use server_set::{EndpointStatus, ServerSet, ServiceInstance, Status};

/// Node metadata returned by reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    /// Protocol flag value.
    pub fn flags(&self) -> i32 {
        match self {
            Self::Persistent => 0,
            Self::Ephemeral => 1,
            Self::PersistentSequential => 2,
            Self::EphemeralSequential => 3,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl EventType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::None),
            1 => Some(Self::NodeCreated),
            2 => Some(Self::NodeDeleted),
            3 => Some(Self::NodeDataChanged),
            4 => Some(Self::NodeChildrenChanged),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::None => -1,
            Self::NodeCreated => 1,
            Self::NodeDeleted => 2,
            Self::NodeDataChanged => 3,
            Self::NodeChildrenChanged => 4,
        }
    }
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub path: String,
}

/// One-shot watch. Resolves on the next change, or errors if the session
/// that armed it is lost.
pub type WatchReceiver = oneshot::Receiver<WatchedEvent>;

/// Coordination service operations used by the scheduler.
///
/// Implementations are internally synchronized and shared as
/// `Arc<dyn CoordinationClient>`.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a node, returning its actual path (sequential nodes get a suffix).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Delete a node. `None` matches any version.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Stat a node, `None` if it does not exist.
    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Read a node's data.
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    /// Overwrite a node's data. `None` matches any version.
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat>;

    /// List child names of a node.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// List child names and arm a one-shot watch on the node's membership.
    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchReceiver)>;

    /// Session timeout; bounds blocking reads.
    fn session_timeout(&self) -> Duration;
}

/// Open ACL granting all permissions to everyone.
pub const OPEN_ACL_UNSAFE_PERMS: i32 = 0x1f;
