//! In-process coordination service for testing and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{CoordinationError, ErrorCode, Result};
use crate::path;
use crate::{CoordinationClient, CreateMode, EventType, Stat, WatchReceiver, WatchedEvent};

/// Owner id stamped on ephemeral nodes.
const SESSION_ID: i64 = 0x5e55_1011;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
    /// Counter for sequential children.
    next_sequence: u32,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
    zxid: i64,
}

impl Tree {
    fn children(&self, parent: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| path::parent(p) == Some(parent))
            .map(|p| path::name(p).to_string())
            .collect()
    }

    fn fire_children_changed(&mut self, parent: &str) {
        if let Some(watchers) = self.child_watches.remove(parent) {
            for watcher in watchers {
                let _ = watcher.send(WatchedEvent {
                    event_type: EventType::NodeChildrenChanged,
                    path: parent.to_string(),
                });
            }
        }
    }
}

/// Coordination service held entirely in memory.
///
/// Behaves like a single-session ZooKeeper ensemble: sequential suffixes,
/// ephemeral ownership, versions and one-shot child watches. An
/// `unreachable()` instance fails every call with a connect error.
pub struct InMemoryCoordination {
    tree: Mutex<Tree>,
    calls: AtomicU64,
    unreachable: bool,
    session_timeout: Duration,
}

impl InMemoryCoordination {
    /// Create an empty tree containing only the root.
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                stat: Stat::default(),
                next_sequence: 0,
            },
        );

        Self {
            tree: Mutex::new(tree),
            calls: AtomicU64::new(0),
            unreachable: false,
            session_timeout: Duration::from_secs(5),
        }
    }

    /// Create an instance whose every operation fails to connect.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new()
        }
    }

    /// Number of operations invoked so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Drop every ephemeral node, as if the session expired.
    pub fn expire_session(&self) {
        let mut tree = self.lock();
        let ephemeral: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner != 0)
            .map(|(path, _)| path.clone())
            .collect();

        for node_path in ephemeral {
            tree.nodes.remove(&node_path);
            if let Some(parent) = path::parent(&node_path) {
                let parent = parent.to_string();
                if let Some(parent_node) = tree.nodes.get_mut(&parent) {
                    parent_node.stat.cversion += 1;
                    parent_node.stat.num_children -= 1;
                }
                tree.fire_children_changed(&parent);
            }
        }
        debug!("Expired in-memory session");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tree> {
        // A poisoned tree is still structurally valid.
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, path: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(CoordinationError::Connect {
                endpoints: vec!["in-memory".to_string()],
                reason: "coordination service unreachable".to_string(),
            });
        }
        path::validate(path)
    }
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version(stat: &Stat, expected: Option<i32>, path: &str) -> Result<()> {
    match expected {
        Some(version) if version != stat.version => {
            Err(CoordinationError::server(ErrorCode::BadVersion, path))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordination {
    async fn create(&self, node_path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.enter(node_path)?;
        let mut tree = self.lock();

        let parent = path::parent(node_path)
            .ok_or_else(|| CoordinationError::server(ErrorCode::NodeExists, node_path))?
            .to_string();
        let parent_node = tree
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| CoordinationError::server(ErrorCode::NoNode, node_path))?;
        if parent_node.stat.ephemeral_owner != 0 {
            return Err(CoordinationError::server(
                ErrorCode::NoChildrenForEphemerals,
                node_path,
            ));
        }

        let created = if mode.is_sequential() {
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{node_path}{sequence:010}")
        } else {
            node_path.to_string()
        };
        if tree.nodes.contains_key(&created) {
            return Err(CoordinationError::server(ErrorCode::NodeExists, created));
        }

        tree.zxid += 1;
        let zxid = tree.zxid;
        if let Some(parent_node) = tree.nodes.get_mut(&parent) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children += 1;
            parent_node.stat.pzxid = zxid;
        }
        tree.nodes.insert(
            created.clone(),
            Node {
                data: data.to_vec(),
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    pzxid: zxid,
                    ephemeral_owner: if mode.is_ephemeral() { SESSION_ID } else { 0 },
                    data_length: data.len() as i32,
                    ..Stat::default()
                },
                next_sequence: 0,
            },
        );
        tree.fire_children_changed(&parent);

        Ok(created)
    }

    async fn delete(&self, node_path: &str, version: Option<i32>) -> Result<()> {
        self.enter(node_path)?;
        let mut tree = self.lock();

        let node = tree
            .nodes
            .get(node_path)
            .ok_or_else(|| CoordinationError::server(ErrorCode::NoNode, node_path))?;
        check_version(&node.stat, version, node_path)?;
        if node.stat.num_children > 0 {
            return Err(CoordinationError::server(ErrorCode::NotEmpty, node_path));
        }

        tree.nodes.remove(node_path);
        if let Some(parent) = path::parent(node_path) {
            let parent = parent.to_string();
            if let Some(parent_node) = tree.nodes.get_mut(&parent) {
                parent_node.stat.cversion += 1;
                parent_node.stat.num_children -= 1;
            }
            tree.fire_children_changed(&parent);
        }
        if let Some(watchers) = tree.child_watches.remove(node_path) {
            for watcher in watchers {
                let _ = watcher.send(WatchedEvent {
                    event_type: EventType::NodeDeleted,
                    path: node_path.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn exists(&self, node_path: &str) -> Result<Option<Stat>> {
        self.enter(node_path)?;
        Ok(self.lock().nodes.get(node_path).map(|node| node.stat))
    }

    async fn get_data(&self, node_path: &str) -> Result<(Vec<u8>, Stat)> {
        self.enter(node_path)?;
        self.lock()
            .nodes
            .get(node_path)
            .map(|node| (node.data.clone(), node.stat))
            .ok_or_else(|| CoordinationError::server(ErrorCode::NoNode, node_path))
    }

    async fn set_data(&self, node_path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
        self.enter(node_path)?;
        let mut tree = self.lock();
        tree.zxid += 1;
        let zxid = tree.zxid;

        let node = tree
            .nodes
            .get_mut(node_path)
            .ok_or_else(|| CoordinationError::server(ErrorCode::NoNode, node_path))?;
        check_version(&node.stat, version, node_path)?;

        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.data_length = data.len() as i32;
        Ok(node.stat)
    }

    async fn get_children(&self, node_path: &str) -> Result<Vec<String>> {
        self.enter(node_path)?;
        let tree = self.lock();
        if !tree.nodes.contains_key(node_path) {
            return Err(CoordinationError::server(ErrorCode::NoNode, node_path));
        }
        Ok(tree.children(node_path))
    }

    async fn watch_children(&self, node_path: &str) -> Result<(Vec<String>, WatchReceiver)> {
        self.enter(node_path)?;
        let mut tree = self.lock();
        if !tree.nodes.contains_key(node_path) {
            return Err(CoordinationError::server(ErrorCode::NoNode, node_path));
        }

        let (watch_tx, watch_rx) = oneshot::channel();
        tree.child_watches
            .entry(node_path.to_string())
            .or_default()
            .push(watch_tx);
        Ok((tree.children(node_path), watch_rx))
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}
