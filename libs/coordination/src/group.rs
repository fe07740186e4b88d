//! Election groups and leader candidates.
//!
//! A group is a node whose children are ephemeral member registrations.
//! Members created through [`Group::join`] are named `member_<sequence>`;
//! the candidate with the lowest sequence is the leader, and the data it
//! published is the leader's identity.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, Result};
use crate::path;
use crate::{ensure_path, CoordinationClient, CreateMode, WatchReceiver};

/// Name prefix of members created by `join`.
pub const MEMBER_PREFIX: &str = "member_";

/// Width of the sequence suffix appended by the service.
const SEQUENCE_DIGITS: usize = 10;

type NodeNameFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A named ensemble of member registrations.
#[derive(Clone)]
pub struct Group {
    client: Arc<dyn CoordinationClient>,
    path: String,
    filter: NodeNameFilter,
}

impl Group {
    /// Group rooted at `path`, considering only `member_*` children.
    pub fn new(client: Arc<dyn CoordinationClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            filter: Arc::new(|name| name.starts_with(MEMBER_PREFIX)),
        }
    }

    /// Replace the child-name filter.
    pub fn with_node_name_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }

    /// Treat every child as a member.
    pub fn accept_all(self) -> Self {
        self.with_node_name_filter(|_| true)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    fn members_of(&self, children: Vec<String>) -> Vec<String> {
        let mut members: Vec<String> = children
            .into_iter()
            .filter(|name| (self.filter)(name))
            .collect();
        members.sort_by(|a, b| member_order(a, b));
        members
    }

    /// Current member ids, leader first.
    pub async fn member_ids(&self) -> Result<Vec<String>> {
        let children = self.client.get_children(&self.path).await?;
        Ok(self.members_of(children))
    }

    /// Data published by a member.
    pub async fn member_data(&self, member_id: &str) -> Result<Vec<u8>> {
        let (data, _) = self
            .client
            .get_data(&path::join(&self.path, member_id))
            .await?;
        Ok(data)
    }

    /// Current member ids plus a one-shot watch on the next membership change.
    pub async fn watch(&self) -> Result<(Vec<String>, WatchReceiver)> {
        let (children, changed) = self
            .client
            .watch_children(&self.path)
            .await
            .map_err(|e| CoordinationError::watch(self.path.as_str(), e))?;
        Ok((self.members_of(children), changed))
    }

    /// Register an ephemeral member publishing `data`.
    pub async fn join(&self, data: &[u8]) -> Result<Membership> {
        ensure_path(self.client.as_ref(), &self.path).await?;

        let member_path = self
            .client
            .create(
                &path::join(&self.path, MEMBER_PREFIX),
                data,
                CreateMode::EphemeralSequential,
            )
            .await?;
        info!(group = %self.path, member = %member_path, "Joined group");

        Ok(Membership {
            client: Arc::clone(&self.client),
            member_path,
        })
    }
}

/// Sequence suffix of a member name, if it carries one.
fn sequence_of(name: &str) -> Option<u64> {
    let suffix = name.get(name.len().checked_sub(SEQUENCE_DIGITS)?..)?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Sequenced members first by sequence, the rest by name.
fn member_order(a: &str, b: &str) -> Ordering {
    match (sequence_of(a), sequence_of(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// A live group registration.
pub struct Membership {
    client: Arc<dyn CoordinationClient>,
    member_path: String,
}

impl Membership {
    /// Full path of the member node.
    pub fn member_path(&self) -> &str {
        &self.member_path
    }

    /// Member id within the group.
    pub fn member_id(&self) -> &str {
        path::name(&self.member_path)
    }

    /// Leave the group.
    pub async fn cancel(self) -> Result<()> {
        match self.client.delete(&self.member_path, None).await {
            Ok(()) => {}
            // Already gone with the session.
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e),
        }
        info!(member = %self.member_path, "Left group");
        Ok(())
    }
}

/// Leader view over a group.
pub struct Candidate {
    group: Group,
}

impl Candidate {
    pub fn new(group: Group) -> Self {
        Self { group }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Identity published by the current leader, `None` if the group is empty.
    pub async fn leader_id(&self) -> Result<Option<String>> {
        let members = self.group.member_ids().await?;
        read_leader(&self.group, &members).await
    }

    /// Notify `listener` of the current leader now and on every later change.
    ///
    /// Fails if the membership watch cannot be armed. Notifications stop when
    /// the returned handle is dropped or the session is lost.
    pub async fn watch_leader<F>(&self, listener: F) -> Result<LeaderWatch>
    where
        F: Fn(Option<String>) + Send + Sync + 'static,
    {
        let (members, changed) = self.group.watch().await?;
        let mut current = read_leader(&self.group, &members).await?;
        listener(current.clone());

        let group = self.group.clone();
        let task = tokio::spawn(async move {
            let mut changed = changed;
            loop {
                if changed.await.is_err() {
                    warn!(group = %group.path(), "Leader watch ended with the coordination session");
                    break;
                }

                let (members, next) = match group.watch().await {
                    Ok(watched) => watched,
                    Err(e) => {
                        warn!(group = %group.path(), error = %e, "Failed to re-arm leader watch");
                        break;
                    }
                };
                changed = next;

                match read_leader(&group, &members).await {
                    Ok(leader) if leader != current => {
                        current = leader.clone();
                        listener(leader);
                    }
                    Ok(_) => debug!(group = %group.path(), "Group changed, leader unchanged"),
                    Err(e) => warn!(group = %group.path(), error = %e, "Failed to read leader"),
                }
            }
        });

        Ok(LeaderWatch { task })
    }
}

async fn read_leader(group: &Group, members: &[String]) -> Result<Option<String>> {
    let Some(leader) = members.first() else {
        return Ok(None);
    };
    let data = group.member_data(leader).await?;
    Ok(Some(String::from_utf8_lossy(&data).into_owned()))
}

/// Background leader notifications; stops when dropped.
#[derive(Debug)]
pub struct LeaderWatch {
    task: JoinHandle<()>,
}

impl LeaderWatch {
    /// True while notifications are still being delivered.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for LeaderWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
