//! Task assignment to live nodes.
//!
//! Assignment and the idle-eviction recheck serialize on one
//! [`SchedulingLock`]; without it the eviction race check is meaningless.

use std::sync::Arc;

use mansion_id::NodeId;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::node::{BuildRecord, Connectable, LiveNode, NodeTable};
use crate::retention::RetentionController;

/// The global scheduling lock.
#[derive(Debug, Default)]
pub struct SchedulingLock {
    inner: Mutex<()>,
}

impl SchedulingLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is not online")]
    NotOnline(NodeId),

    #[error("node {0} is not accepting tasks")]
    NotAccepting(NodeId),

    #[error("node {0} has no running task")]
    NotBusy(NodeId),
}

/// Hands tasks to nodes and records their completion.
pub struct TaskDispatcher {
    lock: Arc<SchedulingLock>,
    nodes: Arc<NodeTable>,
    retention: Arc<RetentionController>,
}

impl TaskDispatcher {
    pub fn new(
        lock: Arc<SchedulingLock>,
        nodes: Arc<NodeTable>,
        retention: Arc<RetentionController>,
    ) -> Self {
        Self {
            lock,
            nodes,
            retention,
        }
    }

    fn node(&self, id: NodeId) -> Result<Arc<LiveNode>, DispatchError> {
        self.nodes.get(id).ok_or(DispatchError::UnknownNode(id))
    }

    /// Start a task on `id`.
    pub async fn assign(&self, id: NodeId) -> Result<(), DispatchError> {
        let _guard = self.lock.lock().await;
        let node = self.node(id)?;
        if !node.is_online() {
            return Err(DispatchError::NotOnline(id));
        }
        if !node.is_accepting_tasks() {
            return Err(DispatchError::NotAccepting(id));
        }
        node.begin_task();
        debug!(node = %node.name(), busy = node.busy(), "task assigned");
        Ok(())
    }

    /// Finish a task on `id`, then schedule a prompt idle recheck.
    pub fn complete(&self, id: NodeId, record: Option<BuildRecord>) -> Result<(), DispatchError> {
        let node = self.node(id)?;
        if node.is_idle() {
            return Err(DispatchError::NotBusy(id));
        }
        node.finish_task(record);
        debug!(node = %node.name(), busy = node.busy(), "task completed");
        self.retention.schedule_recheck();
        Ok(())
    }
}
