//! Live nodes: booted VMs attached as workers.
//!
//! Lifecycle:
//! ```text
//! Connecting -> Online <-> Offline
//!      \__________________/
//!                 |
//!            terminated
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mansion_id::{AllocationId, NodeId, TemplateId};
use mansion_throttle::HardwareSpec;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::{BrokerError, VirtualMachine};
use crate::template::Template;

/// Connection state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Online,
    Offline,
}

/// One finished task, recorded for the billing memo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub url: String,
    #[serde(rename = "durationInMilliseconds")]
    pub duration_ms: u64,
    pub project: String,
    pub number: u64,
    /// Epoch milliseconds.
    #[serde(rename = "scheduledTimestamp")]
    pub scheduled_at: i64,
    pub user_causes: Vec<String>,
}

#[derive(Debug)]
struct NodeState {
    connection: ConnectionState,
    connected_at: Option<Instant>,
    accepting_tasks: bool,
    idle_since: Instant,
    busy: u32,
    last_renewed: Instant,
    builds: Vec<BuildRecord>,
    terminated: bool,
}

/// Something whose broker lease must be kept alive.
#[async_trait]
pub trait Leasable: Send + Sync {
    async fn renew_lease(&self) -> Result<(), BrokerError>;
}

/// Connection bookkeeping used by lease renewal and retention.
pub trait Connectable {
    fn connection(&self) -> ConnectionState;

    /// When the first successful connection completed.
    fn connected_at(&self) -> Option<Instant>;

    fn is_online(&self) -> bool {
        self.connection() == ConnectionState::Online
    }

    fn is_connecting(&self) -> bool {
        self.connection() == ConnectionState::Connecting
    }

    fn is_offline(&self) -> bool {
        self.connection() == ConnectionState::Offline
    }
}

/// Provisioning provenance of a node.
pub trait Provisionable {
    fn template_id(&self) -> &TemplateId;
    fn created_at(&self) -> Instant;
    fn vm(&self) -> &Arc<dyn VirtualMachine>;
}

/// A booted VM owned by the controller until torn down.
#[derive(Debug)]
pub struct LiveNode {
    id: NodeId,
    name: String,
    allocation: AllocationId,
    template: Arc<Template>,
    hardware: HardwareSpec,
    label: String,
    vm: Arc<dyn VirtualMachine>,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    evicting: AtomicBool,
    state: Mutex<NodeState>,
}

impl LiveNode {
    pub fn new(
        name: String,
        allocation: AllocationId,
        template: Arc<Template>,
        hardware: HardwareSpec,
        label: String,
        vm: Arc<dyn VirtualMachine>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: NodeId::new(),
            name,
            allocation,
            template,
            hardware,
            label,
            vm,
            created_at: now,
            created_wall: Utc::now(),
            evicting: AtomicBool::new(false),
            state: Mutex::new(NodeState {
                connection: ConnectionState::Connecting,
                connected_at: None,
                accepting_tasks: true,
                idle_since: now,
                busy: 0,
                // A fresh VM carries a fresh lease.
                last_renewed: now,
                builds: Vec::new(),
                terminated: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.allocation
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    pub fn hardware(&self) -> &HardwareSpec {
        &self.hardware
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wall-clock creation time, compared against clan wipes.
    pub fn created_wall(&self) -> DateTime<Utc> {
        self.created_wall
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Record a successful connection.
    pub fn mark_online(&self) {
        let mut state = self.state();
        let now = Instant::now();
        state.connection = ConnectionState::Online;
        if state.connected_at.is_none() {
            state.connected_at = Some(now);
        }
        if state.busy == 0 {
            state.idle_since = now;
        }
        debug!(node = %self.name, "node online");
    }

    /// Record a lost or failed connection.
    pub fn mark_offline(&self) {
        self.state().connection = ConnectionState::Offline;
        debug!(node = %self.name, "node offline");
    }

    // -------------------------------------------------------------------------
    // Task bookkeeping
    // -------------------------------------------------------------------------

    pub fn is_accepting_tasks(&self) -> bool {
        self.state().accepting_tasks
    }

    pub fn set_accepting_tasks(&self, accepting: bool) {
        self.state().accepting_tasks = accepting;
    }

    /// No task is running.
    pub fn is_idle(&self) -> bool {
        self.state().busy == 0
    }

    pub fn busy(&self) -> u32 {
        self.state().busy
    }

    pub fn idle_since(&self) -> Instant {
        self.state().idle_since
    }

    /// Idle start, never earlier than the first connection. None until the
    /// node has connected.
    pub fn idle_start_after_connect(&self) -> Option<Instant> {
        let state = self.state();
        state
            .connected_at
            .map(|connected| state.idle_since.max(connected))
    }

    /// An executor picked up a task.
    pub fn begin_task(&self) {
        self.state().busy += 1;
    }

    /// A task finished.
    pub fn finish_task(&self, record: Option<BuildRecord>) {
        let mut state = self.state();
        state.busy = state.busy.saturating_sub(1);
        if state.busy == 0 {
            state.idle_since = Instant::now();
        }
        if let Some(record) = record {
            state.builds.push(record);
        }
    }

    /// Abort running tasks. Returns how many were interrupted.
    pub fn interrupt_tasks(&self) -> u32 {
        let mut state = self.state();
        let interrupted = state.busy;
        state.busy = 0;
        if interrupted > 0 {
            state.idle_since = Instant::now();
        }
        interrupted
    }

    /// Finished tasks so far.
    pub fn builds(&self) -> Vec<BuildRecord> {
        self.state().builds.clone()
    }

    // -------------------------------------------------------------------------
    // Lease
    // -------------------------------------------------------------------------

    pub fn last_renewed(&self) -> Instant {
        self.state().last_renewed
    }

    pub fn unrenewed_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_renewed())
    }

    // -------------------------------------------------------------------------
    // Eviction and teardown
    // -------------------------------------------------------------------------

    /// Claim the eviction slot. False if an eviction is already running.
    pub fn begin_eviction(&self) -> bool {
        self.evicting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_eviction(&self) {
        self.evicting.store(false, Ordering::SeqCst);
    }

    pub fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::SeqCst)
    }

    /// Mark terminated. Returns false if it already was.
    pub fn mark_terminated(&self) -> bool {
        let mut state = self.state();
        if state.terminated {
            return false;
        }
        state.terminated = true;
        state.accepting_tasks = false;
        state.connection = ConnectionState::Offline;
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.state().terminated
    }
}

impl Connectable for LiveNode {
    fn connection(&self) -> ConnectionState {
        self.state().connection
    }

    fn connected_at(&self) -> Option<Instant> {
        self.state().connected_at
    }
}

impl Provisionable for LiveNode {
    fn template_id(&self) -> &TemplateId {
        &self.template.id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn vm(&self) -> &Arc<dyn VirtualMachine> {
        &self.vm
    }
}

#[async_trait]
impl Leasable for LiveNode {
    async fn renew_lease(&self) -> Result<(), BrokerError> {
        self.vm.renew().await?;
        self.state().last_renewed = Instant::now();
        debug!(node = %self.name, vm = %self.vm.url(), "Renewed lease");
        Ok(())
    }
}

/// All live nodes.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: RwLock<HashMap<NodeId, Arc<LiveNode>>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: Arc<LiveNode>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id(), node);
    }

    pub fn remove(&self, id: NodeId) -> Option<Arc<LiveNode>> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<LiveNode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Snapshot of all nodes, oldest first.
    pub fn all(&self) -> Vec<Arc<LiveNode>> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.created_at());
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
