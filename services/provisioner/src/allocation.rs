//! One provisioning attempt, from broker request to connected node.
//!
//! ```text
//! Requesting -> Allocated -> Configuring -> Booting -> Connecting -> Online
//!      \            \             \            \            \
//!       +------------+-------------+------------+------------+--> Failed
//! ```
//!
//! Every allocation runs in its own task. A failure at any step marks the
//! allocation failed, records exactly one backoff error for the template,
//! and keeps the problem visible for the retention window unless dismissed.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mansion_id::{AllocationId, NodeId};
use mansion_throttle::{BackoffRegistry, HardwareSpec, QuotaTracker};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, VirtualMachine, VmRequest, VmSpec};
use crate::clan::ClanStore;
use crate::configure::Configurator;
use crate::connector::Connector;
use crate::error::ProvisionError;
use crate::node::{Leasable, LiveNode, NodeTable, Provisionable};
use crate::registry::AllocationRegistry;
use crate::teardown::NodeReaper;
use crate::template::{massage_id, Template};

/// Default number of connection attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default pause between connection attempts.
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connection retry settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectConfig {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
        }
    }
}

/// Allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Requesting,
    Allocated,
    Configuring,
    Booting,
    Connecting,
    Online,
    Failed,
}

impl AllocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Online | Self::Failed)
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requesting => "Requesting",
            Self::Allocated => "Allocated",
            Self::Configuring => "Configuring",
            Self::Booting => "Booting",
            Self::Connecting => "Connecting",
            Self::Online => "Online",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Debug switch that fails allocations right before boot.
///
/// Only armable in unit tests or with the `fault-injection` feature.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    #[cfg(any(test, feature = "fault-injection"))]
    armed: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(any(test, feature = "fault-injection"))]
impl FaultSwitch {
    /// Fail the next allocation that reaches boot.
    pub fn arm(&self) {
        self.armed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.armed.swap(false, std::sync::atomic::Ordering::SeqCst)
    }
}

/// Collaborators an allocation needs while it runs.
#[derive(Clone)]
pub struct AllocationContext {
    pub broker: Arc<dyn Broker>,
    pub connector: Arc<dyn Connector>,
    pub backoff: Arc<BackoffRegistry>,
    pub quota: Arc<QuotaTracker>,
    pub clans: Arc<ClanStore>,
    pub registry: Arc<AllocationRegistry>,
    pub nodes: Arc<NodeTable>,
    pub reaper: Arc<NodeReaper>,
    /// Run in order for every VM.
    pub configurators: Arc<Vec<Arc<dyn Configurator>>>,
    pub connect: ConnectConfig,
    pub faults: FaultSwitch,
}

/// What a cancelled allocation leaves behind.
enum Leftover {
    Vm(Arc<dyn VirtualMachine>),
    Node(NodeId),
}

#[derive(Debug)]
struct AllocationState {
    status: AllocationStatus,
    vm: Option<Arc<dyn VirtualMachine>>,
    vm_name: Option<String>,
    finished_at: Option<Instant>,
    problem: Option<ProvisionError>,
    dismissed: bool,
    resulting_node: Option<NodeId>,
}

/// One provisioning attempt.
#[derive(Debug)]
pub struct Allocation {
    id: AllocationId,
    template: Arc<Template>,
    hardware: HardwareSpec,
    label: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    state: Mutex<AllocationState>,
}

impl Allocation {
    pub fn new(template: Arc<Template>, hardware: HardwareSpec, label: String) -> Self {
        Self {
            id: AllocationId::new(),
            template,
            hardware,
            label,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            state: Mutex::new(AllocationState {
                status: AllocationStatus::Requesting,
                vm: None,
                vm_name: None,
                finished_at: None,
                problem: None,
                dismissed: false,
                resulting_node: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AllocationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    pub fn hardware(&self) -> &HardwareSpec {
        &self.hardware
    }

    /// Label the resulting node carries.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn started_wall(&self) -> DateTime<Utc> {
        self.started_wall
    }

    pub fn status(&self) -> AllocationStatus {
        self.state().status
    }

    pub fn vm(&self) -> Option<Arc<dyn VirtualMachine>> {
        self.state().vm.clone()
    }

    /// Node name once a VM is assigned, the template name before.
    pub fn display_name(&self) -> String {
        self.state()
            .vm_name
            .clone()
            .unwrap_or_else(|| self.template.display_name.clone())
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.state().finished_at
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at().is_some()
    }

    pub fn problem(&self) -> Option<ProvisionError> {
        self.state().problem.clone()
    }

    pub fn is_dismissed(&self) -> bool {
        self.state().dismissed
    }

    pub fn resulting_node(&self) -> Option<NodeId> {
        self.state().resulting_node
    }

    /// Still waiting for the broker to hand out a VM.
    pub fn is_provisioning(&self) -> bool {
        let state = self.state();
        state.finished_at.is_none() && state.vm.is_none()
    }

    /// Whether this allocation belongs in the operator view at `now`.
    pub fn is_noteworthy_at(&self, now: Instant, problem_retention: Duration) -> bool {
        let state = self.state();
        let Some(finished_at) = state.finished_at else {
            return true;
        };
        if state.problem.is_some() && !state.dismissed && now < finished_at + problem_retention {
            return true;
        }
        state.resulting_node.is_some()
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn set_status(&self, status: AllocationStatus) {
        self.state().status = status;
        debug!(allocation_id = %self.id, template = %self.template.id, %status, "allocation status");
    }

    fn on_allocated(&self, vm: Arc<dyn VirtualMachine>) {
        let name = massage_id(vm.id());
        info!(
            allocation_id = %self.id,
            template = %self.template.id,
            vm = %vm.url(),
            node = %name,
            "Allocated"
        );
        let mut state = self.state();
        state.vm = Some(vm);
        state.vm_name = Some(name);
        state.status = AllocationStatus::Allocated;
    }

    pub(crate) fn attach_node(&self, node: NodeId) {
        let mut state = self.state();
        state.resulting_node = Some(node);
        state.status = AllocationStatus::Connecting;
    }

    /// First connection of the resulting node. Returns false if the
    /// allocation had already left `Connecting`.
    pub(crate) fn on_online(&self) -> bool {
        let mut state = self.state();
        if state.status != AllocationStatus::Connecting {
            return false;
        }
        state.status = AllocationStatus::Online;
        state.finished_at = Some(Instant::now());
        state.resulting_node = None;
        info!(allocation_id = %self.id, template = %self.template.id, "Online");
        true
    }

    /// The resulting node was torn down.
    pub(crate) fn on_terminate(&self) {
        self.state().resulting_node = None;
    }

    /// Record a terminal failure. Returns false if already finished.
    pub(crate) fn fail(&self, problem: ProvisionError) -> bool {
        let mut state = self.state();
        if state.finished_at.is_some() {
            return false;
        }
        state.status = AllocationStatus::Failed;
        state.finished_at = Some(Instant::now());
        state.problem = Some(problem);
        true
    }

    /// Hide a failure from the operator view. Does not stop work.
    pub fn dismiss(&self) {
        self.state().dismissed = true;
    }

    /// Mark cancelled and dismissed. Returns the node or bare VM the
    /// aborted task left behind, for the caller to tear down.
    fn on_cancelled(&self) -> Option<Leftover> {
        if !self.fail(ProvisionError::Cancelled) {
            return None;
        }
        let mut state = self.state();
        state.dismissed = true;
        match state.resulting_node {
            Some(node) => Some(Leftover::Node(node)),
            None => state.vm.clone().map(Leftover::Vm),
        }
    }

    fn record_failure(&self, ctx: &AllocationContext, problem: ProvisionError) {
        if !self.fail(problem.clone()) {
            return;
        }
        error!(
            allocation_id = %self.id,
            template = %self.template.id,
            reason = problem.reason_code(),
            error = %problem,
            "Provisioning failed"
        );
        if let Some(quota) = problem.quota_problem() {
            ctx.quota.record(quota);
        }
        if problem.counts_as_error() {
            ctx.backoff.get_or_create(&self.template.id).record_error();
        }
        ctx.registry.update();
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Start the allocation task.
    pub fn spawn(self: &Arc<Self>, ctx: AllocationContext) -> PendingNode {
        let (tx, rx) = oneshot::channel();
        let registry = Arc::clone(&ctx.registry);
        let nodes = Arc::clone(&ctx.nodes);
        let reaper = Arc::clone(&ctx.reaper);
        let allocation = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let outcome = match allocation.run(&ctx).await {
                Ok(node) => Ok(node.id()),
                Err(problem) => {
                    allocation.record_failure(&ctx, problem.clone());
                    Err(problem)
                }
            };
            let _ = tx.send(outcome);
        });

        PendingNode {
            allocation: Arc::clone(self),
            registry,
            nodes,
            reaper,
            result: rx,
            abort: handle.abort_handle(),
        }
    }

    async fn run(&self, ctx: &AllocationContext) -> Result<Arc<LiveNode>, ProvisionError> {
        let request = VmRequest {
            mansion_type: self.template.mansion_type.clone(),
            hardware: self.hardware.clone(),
            account: self.template.account.clone(),
        };
        info!(
            allocation_id = %self.id,
            template = %self.template.id,
            size = %self.hardware.size,
            "Requesting VM"
        );
        let vm = ctx.broker.create_virtual_machine(&request).await?;
        self.on_allocated(Arc::clone(&vm));
        ctx.registry.update();

        if let Err(problem) = self.prepare(ctx, &vm).await {
            if let Err(e) = vm.dispose().await {
                warn!(vm = %vm.url(), error = %e, "Failed to dispose VM of failed allocation");
            }
            return Err(problem);
        }

        let node = Arc::new(LiveNode::new(
            self.display_name(),
            self.id,
            Arc::clone(&self.template),
            self.hardware.clone(),
            self.label.clone(),
            vm,
        ));
        ctx.nodes.insert(Arc::clone(&node));
        self.attach_node(node.id());
        ctx.registry.update();

        self.connect(ctx, &node).await?;
        node.mark_online();
        ctx.registry.on_node_online(node.id());
        Ok(node)
    }

    /// Configure and boot.
    async fn prepare(
        &self,
        ctx: &AllocationContext,
        vm: &Arc<dyn VirtualMachine>,
    ) -> Result<(), ProvisionError> {
        self.set_status(AllocationStatus::Configuring);

        let mut spec = VmSpec::default();
        for configurator in ctx.configurators.iter() {
            configurator
                .configure(&self.template, &self.hardware, &mut spec)
                .map_err(|e| ProvisionError::Configurator {
                    name: configurator.name().to_string(),
                    message: format!("{e:#}"),
                })?;
        }
        self.template.populate(&mut spec);

        let clan = ctx.clans.clan(&self.template.id);
        let mut with_snapshots = spec.clone();
        let applied = clan.lock().await.apply_to(&mut with_snapshots, vm.host());
        debug!(allocation_id = %self.id, applied, "applied clan lineages");

        match vm.setup(&with_snapshots).await {
            Ok(()) => {}
            Err(BrokerError::Configuration(msg)) => {
                warn!(
                    allocation_id = %self.id,
                    vm = %vm.url(),
                    error = %msg,
                    "Couldn't set up VM with snapshots, retrying with originals"
                );
                vm.setup(&spec).await.map_err(|e| match e {
                    BrokerError::Configuration(msg) => ProvisionError::Configuration(msg),
                    other => ProvisionError::Broker(other),
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        #[cfg(any(test, feature = "fault-injection"))]
        if ctx.faults.take() {
            return Err(ProvisionError::InjectedFault);
        }

        self.set_status(AllocationStatus::Booting);
        vm.boot().await?;
        info!(allocation_id = %self.id, vm = %vm.url(), "Booted");
        Ok(())
    }

    /// Attach the booted VM, retrying I/O failures only.
    async fn connect(&self, ctx: &AllocationContext, node: &LiveNode) -> Result<(), ProvisionError> {
        let attempts = ctx.connect.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match ctx.connector.connect(&**node.vm()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(
                        allocation_id = %self.id,
                        node = %node.name(),
                        attempt,
                        error = %e,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(ctx.connect.retry_delay).await;
                }
                Err(e) => {
                    node.mark_offline();
                    return Err(ProvisionError::Connect {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Leasable for Allocation {
    async fn renew_lease(&self) -> Result<(), BrokerError> {
        let vm = {
            let state = self.state();
            if state.problem.is_some() {
                return Ok(());
            }
            state.vm.clone()
        };
        if let Some(vm) = vm {
            vm.renew().await?;
            debug!(allocation_id = %self.id, vm = %vm.url(), "Renewed lease");
        }
        Ok(())
    }
}

/// Handle given to the demand source for one allocation.
///
/// Resolves once, when the node is online or the allocation failed.
pub struct PendingNode {
    allocation: Arc<Allocation>,
    registry: Arc<AllocationRegistry>,
    nodes: Arc<NodeTable>,
    reaper: Arc<NodeReaper>,
    result: oneshot::Receiver<Result<NodeId, ProvisionError>>,
    abort: AbortHandle,
}

impl fmt::Debug for PendingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingNode")
            .field("allocation", &self.allocation.id())
            .field("status", &self.allocation.status())
            .finish_non_exhaustive()
    }
}

impl PendingNode {
    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.allocation
    }

    pub fn id(&self) -> AllocationId {
        self.allocation.id()
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<NodeId, ProvisionError> {
        self.result.await.unwrap_or(Err(ProvisionError::Cancelled))
    }

    /// Abort the allocation. It is marked failed and dismissed without
    /// counting against the template's backoff.
    ///
    /// A node already created for it is detached at once and torn down in
    /// the background; a bare VM is disposed.
    pub fn cancel(self) {
        self.abort.abort();
        match self.allocation.on_cancelled() {
            Some(Leftover::Vm(vm)) => {
                info!(allocation_id = %self.allocation.id(), vm = %vm.url(), "Cancelled, releasing VM");
                tokio::spawn(async move {
                    if let Err(e) = vm.dispose().await {
                        warn!(vm = %vm.url(), error = %e, "Failed to dispose VM of cancelled allocation");
                    }
                });
            }
            Some(Leftover::Node(id)) => {
                if let Some(node) = self.nodes.get(id) {
                    info!(allocation_id = %self.allocation.id(), node = %node.name(), "Cancelled, tearing node down");
                    if self.reaper.detach(&node, "cancelled") {
                        let reaper = Arc::clone(&self.reaper);
                        tokio::spawn(async move { reaper.release(&node).await });
                    }
                }
            }
            None => {}
        }
        self.registry.update();
    }
}
