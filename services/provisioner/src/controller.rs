//! The provisioning controller.
//!
//! [`Provisioner`] owns the shared state (backoff counters, quota problems,
//! allocation registry, live nodes) and wires the collaborators into the
//! components that need them. The demand source calls
//! [`Provisioner::provision`]; operators use the dismiss, retry, clan and
//! quota actions and [`Provisioner::status`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mansion_id::{AllocationId, NodeId, TemplateId};
use mansion_throttle::{
    BackoffPolicy, BackoffRegistry, HardwareSpec, QuotaProblem, QuotaTracker,
    DEFAULT_TOO_MANY_VMS_SWEEP,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::allocation::{Allocation, AllocationContext, ConnectConfig, FaultSwitch, PendingNode};
use crate::broker::Broker;
use crate::clan::ClanStore;
use crate::configure::Configurator;
use crate::connector::Connector;
use crate::dispatch::{SchedulingLock, TaskDispatcher};
use crate::lease::{LeaseConfig, LeaseRenewalDaemon};
use crate::node::{LiveNode, NodeTable};
use crate::registry::{AllocationRegistry, RegistryConfig};
use crate::retention::{RetentionConfig, RetentionController};
use crate::status::ProvisionerStatus;
use crate::teardown::NodeReaper;
use crate::template::{size_in_label, CatalogLabelResolver, LabelResolver, Template, TemplateCatalog};

/// Tunables of the whole controller.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Root of persisted clan files.
    pub data_dir: PathBuf,
    pub backoff: BackoffPolicy,
    pub registry: RegistryConfig,
    pub connect: ConnectConfig,
    pub lease: LeaseConfig,
    pub retention: RetentionConfig,
    /// Period of the too-many-VMs sweep.
    pub quota_sweep: Duration,
}

impl ProvisionerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backoff: BackoffPolicy::default(),
            registry: RegistryConfig::default(),
            connect: ConnectConfig::default(),
            lease: LeaseConfig::default(),
            retention: RetentionConfig::default(),
            quota_sweep: DEFAULT_TOO_MANY_VMS_SWEEP,
        }
    }
}

/// Why provisioning is currently refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blockage {
    UnknownTemplate(TemplateId),
    Disabled(TemplateId),
    BackoffInEffect { template: TemplateId, until: Instant },
    QuotaBlocked(QuotaProblem),
}

impl fmt::Display for Blockage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTemplate(id) => write!(f, "unknown template {id}"),
            Self::Disabled(id) => write!(f, "template {id} is disabled"),
            Self::BackoffInEffect { template, until } => {
                let remaining = until.saturating_duration_since(Instant::now());
                write!(f, "backing off {template} for {}s", remaining.as_secs())
            }
            Self::QuotaBlocked(problem) => f.write_str(&problem.display_message()),
        }
    }
}

pub struct Provisioner {
    config: ProvisionerConfig,
    catalog: Arc<TemplateCatalog>,
    resolver: Arc<dyn LabelResolver>,
    backoff: Arc<BackoffRegistry>,
    quota: Arc<QuotaTracker>,
    registry: Arc<AllocationRegistry>,
    nodes: Arc<NodeTable>,
    clans: Arc<ClanStore>,
    reaper: Arc<NodeReaper>,
    retention: Arc<RetentionController>,
    dispatcher: Arc<TaskDispatcher>,
    context: AllocationContext,
}

impl Provisioner {
    pub fn new(
        config: ProvisionerConfig,
        catalog: Arc<TemplateCatalog>,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let backoff = Arc::new(BackoffRegistry::new(config.backoff));
        let quota = Arc::new(QuotaTracker::new());
        let registry = Arc::new(AllocationRegistry::new(config.registry, Arc::clone(&backoff)));
        let nodes = Arc::new(NodeTable::new());
        let clans = Arc::new(ClanStore::new(&config.data_dir, Arc::clone(&broker)));
        let lock = Arc::new(SchedulingLock::new());
        let reaper = Arc::new(NodeReaper::new(
            Arc::clone(&nodes),
            Arc::clone(&registry),
            Arc::clone(&quota),
            Arc::clone(&clans),
        ));
        let retention = Arc::new(RetentionController::new(
            config.retention,
            Arc::clone(&nodes),
            Arc::clone(&lock),
            Arc::clone(&reaper),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            lock,
            Arc::clone(&nodes),
            Arc::clone(&retention),
        ));
        let context = AllocationContext {
            broker,
            connector,
            backoff: Arc::clone(&backoff),
            quota: Arc::clone(&quota),
            clans: Arc::clone(&clans),
            registry: Arc::clone(&registry),
            nodes: Arc::clone(&nodes),
            reaper: Arc::clone(&reaper),
            configurators: Arc::new(Vec::new()),
            connect: config.connect,
            faults: FaultSwitch::default(),
        };

        Self {
            resolver: Arc::new(CatalogLabelResolver::new(Arc::clone(&catalog))),
            config,
            catalog,
            backoff,
            quota,
            registry,
            nodes,
            clans,
            reaper,
            retention,
            dispatcher,
            context,
        }
    }

    /// Append a configurator; they run in registration order.
    pub fn with_configurator(mut self, configurator: Arc<dyn Configurator>) -> Self {
        Arc::make_mut(&mut self.context.configurators).push(configurator);
        self
    }

    /// Replace the catalog-backed label resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn LabelResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Whether `template` may provision `hardware` right now.
    pub fn can_provision(
        &self,
        template: &TemplateId,
        hardware: &HardwareSpec,
    ) -> Result<Arc<Template>, Blockage> {
        let Some(t) = self.catalog.get(template) else {
            return Err(Blockage::UnknownTemplate(template.clone()));
        };
        if !t.is_enabled() {
            return Err(Blockage::Disabled(template.clone()));
        }
        let counter = self.backoff.get_or_create(template);
        if counter.is_backoff_in_effect() {
            if let Some(until) = counter.next_attempt() {
                return Err(Blockage::BackoffInEffect {
                    template: template.clone(),
                    until,
                });
            }
        }
        if let Some(problem) = self.quota.blocking_problem(hardware, &t.mansion_type) {
            return Err(Blockage::QuotaBlocked(problem));
        }
        Ok(t)
    }

    /// Start `excess_workload` allocations of `template`.
    ///
    /// The size comes from a size atom in `label`, else the template default.
    /// Returns no handles when provisioning is blocked.
    pub fn provision(
        &self,
        template: &TemplateId,
        label: Option<&str>,
        excess_workload: usize,
    ) -> Vec<PendingNode> {
        let size = match (size_in_label(label), self.catalog.get(template)) {
            (Some(size), _) => size,
            (None, Some(t)) => t.default_size,
            (None, None) => Default::default(),
        };
        let hardware = size.to_spec();

        let t = match self.can_provision(template, &hardware) {
            Ok(t) => t,
            Err(blockage) => {
                debug!(template = %template, %blockage, "not provisioning");
                return Vec::new();
            }
        };

        info!(
            template = %template,
            size = %size,
            count = excess_workload,
            "Provisioning"
        );

        (0..excess_workload)
            .map(|_| {
                let allocation = Arc::new(Allocation::new(
                    Arc::clone(&t),
                    hardware.clone(),
                    t.node_label(size),
                ));
                self.registry.on_started(Arc::clone(&allocation));
                allocation.spawn(self.context.clone())
            })
            .collect()
    }

    /// Resolve `label` to a template and provision from it.
    pub fn provision_label(&self, label: Option<&str>, excess_workload: usize) -> Vec<PendingNode> {
        let Some(resolution) = self.resolver.resolve(label) else {
            debug!(label = label.unwrap_or(""), "no template matches label");
            return Vec::new();
        };
        let size_label = resolution.size.as_str();
        self.provision(&resolution.template.id, Some(size_label), excess_workload)
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Hide a failed allocation. Does not cancel work.
    pub fn dismiss(&self, id: AllocationId) -> bool {
        self.registry.dismiss(id)
    }

    /// Lift the backoff of `template`.
    pub fn retry_now(&self, template: &TemplateId) {
        info!(template = %template, "Clearing backoff");
        self.backoff.get_or_create(template).clear();
    }

    /// Dispose every persisted snapshot of `template`.
    pub async fn dispose_clan(&self, template: &TemplateId) -> anyhow::Result<()> {
        let clan = self.clans.clan(template);
        let mut clan = clan.lock().await;
        clan.dispose_all().await
    }

    /// Clear every quota problem.
    pub fn clear_quota_problems(&self) {
        info!("Clearing quota problems");
        self.quota.clear_all();
    }

    /// A node lost its connection.
    pub fn on_node_offline(&self, node: NodeId) {
        if let Some(node) = self.nodes.get(node) {
            node.mark_offline();
        }
        self.quota.clear_too_many_vms();
    }

    /// Tear a node down now.
    pub async fn terminate(&self, node: NodeId) -> bool {
        match self.nodes.get(node) {
            Some(node) => self.reaper.terminate(&node, "requested").await,
            None => false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<TemplateCatalog> {
        &self.catalog
    }

    pub fn backoff(&self) -> &Arc<BackoffRegistry> {
        &self.backoff
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn registry(&self) -> &Arc<AllocationRegistry> {
        &self.registry
    }

    pub fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<LiveNode>> {
        self.nodes.get(id)
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn retention(&self) -> &Arc<RetentionController> {
        &self.retention
    }

    /// Fault switch shared by all allocations.
    pub fn faults(&self) -> &FaultSwitch {
        &self.context.faults
    }

    pub fn status(&self) -> ProvisionerStatus {
        ProvisionerStatus::collect(self)
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    pub fn lease_daemon(&self) -> LeaseRenewalDaemon {
        LeaseRenewalDaemon::new(
            self.config.lease,
            Arc::clone(&self.nodes),
            Arc::clone(&self.registry),
            Arc::clone(&self.reaper),
        )
    }

    /// Clear too-many-VMs problems every `quota_sweep`.
    #[instrument(skip(self, shutdown))]
    pub async fn run_quota_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.quota_sweep.as_secs(),
            "Starting quota sweeper"
        );

        let mut interval = tokio::time::interval(self.config.quota_sweep);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.quota.clear_too_many_vms();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Quota sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
