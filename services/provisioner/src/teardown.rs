//! Node teardown.

use std::sync::Arc;

use mansion_throttle::QuotaTracker;
use serde_json::json;
use tracing::{info, warn};

use crate::clan::ClanStore;
use crate::node::{BuildRecord, LiveNode, NodeTable, Provisionable};
use crate::registry::AllocationRegistry;

/// Billing memo posted to a VM before it is disposed.
pub fn billing_memo(builds: &[BuildRecord]) -> serde_json::Value {
    json!({ "builds": builds })
}

/// Tears nodes down. Idempotent; every step is best effort.
pub struct NodeReaper {
    nodes: Arc<NodeTable>,
    registry: Arc<AllocationRegistry>,
    quota: Arc<QuotaTracker>,
    clans: Arc<ClanStore>,
}

impl NodeReaper {
    pub fn new(
        nodes: Arc<NodeTable>,
        registry: Arc<AllocationRegistry>,
        quota: Arc<QuotaTracker>,
        clans: Arc<ClanStore>,
    ) -> Self {
        Self {
            nodes,
            registry,
            quota,
            clans,
        }
    }

    /// Terminate `node`: forget it, detach its allocation, record its
    /// persistent file systems, post the billing memo and dispose the VM.
    ///
    /// Returns false if the node was already terminated.
    pub async fn terminate(&self, node: &LiveNode, reason: &str) -> bool {
        if !self.detach(node, reason) {
            return false;
        }
        self.release(node).await;
        true
    }

    /// Synchronous half of teardown: after this no task can be assigned to
    /// the node. Returns false if the node was already terminated.
    pub fn detach(&self, node: &LiveNode, reason: &str) -> bool {
        if !node.mark_terminated() {
            return false;
        }
        info!(node = %node.name(), vm = %node.vm().url(), reason, "Terminating node");

        self.nodes.remove(node.id());
        self.registry.on_node_terminated(node.id());
        self.quota.clear_too_many_vms();
        true
    }

    /// Broker half of teardown, for a detached node.
    pub async fn release(&self, node: &LiveNode) {
        let template = node.template();
        if !template.persistent_paths.is_empty() {
            match node.vm().state().await {
                Ok(state) => {
                    let clan = self.clans.clan(&template.id);
                    clan.lock()
                        .await
                        .update(&template.persistent_paths, &state, node.created_wall())
                        .await;
                }
                Err(e) => {
                    warn!(node = %node.name(), error = %e, "Failed to read VM state for clan update");
                }
            }
        }

        let builds = node.builds();
        if !builds.is_empty() {
            if let Err(e) = node.vm().set_memo(&billing_memo(&builds)).await {
                warn!(node = %node.name(), error = %e, "Failed to set billing memo");
            }
        }

        if let Err(e) = node.vm().dispose().await {
            warn!(node = %node.name(), vm = %node.vm().url(), error = %e, "Failed to dispose VM");
        }
    }
}
