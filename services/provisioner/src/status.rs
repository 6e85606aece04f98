//! Operator status view.

use chrono::{DateTime, Utc};
use mansion_id::{AllocationId, NodeId, TemplateId};
use mansion_throttle::{BackoffSnapshot, QuotaScope};
use serde::Serialize;
use tokio::time::Instant;

use crate::allocation::AllocationStatus;
use crate::controller::Provisioner;
use crate::node::{Connectable, ConnectionState, Provisionable};

#[derive(Debug, Clone, Serialize)]
pub struct AllocationView {
    pub id: AllocationId,
    pub template: TemplateId,
    pub display_name: String,
    pub status: AllocationStatus,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
    pub problem: Option<String>,
    pub reason: Option<&'static str>,
    pub dismissed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaProblemView {
    #[serde(flatten)]
    pub scope: QuotaScope,
    pub message: String,
    pub too_many_vms: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub name: String,
    pub template: TemplateId,
    pub label: String,
    pub connection: ConnectionState,
    pub accepting_tasks: bool,
    pub busy: u32,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the controller for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionerStatus {
    pub allocations: Vec<AllocationView>,
    pub quota_problems: Vec<QuotaProblemView>,
    pub backoff: Vec<BackoffSnapshot>,
    pub nodes: Vec<NodeView>,
    pub in_provisioning: usize,
    pub last_error: Option<String>,
}

impl ProvisionerStatus {
    pub fn collect(provisioner: &Provisioner) -> Self {
        let now = Instant::now();
        let registry = provisioner.registry();
        registry.update_at(now);

        let allocations = registry
            .snapshot()
            .iter()
            .map(|a| {
                let problem = a.problem();
                AllocationView {
                    id: a.id(),
                    template: a.template().id.clone(),
                    display_name: a.display_name(),
                    status: a.status(),
                    started_at: a.started_wall(),
                    age_secs: now.saturating_duration_since(a.started_at()).as_secs(),
                    reason: problem.as_ref().map(|p| p.reason_code()),
                    problem: problem.map(|p| p.to_string()),
                    dismissed: a.is_dismissed(),
                }
            })
            .collect();

        let quota_problems = provisioner
            .quota()
            .problems()
            .into_iter()
            .map(|p| QuotaProblemView {
                message: p.display_message(),
                scope: p.scope,
                too_many_vms: p.too_many_vms,
            })
            .collect();

        let nodes = provisioner
            .nodes()
            .all()
            .iter()
            .map(|n| NodeView {
                id: n.id(),
                name: n.name().to_string(),
                template: n.template_id().clone(),
                label: n.label().to_string(),
                connection: n.connection(),
                accepting_tasks: n.is_accepting_tasks(),
                busy: n.busy(),
                created_at: n.created_wall(),
            })
            .collect();

        Self {
            allocations,
            quota_problems,
            backoff: provisioner.backoff().snapshot(),
            nodes,
            in_provisioning: registry.in_provisioning_count(),
            last_error: registry.last_problem(),
        }
    }
}
