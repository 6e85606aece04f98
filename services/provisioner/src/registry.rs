//! In-flight and recently finished allocations.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use mansion_id::{AllocationId, NodeId};
use mansion_throttle::BackoffRegistry;
use tokio::time::Instant;
use tracing::debug;

use crate::allocation::Allocation;

/// Default time a failure stays visible.
pub const DEFAULT_PROBLEM_RETENTION: Duration = Duration::from_secs(4 * 60 * 60); // 4 hours

/// Default number of failures kept.
pub const DEFAULT_FAILURE_CAP: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub problem_retention: Duration,
    pub failure_cap: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            problem_retention: DEFAULT_PROBLEM_RETENTION,
            failure_cap: DEFAULT_FAILURE_CAP,
        }
    }
}

/// Duplicate-free set of allocations worth showing.
///
/// Pruning runs on every status change; the failure cap is applied then,
/// not on insert.
#[derive(Debug)]
pub struct AllocationRegistry {
    config: RegistryConfig,
    backoff: Arc<BackoffRegistry>,
    entries: RwLock<Vec<Arc<Allocation>>>,
}

impl AllocationRegistry {
    pub fn new(config: RegistryConfig, backoff: Arc<BackoffRegistry>) -> Self {
        Self {
            config,
            backoff,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    pub fn on_started(&self, allocation: Arc<Allocation>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.iter().any(|a| a.id() == allocation.id()) {
            entries.push(allocation);
        }
    }

    /// Drop entries that are no longer noteworthy, then keep only the newest
    /// `failure_cap` failures.
    pub fn update(&self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&self, now: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|a| a.is_noteworthy_at(now, self.config.problem_retention));

        let mut failures: Vec<_> = entries
            .iter()
            .filter(|a| a.problem().is_some() && !a.is_dismissed())
            .map(|a| (a.finished_at(), a.id()))
            .collect();
        if failures.len() > self.config.failure_cap {
            failures.sort();
            let excess = failures.len() - self.config.failure_cap;
            let evicted: Vec<AllocationId> =
                failures.iter().take(excess).map(|(_, id)| *id).collect();
            entries.retain(|a| !evicted.contains(&a.id()));
        }

        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "pruned allocations");
        }
    }

    pub fn find(&self, id: AllocationId) -> Option<Arc<Allocation>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.id() == id)
            .cloned()
    }

    pub fn find_by_node(&self, node: NodeId) -> Option<Arc<Allocation>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.resulting_node() == Some(node))
            .cloned()
    }

    /// Hide a failed allocation. Returns false if unknown.
    pub fn dismiss(&self, id: AllocationId) -> bool {
        let Some(allocation) = self.find(id) else {
            return false;
        };
        allocation.dismiss();
        self.update();
        true
    }

    /// The node of an allocation connected for the first time.
    pub fn on_node_online(&self, node: NodeId) {
        let Some(allocation) = self.find_by_node(node) else {
            return;
        };
        if allocation.on_online() {
            self.backoff.get_or_create(&allocation.template().id).clear();
            self.update();
        }
    }

    /// The node of an allocation was torn down.
    pub fn on_node_terminated(&self, node: NodeId) {
        if let Some(allocation) = self.find_by_node(node) {
            allocation.on_terminate();
            self.update();
        }
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Allocation>> {
        let mut entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        entries.sort_by_key(|a| a.started_at());
        entries
    }

    /// Entries still provisioning without a problem.
    pub fn in_provisioning_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| a.problem().is_none())
            .count()
    }

    /// Message of the most recent visible failure.
    pub fn last_problem(&self) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| !a.is_dismissed())
            .filter_map(|a| Some((a.finished_at()?, a.problem()?)))
            .max_by_key(|(finished, _)| *finished)
            .map(|(_, problem)| problem.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::error::ProvisionError;
    use crate::template::{HardwareSize, TemplateCatalog};
    use mansion_throttle::BackoffPolicy;

    fn registry(cap: usize) -> AllocationRegistry {
        AllocationRegistry::new(
            RegistryConfig {
                problem_retention: DEFAULT_PROBLEM_RETENTION,
                failure_cap: cap,
            },
            Arc::new(BackoffRegistry::new(BackoffPolicy::default())),
        )
    }

    fn allocation() -> Arc<Allocation> {
        let catalog =
            TemplateCatalog::from_json(r#"[{"id": "small", "mansion_type": "linux"}]"#).unwrap();
        let template = catalog.iter().next().unwrap().clone();
        Arc::new(Allocation::new(
            template,
            HardwareSize::Small.to_spec(),
            "small small".into(),
        ))
    }

    fn broker_failure() -> ProvisionError {
        ProvisionError::Broker(BrokerError::Transport("down".into()))
    }

    #[test]
    fn test_on_started_is_duplicate_free() {
        let registry = registry(8);
        let a = allocation();
        registry.on_started(a.clone());
        registry.on_started(a);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cap_keeps_newest() {
        let registry = registry(8);
        let mut ids = Vec::new();
        for _ in 0..10 {
            let a = allocation();
            registry.on_started(a.clone());
            a.fail(broker_failure());
            ids.push(a.id());
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        registry.update();

        let kept: Vec<_> = registry.snapshot().iter().map(|a| a.id()).collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_entries_are_not_capped() {
        let registry = registry(1);
        for _ in 0..3 {
            registry.on_started(allocation());
        }
        let failed = allocation();
        registry.on_started(failed.clone());
        failed.fail(broker_failure());

        registry.update();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.in_provisioning_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_expires_after_retention() {
        let registry = registry(8);
        let a = allocation();
        registry.on_started(a.clone());
        a.fail(broker_failure());

        registry.update();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.last_problem().as_deref(), Some("broker unreachable: down"));

        tokio::time::advance(DEFAULT_PROBLEM_RETENTION).await;
        registry.update();
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_hides_failure() {
        let registry = registry(8);
        let a = allocation();
        registry.on_started(a.clone());
        a.fail(broker_failure());

        assert!(registry.dismiss(a.id()));
        assert!(registry.is_empty());
        assert!(!registry.dismiss(a.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_online_clears_backoff_once() {
        let registry = registry(8);
        let a = allocation();
        registry.on_started(a.clone());
        let node = NodeId::new();
        a.attach_node(node);

        let counter = registry.backoff.get_or_create(&a.template().id);
        counter.record_error();

        registry.on_node_online(node);
        assert_eq!(counter.error_count(), 0);
        assert_eq!(a.status(), crate::allocation::AllocationStatus::Online);
        assert!(registry.is_empty());

        counter.record_error();
        registry.on_node_online(node);
        assert_eq!(counter.error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_failure_stays_until_terminated() {
        let registry = registry(8);
        let a = allocation();
        registry.on_started(a.clone());
        let node = NodeId::new();
        a.attach_node(node);
        a.fail(broker_failure());
        a.dismiss();

        registry.update();
        assert_eq!(registry.len(), 1);

        registry.on_node_terminated(node);
        assert!(registry.is_empty());
    }
}
