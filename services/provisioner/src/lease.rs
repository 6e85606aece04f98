//! Periodic lease renewal.
//!
//! The broker reclaims VMs whose lease is not renewed. Every period the
//! daemon renews connected and connecting nodes, then allocations that
//! already hold a VM. A node that has gone unrenewed past the stale ceiling
//! is torn down: the broker has given it up by then.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::node::{Connectable, Leasable, NodeTable, Provisionable};
use crate::registry::AllocationRegistry;
use crate::teardown::NodeReaper;

/// Default renewal period.
pub const DEFAULT_LEASE_PERIOD: Duration = Duration::from_secs(30);

/// Default stale ceiling.
pub const DEFAULT_LEASE_STALE_AFTER: Duration = Duration::from_secs(30 * 60); // 30 minutes

#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub period: Duration,
    pub stale_after: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_LEASE_PERIOD,
            stale_after: DEFAULT_LEASE_STALE_AFTER,
        }
    }
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub renewed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub terminated: usize,
}

pub struct LeaseRenewalDaemon {
    config: LeaseConfig,
    nodes: Arc<NodeTable>,
    registry: Arc<AllocationRegistry>,
    reaper: Arc<NodeReaper>,
}

impl LeaseRenewalDaemon {
    pub fn new(
        config: LeaseConfig,
        nodes: Arc<NodeTable>,
        registry: Arc<AllocationRegistry>,
        reaper: Arc<NodeReaper>,
    ) -> Self {
        Self {
            config,
            nodes,
            registry,
            reaper,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_secs = self.config.period.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Starting lease renewal daemon"
        );

        let mut interval = tokio::time::interval(self.config.period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.sweep().await;
                    debug!(?stats, "lease sweep complete");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Lease renewal daemon shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Renew every lease once.
    pub async fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        for node in self.nodes.all() {
            if !(node.is_connecting() || node.is_online()) {
                warn!(node = %node.name(), vm = %node.vm().url(), "Not renewing because it appears to be offline");
                stats.skipped += 1;
                continue;
            }
            match node.renew_lease().await {
                Ok(()) => stats.renewed += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(node = %node.name(), vm = %node.vm().url(), error = %e, "Failed to renew the lease");
                    let unrenewed = node.unrenewed_for(Instant::now());
                    if unrenewed > self.config.stale_after {
                        warn!(
                            node = %node.name(),
                            unrenewed_secs = unrenewed.as_secs(),
                            "Lease not renewed for too long, giving the node up"
                        );
                        if self.reaper.terminate(&node, "lease expired").await {
                            stats.terminated += 1;
                        }
                    }
                }
            }
        }

        for allocation in self.registry.snapshot() {
            // Allocations with a node are renewed through it.
            if allocation.is_provisioning()
                || allocation.problem().is_some()
                || allocation.resulting_node().is_some()
            {
                continue;
            }
            match allocation.renew_lease().await {
                Ok(()) => stats.renewed += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(allocation_id = %allocation.id(), error = %e, "Failed to renew the lease");
                }
            }
        }

        self.registry.update();
        stats
    }
}
