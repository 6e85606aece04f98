//! Idle eviction and the never-connected timeout.
//!
//! Idle eviction is check, wait, recheck:
//!
//! 1. the node looks idle past the timeout: stop accepting tasks;
//! 2. wait `recheck_delay` so an executor that raced the flag shows up;
//! 3. under the scheduling lock, if a task slipped in and the node is
//!    online, accept tasks again and abort; otherwise interrupt and kill.
//!
//! Nodes that never connect are killed directly once the connect grace
//! period is over.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::dispatch::SchedulingLock;
use crate::node::{Connectable, LiveNode, NodeTable, Provisionable};
use crate::teardown::NodeReaper;

/// Default idle timeout. Deployments usually raise it.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a node gets to connect.
pub const DEFAULT_CONNECT_GRACE: Duration = Duration::from_secs(2 * 60);

/// Default pause between marking a node unavailable and the recheck.
pub const DEFAULT_EVICTION_RECHECK: Duration = Duration::from_secs(2);

/// Default period of the retention sweep.
pub const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(60);

/// Extra wait on top of the idle timeout before the post-task recheck.
const POST_TASK_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    pub idle_timeout: Duration,
    pub connect_grace: Duration,
    pub recheck_delay: Duration,
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_grace: DEFAULT_CONNECT_GRACE,
            recheck_delay: DEFAULT_EVICTION_RECHECK,
            interval: DEFAULT_RETENTION_INTERVAL,
        }
    }
}

/// How an eviction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    Killed,
    /// A task arrived during the recheck window.
    Aborted,
}

/// Result of checking one node.
#[derive(Debug)]
pub enum RetentionDecision {
    Keep,
    KilledNeverConnected,
    Evicting(JoinHandle<EvictionOutcome>),
}

pub struct RetentionController {
    config: RetentionConfig,
    nodes: Arc<NodeTable>,
    lock: Arc<SchedulingLock>,
    reaper: Arc<NodeReaper>,
}

impl RetentionController {
    pub fn new(
        config: RetentionConfig,
        nodes: Arc<NodeTable>,
        lock: Arc<SchedulingLock>,
        reaper: Arc<NodeReaper>,
    ) -> Self {
        Self {
            config,
            nodes,
            lock,
            reaper,
        }
    }

    pub fn config(&self) -> RetentionConfig {
        self.config
    }

    fn should_have_connected(&self, node: &LiveNode, now: Instant) -> bool {
        now.saturating_duration_since(node.created_at()) > self.config.connect_grace
    }

    /// Offline, not connecting, still accepting, never connected, and past
    /// the grace period.
    pub fn is_never_connected(&self, node: &LiveNode, now: Instant) -> bool {
        node.is_offline()
            && !node.is_connecting()
            && node.is_accepting_tasks()
            && node.connected_at().is_none()
            && self.should_have_connected(node, now)
    }

    /// Idle past the timeout, counting from the later of idle start and
    /// first connection. Nodes that never connected do not qualify.
    pub fn is_idle_for_too_long(&self, node: &LiveNode, now: Instant) -> bool {
        node.is_idle()
            && node.idle_start_after_connect().is_some_and(|start| {
                now.saturating_duration_since(start) > self.config.idle_timeout
            })
    }

    /// Apply both policies to one node.
    pub async fn check(self: &Arc<Self>, node: &Arc<LiveNode>) -> RetentionDecision {
        if node.is_terminated() {
            return RetentionDecision::Keep;
        }
        let now = Instant::now();

        if self.is_never_connected(node, now) {
            info!(node = %node.name(), "Removing node because it should have connected by now");
            self.reaper.terminate(node, "never connected").await;
            return RetentionDecision::KilledNeverConnected;
        }

        if self.is_idle_for_too_long(node, now) {
            if let Some(handle) = self.evict(node) {
                return RetentionDecision::Evicting(handle);
            }
        }
        RetentionDecision::Keep
    }

    /// Check every live node.
    pub async fn check_all(self: &Arc<Self>) -> Vec<RetentionDecision> {
        let mut decisions = Vec::new();
        for node in self.nodes.all() {
            decisions.push(self.check(&node).await);
        }
        decisions
    }

    /// Start evicting `node`. None if an eviction is already running.
    pub fn evict(self: &Arc<Self>, node: &Arc<LiveNode>) -> Option<JoinHandle<EvictionOutcome>> {
        node.set_accepting_tasks(false);
        if !node.begin_eviction() {
            return None;
        }
        debug!(node = %node.name(), "taking idle node offline");

        let this = Arc::clone(self);
        let node = Arc::clone(node);
        Some(tokio::spawn(async move { this.finish_eviction(&node).await }))
    }

    async fn finish_eviction(&self, node: &LiveNode) -> EvictionOutcome {
        tokio::time::sleep(self.config.recheck_delay).await;

        {
            let _guard = self.lock.lock().await;
            if !node.is_idle() && node.is_online() {
                info!(node = %node.name(), "No longer idle, aborting termination");
                node.set_accepting_tasks(true);
                node.end_eviction();
                return EvictionOutcome::Aborted;
            }
            let interrupted = node.interrupt_tasks();
            if interrupted > 0 {
                debug!(node = %node.name(), interrupted, "interrupted tasks");
            }
            if !self.reaper.detach(node, "idle") {
                return EvictionOutcome::Killed;
            }
        }

        self.reaper.release(node).await;
        EvictionOutcome::Killed
    }

    /// Recheck all nodes shortly after a task finished.
    pub fn schedule_recheck(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let delay = self.config.idle_timeout + POST_TASK_SLACK;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.check_all().await;
        });
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
            "Starting retention controller"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Retention controller shutting down");
                        break;
                    }
                }
            }
        }
    }
}
