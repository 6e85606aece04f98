//! Mock broker, VM and connector for tests and development.
//!
//! The mocks keep every interaction so tests can assert on it, and accept
//! scripted failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

use crate::broker::{Broker, BrokerError, VirtualMachine, VmRequest, VmSpec, VmState};
use crate::connector::{ConnectError, Connector};

const DEFAULT_BASE: &str = "https://mock.test/";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_url(s: &str) -> Result<Url, BrokerError> {
    Url::parse(s).map_err(|e| BrokerError::Other(format!("invalid URL {s}: {e}")))
}

/// Behavior shared by all VMs of one [`MockBroker`].
#[derive(Debug, Default)]
struct VmBehavior {
    reject_snapshot_specs: AtomicBool,
    reject_all_specs: AtomicBool,
    fail_boot: AtomicBool,
    fail_renew: AtomicBool,
}

// =============================================================================
// Virtual machine
// =============================================================================

#[derive(Debug)]
pub struct MockVirtualMachine {
    id: String,
    url: Url,
    behavior: Arc<VmBehavior>,
    setups: Mutex<Vec<VmSpec>>,
    boots: AtomicU32,
    renewals: AtomicU32,
    disposed: AtomicBool,
    memo: Mutex<Option<serde_json::Value>>,
}

impl MockVirtualMachine {
    /// Standalone VM with default behavior.
    ///
    /// # Panics
    ///
    /// Panics if `url` is not a valid URL.
    pub fn new(id: &str, url: &str) -> Self {
        Self::with_behavior(id, Url::parse(url).expect("valid mock VM URL"), Arc::default())
    }

    fn with_behavior(id: &str, url: Url, behavior: Arc<VmBehavior>) -> Self {
        Self {
            id: id.to_string(),
            url,
            behavior,
            setups: Mutex::new(Vec::new()),
            boots: AtomicU32::new(0),
            renewals: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
            memo: Mutex::new(None),
        }
    }

    /// Every spec passed to `setup`, accepted or not.
    pub fn setups(&self) -> Vec<VmSpec> {
        lock(&self.setups).clone()
    }

    pub fn boot_count(&self) -> u32 {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn renew_count(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn memo(&self) -> Option<serde_json::Value> {
        lock(&self.memo).clone()
    }
}

#[async_trait]
impl VirtualMachine for MockVirtualMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn setup(&self, spec: &VmSpec) -> Result<(), BrokerError> {
        lock(&self.setups).push(spec.clone());
        if self.behavior.reject_all_specs.load(Ordering::SeqCst) {
            return Err(BrokerError::Configuration("spec rejected".into()));
        }
        if spec.uses_snapshots() && self.behavior.reject_snapshot_specs.load(Ordering::SeqCst) {
            return Err(BrokerError::Configuration("snapshot not found".into()));
        }
        debug!(vm = %self.url, "[MOCK] VM configured");
        Ok(())
    }

    async fn boot(&self) -> Result<(), BrokerError> {
        if self.behavior.fail_boot.load(Ordering::SeqCst) {
            return Err(BrokerError::Other("boot failed".into()));
        }
        self.boots.fetch_add(1, Ordering::SeqCst);
        info!(vm = %self.url, "[MOCK] Booted VM");
        Ok(())
    }

    async fn renew(&self) -> Result<(), BrokerError> {
        if self.behavior.fail_renew.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("renewal timed out".into()));
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        self.disposed.store(true, Ordering::SeqCst);
        info!(vm = %self.url, "[MOCK] Disposed VM");
        Ok(())
    }

    async fn state(&self) -> Result<VmState, BrokerError> {
        let host = self.url.host_str().unwrap_or("localhost");
        let setups = lock(&self.setups);
        let mut state = VmState {
            endpoint: Some(format!("{host}:15000")),
            ..Default::default()
        };
        if let Some(spec) = setups.last() {
            for path in spec.file_systems.keys() {
                let fs = format!(
                    "{}://{host}/fs/{}{}",
                    self.url.scheme(),
                    self.id,
                    path
                );
                state.file_systems.insert(path.clone(), parse_url(&fs)?);
            }
        }
        Ok(state)
    }

    async fn set_memo(&self, memo: &serde_json::Value) -> Result<(), BrokerError> {
        *lock(&self.memo) = Some(memo.clone());
        Ok(())
    }
}

// =============================================================================
// Broker
// =============================================================================

pub struct MockBroker {
    base: Mutex<String>,
    counter: AtomicU64,
    behavior: Arc<VmBehavior>,
    create_failures: Mutex<VecDeque<BrokerError>>,
    create_delay: Mutex<Duration>,
    vms: Mutex<Vec<Arc<MockVirtualMachine>>>,
    snapshots: Mutex<Vec<Url>>,
    snapshot_gate: Mutex<Option<Arc<Semaphore>>>,
    snapshots_started: AtomicU32,
    disposed_snapshots: Mutex<Vec<Url>>,
    fail_snapshot_disposal: AtomicBool,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::with_base(DEFAULT_BASE.to_string())
    }
}

impl MockBroker {
    /// Broker whose VMs live under `base`.
    pub fn new(base: Url) -> Self {
        Self::with_base(base.into())
    }

    fn with_base(base: String) -> Self {
        Self {
            base: Mutex::new(base),
            counter: AtomicU64::new(0),
            behavior: Arc::default(),
            create_failures: Mutex::new(VecDeque::new()),
            create_delay: Mutex::new(Duration::from_millis(0)),
            vms: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
            snapshot_gate: Mutex::new(None),
            snapshots_started: AtomicU32::new(0),
            disposed_snapshots: Mutex::new(Vec::new()),
            fail_snapshot_disposal: AtomicBool::new(false),
        }
    }

    /// Move new VMs to another host.
    pub fn set_host(&self, host: &str) {
        let mut base = lock(&self.base);
        match Url::parse(&base) {
            Ok(mut url) => match url.set_host(Some(host)) {
                Ok(()) => *base = url.into(),
                Err(_) => tracing::warn!(host, "[MOCK] Ignoring invalid host"),
            },
            _ => tracing::warn!(host, "[MOCK] Ignoring invalid host"),
        }
    }

    /// Fail the next `create_virtual_machine` call with `err`.
    pub fn fail_next_create(&self, err: BrokerError) {
        lock(&self.create_failures).push_back(err);
    }

    /// Simulated broker latency for `create_virtual_machine`.
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    /// Reject specs that start any file system from a snapshot.
    pub fn reject_snapshot_specs(&self, reject: bool) {
        self.behavior
            .reject_snapshot_specs
            .store(reject, Ordering::SeqCst);
    }

    /// Reject every spec.
    pub fn reject_all_specs(&self, reject: bool) {
        self.behavior.reject_all_specs.store(reject, Ordering::SeqCst);
    }

    pub fn fail_boot(&self, fail: bool) {
        self.behavior.fail_boot.store(fail, Ordering::SeqCst);
    }

    pub fn fail_renew(&self, fail: bool) {
        self.behavior.fail_renew.store(fail, Ordering::SeqCst);
    }

    /// Park every `snapshot` call until released.
    pub fn hold_snapshots(&self) {
        *lock(&self.snapshot_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` parked or future `snapshot` calls through.
    pub fn release_snapshots(&self, n: usize) {
        if let Some(gate) = lock(&self.snapshot_gate).as_ref() {
            gate.add_permits(n);
        }
    }

    /// `snapshot` calls entered so far, parked ones included.
    pub fn snapshots_started(&self) -> u32 {
        self.snapshots_started.load(Ordering::SeqCst)
    }

    pub fn fail_snapshot_disposal(&self, fail: bool) {
        self.fail_snapshot_disposal.store(fail, Ordering::SeqCst);
    }

    pub fn created_vms(&self) -> Vec<Arc<MockVirtualMachine>> {
        lock(&self.vms).clone()
    }

    pub fn taken_snapshots(&self) -> Vec<Url> {
        lock(&self.snapshots).clone()
    }

    pub fn disposed_snapshots(&self) -> Vec<Url> {
        lock(&self.disposed_snapshots).clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn create_virtual_machine(
        &self,
        request: &VmRequest,
    ) -> Result<Arc<dyn VirtualMachine>, BrokerError> {
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.create_failures).pop_front() {
            return Err(err);
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("vm-{n}");
        let base = lock(&self.base).clone();
        let url = parse_url(&base)?
            .join(&format!("vms/{id}"))
            .map_err(|e| BrokerError::Other(e.to_string()))?;
        info!(
            vm = %url,
            mansion_type = %request.mansion_type,
            size = %request.hardware.size,
            "[MOCK] Created VM"
        );

        let vm = Arc::new(MockVirtualMachine::with_behavior(
            &id,
            url,
            Arc::clone(&self.behavior),
        ));
        lock(&self.vms).push(Arc::clone(&vm));
        Ok(vm)
    }

    async fn snapshot(&self, file_system: &Url) -> Result<Url, BrokerError> {
        self.snapshots_started.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.snapshot_gate).clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let host = file_system
            .host_str()
            .ok_or_else(|| BrokerError::NotFound(file_system.to_string()))?;
        let snapshot = parse_url(&format!("{}://{host}/snapshots/{n}", file_system.scheme()))?;
        lock(&self.snapshots).push(snapshot.clone());
        Ok(snapshot)
    }

    async fn dispose_snapshot(&self, snapshot: &Url) -> Result<(), BrokerError> {
        if self.fail_snapshot_disposal.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("dispose timed out".into()));
        }
        lock(&self.disposed_snapshots).push(snapshot.clone());
        Ok(())
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Connector that succeeds unless told otherwise.
#[derive(Debug, Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<Result<(), ConnectError>>>,
    always: Mutex<Option<ConnectError>>,
    attempts: AtomicU32,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next attempt.
    pub fn push_result(&self, result: Result<(), ConnectError>) {
        lock(&self.script).push_back(result);
    }

    /// Fail every attempt not covered by the script.
    pub fn fail_always(&self, err: ConnectError) {
        *lock(&self.always) = Some(err);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, vm: &dyn VirtualMachine) -> Result<(), ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = lock(&self.script).pop_front() {
            return result;
        }
        if let Some(err) = lock(&self.always).clone() {
            return Err(err);
        }
        debug!(vm = %vm.url(), "[MOCK] Connected");
        Ok(())
    }
}
