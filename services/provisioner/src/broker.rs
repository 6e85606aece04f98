//! VM broker contract.
//!
//! The broker creates, boots, renews and disposes virtual machines, and
//! snapshots their file systems. Only the operation contract lives here; the
//! wire protocol is somebody else's problem.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use mansion_throttle::{HardwareSpec, QuotaProblem, QuotaScope};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors reported by the broker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker rejected credentials: {0}")]
    Auth(String),

    #[error("broker unreachable: {0}")]
    Transport(String),

    #[error("quota exceeded: {message}")]
    QuotaExceeded { scope: QuotaScope, message: String },

    #[error("too many VMs: {message}")]
    TooManyVms { scope: QuotaScope, message: String },

    /// The VM refused the supplied specification.
    #[error("invalid VM configuration: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Quota problem carried by this error, if it is a quota rejection.
    pub fn quota_problem(&self) -> Option<QuotaProblem> {
        match self {
            Self::QuotaExceeded { scope, message } => {
                Some(QuotaProblem::new(scope.clone(), message.clone()))
            }
            Self::TooManyVms { scope, message } => {
                Some(QuotaProblem::too_many_vms(scope.clone(), message.clone()))
            }
            _ => None,
        }
    }
}

/// Where a file system starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSystemSource {
    /// Empty file system.
    Blank,

    /// Image shipped with the template.
    Baseline { url: Url },

    /// Snapshot of a previous VM's file system.
    Snapshot { url: Url },
}

/// Specification handed to [`VirtualMachine::setup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Named configuration blocks (sshd, init scripts, ...).
    #[serde(default)]
    pub configs: BTreeMap<String, serde_json::Value>,

    /// Mount path to file system source.
    #[serde(default)]
    pub file_systems: BTreeMap<String, FileSystemSource>,
}

impl VmSpec {
    /// Merge `other` on top of this spec; entries in `other` win.
    pub fn merge(&mut self, other: &VmSpec) {
        self.configs
            .extend(other.configs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.file_systems
            .extend(other.file_systems.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Start the file system at `path` from `snapshot`.
    pub fn overlay_snapshot(&mut self, path: &str, snapshot: Url) {
        self.file_systems
            .insert(path.to_string(), FileSystemSource::Snapshot { url: snapshot });
    }

    /// Whether any file system starts from a snapshot.
    pub fn uses_snapshots(&self) -> bool {
        self.file_systems
            .values()
            .any(|fs| matches!(fs, FileSystemSource::Snapshot { .. }))
    }
}

/// Live state of a VM, read at teardown and connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmState {
    /// Mount path to the live file system endpoint.
    pub file_systems: BTreeMap<String, Url>,

    /// Address the connector attaches to, once booted.
    pub endpoint: Option<String>,
}

/// Request for a new VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRequest {
    pub mansion_type: String,
    pub hardware: HardwareSpec,
    /// Broker credential selector.
    pub account: Option<String>,
}

/// Handle to one broker VM.
#[async_trait]
pub trait VirtualMachine: Send + Sync + std::fmt::Debug {
    /// Broker-assigned id.
    fn id(&self) -> &str;

    /// Broker URL of this VM; its host is the VM host.
    fn url(&self) -> &Url;

    /// Apply a specification. Fails with [`BrokerError::Configuration`] when
    /// the spec is rejected.
    async fn setup(&self, spec: &VmSpec) -> Result<(), BrokerError>;

    /// Boot and wait until the VM is running.
    async fn boot(&self) -> Result<(), BrokerError>;

    /// Extend the lease.
    async fn renew(&self) -> Result<(), BrokerError>;

    /// Release the VM.
    async fn dispose(&self) -> Result<(), BrokerError>;

    async fn state(&self) -> Result<VmState, BrokerError>;

    /// Attach a billing memo.
    async fn set_memo(&self, memo: &serde_json::Value) -> Result<(), BrokerError>;

    /// Host part of [`VirtualMachine::url`].
    fn host(&self) -> Option<&str> {
        self.url().host_str()
    }
}

/// The broker itself.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn create_virtual_machine(
        &self,
        request: &VmRequest,
    ) -> Result<Arc<dyn VirtualMachine>, BrokerError>;

    /// Snapshot a live file system, returning the snapshot URL.
    async fn snapshot(&self, file_system: &Url) -> Result<Url, BrokerError>;

    async fn dispose_snapshot(&self, snapshot: &Url) -> Result<(), BrokerError>;
}
