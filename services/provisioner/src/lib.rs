//! Mansion provisioner
//!
//! Provisions ephemeral build-worker VMs ("mansions") on demand from a VM
//! broker, keeps their leases alive, evicts them once idle and persists
//! file-system snapshots per template so the next VM starts warm.
//!
//! ## Architecture
//!
//! - **Provisioner** (`controller`): the facade; gates and starts allocations
//! - **Allocation** (`allocation`): one VM request's state machine, run on a
//!   spawned task and observed through a `PendingNode`
//! - **AllocationRegistry** (`registry`): noteworthy allocations for operators
//! - **LeaseRenewalDaemon** (`lease`): periodic lease renewal and staleness
//! - **RetentionController** (`retention`): idle and never-connected eviction
//! - **FileSystemClan** (`clan`): per-template snapshot lineages on disk
//! - **NodeReaper** (`teardown`): ordered, idempotent node teardown
//!
//! Throttling (backoff and quota) lives in `mansion-throttle`.

pub mod allocation;
pub mod broker;
pub mod clan;
pub mod config;
pub mod configure;
pub mod connector;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod lease;
pub mod mock;
pub mod node;
pub mod registry;
pub mod retention;
pub mod status;
pub mod teardown;
pub mod template;

pub use allocation::{Allocation, AllocationStatus, PendingNode};
pub use broker::{Broker, BrokerError, VirtualMachine};
pub use connector::{ConnectError, Connector};
pub use controller::{Blockage, Provisioner, ProvisionerConfig};
pub use error::ProvisionError;
pub use node::LiveNode;
pub use status::ProvisionerStatus;
pub use template::{Template, TemplateCatalog};
