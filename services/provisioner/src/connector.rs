//! Worker attach contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::VirtualMachine;

/// Connection failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Network-level failure; the VM may simply not be listening yet.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Fatal(String),
}

impl ConnectError {
    /// Only I/O failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Establishes the channel between the scheduler and a booted VM.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, vm: &dyn VirtualMachine) -> Result<(), ConnectError>;
}
