//! Terminal failure of one allocation.

use mansion_throttle::QuotaProblem;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::connector::ConnectError;

/// Why an allocation failed.
///
/// Cloneable: the same value is kept on the allocation for the operator
/// view and delivered through the pending handle.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Both the snapshot-augmented spec and the baseline spec were rejected.
    #[error("failed to configure VM: {0}")]
    Configuration(String),

    #[error("configurator {name} failed: {message}")]
    Configurator { name: String, message: String },

    #[error("failed to connect after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: ConnectError,
    },

    #[error("injected failure")]
    InjectedFault,

    #[error("allocation cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Stable machine-readable code for status reporting.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Broker(BrokerError::Auth(_)) => "broker_auth",
            Self::Broker(BrokerError::Transport(_)) => "broker_unreachable",
            Self::Broker(BrokerError::QuotaExceeded { .. }) => "quota_exceeded",
            Self::Broker(BrokerError::TooManyVms { .. }) => "too_many_vms",
            Self::Broker(BrokerError::Configuration(_)) => "setup_rejected",
            Self::Broker(BrokerError::NotFound(_)) => "broker_not_found",
            Self::Broker(BrokerError::Other(_)) => "broker_error",
            Self::Configuration(_) => "configuration_failed",
            Self::Configurator { .. } => "configurator_failed",
            Self::Connect { .. } => "connect_failed",
            Self::InjectedFault => "injected_fault",
            Self::Cancelled => "cancelled",
        }
    }

    /// Quota problem to record, if the broker rejected on quota.
    pub fn quota_problem(&self) -> Option<QuotaProblem> {
        match self {
            Self::Broker(e) => e.quota_problem(),
            _ => None,
        }
    }

    /// Whether this failure counts against the template's backoff.
    pub fn counts_as_error(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}
