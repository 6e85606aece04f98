//! Broker quota problems and the blocking rule.

use std::sync::{PoisonError, RwLock};

use serde::Serialize;

/// Hardware requested for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HardwareSpec {
    /// Canonical broker size name, e.g. `small`.
    pub size: String,
}

impl HardwareSpec {
    pub fn new(size: impl Into<String>) -> Self {
        Self { size: size.into() }
    }
}

/// What a quota rejection applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum QuotaScope {
    /// The whole subscription.
    Global,

    /// Every size of one mansion type.
    ForType { mansion_type: String },

    /// One size of one mansion type.
    ForSize { mansion_type: String, size: String },
}

/// A quota rejection reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaProblem {
    pub scope: QuotaScope,

    /// Broker message.
    pub message: String,

    /// Concurrent-VM limit; heals by itself once capacity frees up.
    pub too_many_vms: bool,
}

impl QuotaProblem {
    pub fn new(scope: QuotaScope, message: impl Into<String>) -> Self {
        Self {
            scope,
            message: message.into(),
            too_many_vms: false,
        }
    }

    pub fn too_many_vms(scope: QuotaScope, message: impl Into<String>) -> Self {
        Self {
            too_many_vms: true,
            ..Self::new(scope, message)
        }
    }

    /// Whether this problem forbids provisioning `hardware` of `mansion_type`.
    pub fn blocks(&self, hardware: &HardwareSpec, mansion_type: &str) -> bool {
        match &self.scope {
            QuotaScope::Global => true,
            QuotaScope::ForType { mansion_type: t } => t == mansion_type,
            QuotaScope::ForSize {
                mansion_type: t,
                size,
            } => t == mansion_type && *size == hardware.size,
        }
    }

    /// Message shown to operators.
    pub fn display_message(&self) -> String {
        match &self.scope {
            QuotaScope::Global => self.message.clone(),
            QuotaScope::ForType { mansion_type } => {
                let mut msg = format!("Unable to provision {mansion_type} : {}", self.message);
                if self.too_many_vms {
                    msg.push_str(" (Will retry automatically)");
                }
                msg
            }
            QuotaScope::ForSize { mansion_type, size } => {
                format!(
                    "Unable to provision {size} from: {mansion_type} : {}",
                    self.message
                )
            }
        }
    }
}

/// Recorded quota problems.
///
/// General problems persist until an operator clears them. Too-many-VMs
/// problems are also cleared whenever a node goes offline and by a periodic
/// sweep.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    problems: RwLock<Vec<QuotaProblem>>,
    too_many_vms: RwLock<Vec<QuotaProblem>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a persistent problem.
    pub fn add_problem(&self, problem: QuotaProblem) {
        tracing::info!(message = %problem.display_message(), "quota problem recorded");
        self.problems
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(problem);
    }

    /// Record a self-healing too-many-VMs problem.
    pub fn add_too_many_vms_problem(&self, mut problem: QuotaProblem) {
        problem.too_many_vms = true;
        tracing::info!(message = %problem.display_message(), "too-many-VMs problem recorded");
        self.too_many_vms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(problem);
    }

    /// Route a problem to the right list based on its flag.
    pub fn record(&self, problem: QuotaProblem) {
        if problem.too_many_vms {
            self.add_too_many_vms_problem(problem);
        } else {
            self.add_problem(problem);
        }
    }

    /// Whether any recorded problem blocks `hardware` of `mansion_type`.
    pub fn is_blocked(&self, hardware: &HardwareSpec, mansion_type: &str) -> bool {
        self.blocking_problem(hardware, mansion_type).is_some()
    }

    /// First recorded problem that blocks `hardware` of `mansion_type`.
    pub fn blocking_problem(
        &self,
        hardware: &HardwareSpec,
        mansion_type: &str,
    ) -> Option<QuotaProblem> {
        let problems = self.problems.read().unwrap_or_else(PoisonError::into_inner);
        let too_many = self
            .too_many_vms
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        problems
            .iter()
            .chain(too_many.iter())
            .find(|p| p.blocks(hardware, mansion_type))
            .cloned()
    }

    /// Drop all too-many-VMs problems.
    pub fn clear_too_many_vms(&self) {
        let mut list = self
            .too_many_vms
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !list.is_empty() {
            tracing::debug!(count = list.len(), "clearing too-many-VMs problems");
            list.clear();
        }
    }

    /// Drop every problem; the operator action.
    pub fn clear_all(&self) {
        self.problems
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.clear_too_many_vms();
    }

    /// All problems, general ones first.
    pub fn problems(&self) -> Vec<QuotaProblem> {
        let mut out = self
            .problems
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        out.extend(
            self.too_many_vms
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        out
    }
}
