//! Provisioning throttles.
//!
//! Two leaf policies decide whether the controller may ask the broker for
//! another VM:
//!
//! - [`BackoffCounter`]: a per-template cooldown that grows exponentially
//!   with consecutive provisioning failures and resets on success.
//! - [`QuotaTracker`]: broker-reported quota rejections, scoped globally, to
//!   a mansion type, or to a `(type, size)` pair.
//!
//! # Invariants
//!
//! - Every failed provisioning attempt records exactly one backoff error
//! - `backoff(n)` never exceeds the configured maximum
//! - Quota problems are never merged; they are only cleared in bulk

mod backoff;
mod quota;

pub use backoff::{BackoffCounter, BackoffPolicy, BackoffRegistry, BackoffSnapshot};
pub use quota::{HardwareSpec, QuotaProblem, QuotaScope, QuotaTracker};

use std::time::Duration;

/// Default delay after the first error.
pub const DEFAULT_FIRST_BACKOFF: Duration = Duration::from_secs(2);

/// Default ceiling on the backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default period of the too-many-VMs sweep.
pub const DEFAULT_TOO_MANY_VMS_SWEEP: Duration = Duration::from_secs(5 * 60); // 5 minutes
