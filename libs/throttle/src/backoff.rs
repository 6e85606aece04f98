//! Per-template exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use mansion_id::TemplateId;
use serde::Serialize;
use tokio::time::Instant;

use crate::{DEFAULT_FIRST_BACKOFF, DEFAULT_MAX_BACKOFF};

/// Backoff growth policy.
///
/// `delay(n) = min(first * 2^(n-1), max)`, and `delay(0)` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first error.
    pub first: Duration,

    /// Ceiling on the delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: DEFAULT_FIRST_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy.
    pub fn new(first: Duration, max: Duration) -> Self {
        Self { first, max }
    }

    /// Delay imposed after `errors` consecutive errors.
    pub fn delay(&self, errors: u32) -> Duration {
        if errors == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(errors - 1);
        self.first.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Default)]
struct CounterState {
    errors: u32,
    last_error_at: Option<Instant>,
}

/// Consecutive-error counter for one template.
///
/// Internally synchronized; share it through an `Arc`.
#[derive(Debug)]
pub struct BackoffCounter {
    template: TemplateId,
    policy: BackoffPolicy,
    state: Mutex<CounterState>,
}

impl BackoffCounter {
    /// Create a cleared counter.
    pub fn new(template: TemplateId, policy: BackoffPolicy) -> Self {
        Self {
            template,
            policy,
            state: Mutex::new(CounterState::default()),
        }
    }

    /// Template this counter belongs to.
    pub fn template(&self) -> &TemplateId {
        &self.template
    }

    /// Policy in use.
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one failed provisioning attempt.
    pub fn record_error(&self) {
        self.record_error_at(Instant::now());
    }

    /// Record one failed provisioning attempt at `now`.
    pub fn record_error_at(&self, now: Instant) {
        let mut state = self.state();
        state.errors = state.errors.saturating_add(1);
        state.last_error_at = Some(now);
        tracing::debug!(
            template = %self.template,
            errors = state.errors,
            delay_ms = self.policy.delay(state.errors).as_millis() as u64,
            "backoff error recorded"
        );
    }

    /// Reset after a success or an operator retry.
    pub fn clear(&self) {
        let mut state = self.state();
        state.errors = 0;
        state.last_error_at = None;
    }

    /// Number of consecutive errors.
    pub fn error_count(&self) -> u32 {
        self.state().errors
    }

    /// Earliest instant at which provisioning may resume, if backing off.
    pub fn next_attempt(&self) -> Option<Instant> {
        let state = self.state();
        state
            .last_error_at
            .map(|at| at + self.policy.delay(state.errors))
    }

    /// Whether provisioning is currently suppressed.
    pub fn is_backoff_in_effect(&self) -> bool {
        self.is_backoff_in_effect_at(Instant::now())
    }

    /// Whether provisioning is suppressed at `now`.
    pub fn is_backoff_in_effect_at(&self, now: Instant) -> bool {
        self.next_attempt().is_some_and(|until| now < until)
    }

    /// Time left before provisioning may resume.
    pub fn remaining(&self) -> Duration {
        self.next_attempt()
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Point-in-time view of one counter, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackoffSnapshot {
    pub template: TemplateId,
    pub errors: u32,
    pub remaining_secs: u64,
}

/// Lazily populated map of counters, one per template.
///
/// Counters are never removed.
#[derive(Debug, Default)]
pub struct BackoffRegistry {
    policy: BackoffPolicy,
    counters: RwLock<HashMap<TemplateId, Arc<BackoffCounter>>>,
}

impl BackoffRegistry {
    /// Create an empty registry whose counters use `policy`.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Counter for `template`, created on first use.
    pub fn get_or_create(&self, template: &TemplateId) -> Arc<BackoffCounter> {
        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(template)
        {
            return Arc::clone(counter);
        }

        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            counters
                .entry(template.clone())
                .or_insert_with(|| Arc::new(BackoffCounter::new(template.clone(), self.policy))),
        )
    }

    /// Counter for `template`, if one was ever created.
    pub fn get(&self, template: &TemplateId) -> Option<Arc<BackoffCounter>> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(template)
            .cloned()
    }

    /// Snapshot of every counter that currently has errors, sorted by template.
    pub fn snapshot(&self) -> Vec<BackoffSnapshot> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = counters
            .values()
            .filter(|c| c.error_count() > 0)
            .map(|c| BackoffSnapshot {
                template: c.template().clone(),
                errors: c.error_count(),
                remaining_secs: c.remaining().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.template.cmp(&b.template));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn template(name: &str) -> TemplateId {
        TemplateId::parse(name).unwrap()
    }

    #[test]
    fn test_policy_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(9), Duration::from_secs(512));
        assert_eq!(policy.delay(10), Duration::from_secs(600));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_window() {
        let counter = BackoffCounter::new(template("small"), BackoffPolicy::default());
        assert!(!counter.is_backoff_in_effect());

        counter.record_error();
        assert!(counter.is_backoff_in_effect());
        assert_eq!(counter.error_count(), 1);

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(counter.is_backoff_in_effect());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!counter.is_backoff_in_effect());

        counter.record_error();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(counter.is_backoff_in_effect());
        assert_eq!(counter.remaining(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_lifts_backoff() {
        let counter = BackoffCounter::new(template("small"), BackoffPolicy::default());
        counter.record_error();
        counter.record_error();
        counter.clear();
        assert!(!counter.is_backoff_in_effect());
        assert_eq!(counter.error_count(), 0);
        assert_eq!(counter.next_attempt(), None);
    }

    #[test]
    fn test_registry_returns_same_counter() {
        let registry = BackoffRegistry::new(BackoffPolicy::default());
        let a = registry.get_or_create(&template("small"));
        let b = registry.get_or_create(&template("small"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get(&template("large")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_snapshot_lists_erroring_templates() {
        let registry = BackoffRegistry::new(BackoffPolicy::default());
        registry.get_or_create(&template("quiet"));
        registry.get_or_create(&template("small")).record_error();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].template.as_str(), "small");
        assert_eq!(snapshot[0].errors, 1);
        assert_eq!(snapshot[0].remaining_secs, 2);
    }

    proptest! {
        #[test]
        fn prop_delay_capped_and_monotonic(
            first_ms in 1u64..10_000,
            max_ms in 1u64..10_000_000,
            n in 0u32..200,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(first_ms),
                Duration::from_millis(max_ms),
            );
            prop_assert!(policy.delay(n) <= policy.max);
            prop_assert!(policy.delay(n) <= policy.delay(n + 1));
        }
    }
}
