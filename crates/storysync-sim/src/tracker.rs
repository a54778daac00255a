//! A tracker that fails on purpose.
//!
//! [`FaultyTracker`] wraps any [`TrackerAdapter`] and, driven by a seeded
//! RNG, answers some calls with a transient error or a rate-limit response
//! instead of forwarding them. Keys marked broken reject every mutation.
//! Faults are decided before the inner tracker is called, so an injected
//! failure never has a side effect.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use storysync_core::adapter::{AdapterError, MutationOutcome, NewIssue, RemoteIssue, TrackerAdapter};
use storysync_core::model::{EntityFields, Field, FieldValue};

use crate::rng::DeterministicRng;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Chance of a transient failure per call (percent).
    pub transient_percent: u8,
    /// Chance of a rate-limit response per call (percent).
    pub rate_limit_percent: u8,
    /// Chance that an issue touched by drift starts rejecting every
    /// mutation (percent).
    pub broken_key_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            transient_percent: 10,
            rate_limit_percent: 5,
            broken_key_percent: 5,
        }
    }
}

impl FaultConfig {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            transient_percent: 0,
            rate_limit_percent: 0,
            broken_key_percent: 0,
        }
    }
}

/// Faults injected so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultStats {
    pub calls: u64,
    pub transient: u64,
    pub rate_limited: u64,
    pub rejected: u64,
}

impl FaultStats {
    #[must_use]
    pub const fn injected(&self) -> u64 {
        self.transient + self.rate_limited + self.rejected
    }
}

#[derive(Debug)]
struct FaultState {
    rng: DeterministicRng,
    enabled: bool,
    broken: BTreeSet<String>,
    stats: FaultStats,
}

pub struct FaultyTracker {
    inner: Arc<dyn TrackerAdapter>,
    config: FaultConfig,
    state: Mutex<FaultState>,
}

impl std::fmt::Debug for FaultyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyTracker")
            .field("inner", &self.inner.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FaultyTracker {
    #[must_use]
    pub fn new(inner: Arc<dyn TrackerAdapter>, config: FaultConfig, rng: DeterministicRng) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(FaultState {
                rng,
                enabled: true,
                broken: BTreeSet::new(),
                stats: FaultStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn random faults on or off. Broken keys stay broken.
    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    /// Maybe break `key`, with the configured chance. Returns whether it
    /// is broken now.
    pub fn maybe_break(&self, key: &str) -> bool {
        let mut state = self.lock();
        if state.rng.percent(self.config.broken_key_percent) {
            tracing::debug!(key, "marking key broken");
            state.broken.insert(key.to_string());
        }
        state.broken.contains(key)
    }

    #[must_use]
    pub fn broken_keys(&self) -> BTreeSet<String> {
        self.lock().broken.clone()
    }

    #[must_use]
    pub fn stats(&self) -> FaultStats {
        self.lock().stats
    }

    fn gate(&self, op: &str, key: Option<&str>, mutating: bool) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.stats.calls += 1;
        let broken = key.filter(|k| mutating && state.broken.contains(*k));
        if let Some(key) = broken {
            state.stats.rejected += 1;
            return Err(AdapterError::Rejected(format!("{key} is locked by a workflow rule")));
        }
        if !state.enabled {
            return Ok(());
        }
        if state.rng.percent(self.config.transient_percent) {
            state.stats.transient += 1;
            tracing::trace!(op, ?key, "injecting transient failure");
            return Err(AdapterError::transient(format!("injected 503 on {op}")));
        }
        if state.rng.percent(self.config.rate_limit_percent) {
            state.stats.rate_limited += 1;
            tracing::trace!(op, ?key, "injecting rate limit");
            return Err(AdapterError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            });
        }
        Ok(())
    }
}

impl TrackerAdapter for FaultyTracker {
    fn name(&self) -> &str {
        "faulty"
    }

    fn get_issue(&self, key: &str) -> Result<RemoteIssue, AdapterError> {
        self.gate("GET_ISSUE", Some(key), false)?;
        self.inner.get_issue(key)
    }

    fn list_epic_children(&self, epic_key: &str) -> Result<Vec<RemoteIssue>, AdapterError> {
        self.gate("LIST_EPIC_CHILDREN", Some(epic_key), false)?;
        self.inner.list_epic_children(epic_key)
    }

    fn create_issue(&self, issue: &NewIssue) -> Result<RemoteIssue, AdapterError> {
        self.gate("CREATE", None, true)?;
        self.inner.create_issue(issue)
    }

    fn create_subtask(&self, parent_key: &str, fields: &EntityFields) -> Result<RemoteIssue, AdapterError> {
        self.gate("CREATE_SUBTASK", Some(parent_key), true)?;
        self.inner.create_subtask(parent_key, fields)
    }

    fn update_issue(
        &self,
        key: &str,
        changes: &BTreeMap<Field, FieldValue>,
    ) -> Result<MutationOutcome, AdapterError> {
        self.gate("UPDATE", Some(key), true)?;
        self.inner.update_issue(key, changes)
    }

    fn transition(&self, key: &str, status: &str) -> Result<MutationOutcome, AdapterError> {
        self.gate("TRANSITION", Some(key), true)?;
        self.inner.transition(key, status)
    }

    fn add_comment(&self, key: &str, body: &str) -> Result<String, AdapterError> {
        self.gate("COMMENT", Some(key), true)?;
        self.inner.add_comment(key, body)
    }

    fn delete_issue(&self, key: &str) -> Result<(), AdapterError> {
        self.gate("DELETE_ISSUE", Some(key), true)?;
        self.inner.delete_issue(key)
    }

    fn delete_comment(&self, key: &str, comment_id: &str) -> Result<(), AdapterError> {
        self.gate("DELETE_COMMENT", Some(key), true)?;
        self.inner.delete_comment(key, comment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storysync_core::adapter::InMemoryTracker;

    fn faulty(config: FaultConfig) -> (Arc<InMemoryTracker>, FaultyTracker) {
        let inner = Arc::new(InMemoryTracker::default());
        inner.insert_epic("EPIC-1", "Checkout");
        let tracker = FaultyTracker::new(inner.clone(), config, DeterministicRng::new(11));
        (inner, tracker)
    }

    #[test]
    fn disabled_faults_forward_everything() {
        let (inner, tracker) = faulty(FaultConfig {
            transient_percent: 100,
            ..FaultConfig::none()
        });
        assert!(tracker.list_epic_children("EPIC-1").unwrap_err().is_transient());

        tracker.set_enabled(false);
        assert!(tracker.list_epic_children("EPIC-1").unwrap().is_empty());
        assert_eq!(tracker.stats().transient, 1);
        assert_eq!(inner.calls().len(), 1);
    }

    #[test]
    fn broken_key_rejects_mutations_without_touching_the_inner_tracker() {
        let (inner, tracker) = faulty(FaultConfig {
            broken_key_percent: 100,
            ..FaultConfig::none()
        });
        let key = inner.seed_story("EPIC-1", EntityFields::titled("Cart"), None);
        assert!(tracker.maybe_break(&key));
        inner.reset_calls();

        let err = tracker.transition(&key, "Done").unwrap_err();
        assert!(matches!(err, AdapterError::Rejected(_)));
        assert!(!err.is_transient());
        assert_eq!(tracker.get_issue(&key).unwrap().fields.title, "Cart");
        assert_eq!(inner.mutation_count(), 0);
        assert_eq!(tracker.stats().rejected, 1);
    }

    #[test]
    fn injected_faults_are_reproducible() {
        let run = || {
            let (_, tracker) = faulty(FaultConfig {
                transient_percent: 30,
                rate_limit_percent: 20,
                broken_key_percent: 0,
            });
            (0..50)
                .map(|_| tracker.list_epic_children("EPIC-1").is_ok())
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().any(|ok| !ok));
        assert!(first.iter().any(|ok| *ok));
    }
}
