//! Named trackers and credentials, constructed once and handed to the
//! orchestrators.
//!
//! There is no process-wide registry: whoever starts a sync builds a
//! [`SyncRegistry`], registers the trackers it knows about and asks it for
//! a [`SyncContext`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter::{DocumentStore, RateLimitedTracker, TrackerAdapter};
use crate::config::{ConfigError, SyncConfig};
use crate::lock::EntityLockTable;
use crate::store::StateStore;
use crate::sync::SyncContext;

/// A credential that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for handing to a tracker client.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Default)]
pub struct SyncRegistry {
    trackers: BTreeMap<String, Arc<dyn TrackerAdapter>>,
    secrets: BTreeMap<String, Secret>,
    locks: Arc<EntityLockTable>,
}

impl fmt::Debug for SyncRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRegistry")
            .field("trackers", &self.trackers.keys().collect::<Vec<_>>())
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

impl SyncRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tracker` under `name`, returning the one it replaces.
    pub fn register_tracker(
        &mut self,
        name: impl Into<String>,
        tracker: Arc<dyn TrackerAdapter>,
    ) -> Option<Arc<dyn TrackerAdapter>> {
        let name = name.into();
        tracing::debug!(%name, adapter = tracker.name(), "registering tracker");
        self.trackers.insert(name, tracker)
    }

    #[must_use]
    pub fn with_tracker(mut self, name: impl Into<String>, tracker: Arc<dyn TrackerAdapter>) -> Self {
        self.register_tracker(name, tracker);
        self
    }

    #[must_use]
    pub fn tracker(&self, name: &str) -> Option<Arc<dyn TrackerAdapter>> {
        self.trackers.get(name).cloned()
    }

    pub fn tracker_names(&self) -> impl Iterator<Item = &str> {
        self.trackers.keys().map(String::as_str)
    }

    pub fn set_secret(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(name.into(), Secret::new(value));
    }

    #[must_use]
    pub fn secret(&self, name: &str) -> Option<&Secret> {
        self.secrets.get(name)
    }

    /// The lock table shared by every context this registry builds, so
    /// concurrent runs never work on the same entity at once.
    #[must_use]
    pub fn locks(&self) -> Arc<EntityLockTable> {
        Arc::clone(&self.locks)
    }

    /// Build the context for syncing against the tracker named `tracker`.
    ///
    /// The tracker is wrapped in a rate limiter when `[rate_limit]` is
    /// enabled.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for an unknown tracker or invalid settings.
    pub fn build_context(
        &self,
        tracker: &str,
        document: Arc<dyn DocumentStore>,
        store: Arc<dyn StateStore>,
        config: &SyncConfig,
    ) -> Result<SyncContext, ConfigError> {
        config.validate()?;
        let inner = self
            .tracker(tracker)
            .ok_or_else(|| ConfigError::Invalid(format!("no tracker registered as '{tracker}'")))?;
        let adapter: Arc<dyn TrackerAdapter> = if config.rate_limit.enabled {
            Arc::new(RateLimitedTracker::new(
                inner,
                config.rate_limit.bucket(),
                config.rate_limit.acquire_timeout(),
            ))
        } else {
            inner
        };
        Ok(SyncContext::new(adapter, document, store)
            .with_merge_config(config.merge.to_merge_config()?)
            .with_retry(config.retry.to_policy())
            .with_locks(self.locks())
            .with_lock_timeout(config.locks.entity_timeout()))
    }
}
