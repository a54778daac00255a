//! Replay protection.
//!
//! Two levels:
//!
//! - **Entity**: the local content hash is compared with the hash recorded in
//!   the base snapshot. `Unchanged` entities need no remote mutation.
//! - **Operation**: every applied operation's hash is appended to the run's
//!   replay log. Resuming a run with the same id skips operations whose hash
//!   is already logged, so a crash mid-transaction never re-applies them.
//!   An operation undone by rollback is revoked with a second entry
//!   (`-<hash>`), so a resumed run applies it again.
//!
//! An operation hash covers `{entity id, operation kind, payload hash}`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::transaction::OperationKind;
use crate::fingerprint;
use crate::model::{Entity, EntityId};
use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Unchanged,
    Changed,
    New,
    AlreadyApplied,
}

impl IdempotencyStatus {
    /// Whether a mutating call should be made.
    #[must_use]
    pub const fn should_apply(self) -> bool {
        matches!(self, Self::Changed | Self::New)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyCheck {
    pub entity_id: EntityId,
    pub current_hash: String,
    pub recorded_hash: Option<String>,
    pub status: IdempotencyStatus,
}

/// Compare an entity's current fingerprint with the recorded one.
#[must_use]
pub fn check(entity: &Entity, recorded_hash: Option<&str>) -> IdempotencyCheck {
    check_hash(&entity.id, fingerprint::hash(entity), recorded_hash)
}

/// [`check`] for a fingerprint computed elsewhere.
#[must_use]
pub fn check_hash(entity_id: &EntityId, current_hash: String, recorded_hash: Option<&str>) -> IdempotencyCheck {
    let status = match recorded_hash {
        None => IdempotencyStatus::New,
        Some(recorded) if recorded == current_hash => IdempotencyStatus::Unchanged,
        Some(_) => IdempotencyStatus::Changed,
    };
    IdempotencyCheck {
        entity_id: entity_id.clone(),
        current_hash,
        recorded_hash: recorded_hash.map(str::to_string),
        status,
    }
}

#[derive(Serialize)]
struct OperationKey<'a> {
    entity: &'a str,
    kind: OperationKind,
    payload: String,
}

/// Log entry prefix revoking an earlier entry.
const REVOKED: char = '-';

/// Hash identifying one operation within a run.
///
/// # Errors
///
/// [`serde_json::Error`] if the payload cannot be serialized.
pub fn operation_hash<P: Serialize>(
    entity_id: &EntityId,
    kind: OperationKind,
    payload: &P,
) -> Result<String, serde_json::Error> {
    let payload = fingerprint::hash_bytes(&serde_json::to_vec(payload)?);
    let key = OperationKey {
        entity: entity_id.as_str(),
        kind,
        payload,
    };
    Ok(fingerprint::hash_bytes(&serde_json::to_vec(&key)?))
}

/// Per-run replay guard backed by the state store's operation log.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    run_id: String,
    applied: HashSet<String>,
}

impl IdempotencyGuard {
    /// A guard for a fresh run with an empty log.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            applied: HashSet::new(),
        }
    }

    /// Load the replay log of `run_id`.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the log cannot be read.
    pub fn load(store: &dyn StateStore, run_id: &str) -> Result<Self, StoreError> {
        let mut applied = HashSet::new();
        for entry in store.load_operation_log(run_id)? {
            if let Some(hash) = entry.strip_prefix(REVOKED) {
                applied.remove(hash);
            } else {
                applied.insert(entry);
            }
        }
        if !applied.is_empty() {
            tracing::info!(run_id, logged = applied.len(), "resuming run with replay log");
        }
        Ok(Self {
            run_id: run_id.to_string(),
            applied,
        })
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Entity-level check, see [`check`].
    #[must_use]
    pub fn check(&self, entity: &Entity, recorded_hash: Option<&str>) -> IdempotencyCheck {
        check(entity, recorded_hash)
    }

    /// `AlreadyApplied` if the operation is in the replay log, otherwise
    /// `Changed`.
    #[must_use]
    pub fn check_operation(&self, operation_hash: &str) -> IdempotencyStatus {
        if self.applied.contains(operation_hash) {
            IdempotencyStatus::AlreadyApplied
        } else {
            IdempotencyStatus::Changed
        }
    }

    /// Log an applied operation.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the log cannot be appended to. The in-memory set is
    /// updated regardless, so the current run still skips the operation.
    pub fn record(&mut self, store: &dyn StateStore, operation_hash: &str) -> Result<(), StoreError> {
        self.applied.insert(operation_hash.to_string());
        store.append_operation_log(&self.run_id, operation_hash)
    }

    /// Log that an applied operation was undone, so a resumed run applies
    /// it again.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the log cannot be appended to.
    pub fn revoke(&mut self, store: &dyn StateStore, operation_hash: &str) -> Result<(), StoreError> {
        self.applied.remove(operation_hash);
        store.append_operation_log(&self.run_id, &format!("{REVOKED}{operation_hash}"))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}
