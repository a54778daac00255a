//! Report shapes returned by the orchestrators.
//!
//! These serialize to a stable JSON shape for report consumers: aggregate
//! counts, unresolved conflicts, failed operations with their rollback
//! outcome, and per-epic progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::conflict::Conflict;
use super::idempotency::IdempotencyStatus;
use super::progress::{EpicProgress, EpicStatus, SyncPhase};
use super::transaction::{FailedOperation, Operation};
use crate::error::ErrorCode;
use crate::model::{EntityId, Field};

/// Final state of one entity after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityDisposition {
    Created,
    Updated,
    Skipped,
    Conflicted,
    Failed,
}

impl fmt::Display for EntityDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    /// Entities paired with an existing remote issue by title.
    pub matched: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub conflicted: usize,
    pub failed: usize,
}

impl SyncCounts {
    pub const fn record(&mut self, disposition: EntityDisposition) {
        match disposition {
            EntityDisposition::Created => self.created += 1,
            EntityDisposition::Updated => self.updated += 1,
            EntityDisposition::Skipped => self.skipped += 1,
            EntityDisposition::Conflicted => self.conflicted += 1,
            EntityDisposition::Failed => self.failed += 1,
        }
    }

    pub const fn add(&mut self, other: &Self) {
        self.matched += other.matched;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.conflicted += other.conflicted;
        self.failed += other.failed;
    }

    /// Entities with a disposition (matched is not a disposition).
    #[must_use]
    pub const fn total(&self) -> usize {
        self.created + self.updated + self.skipped + self.conflicted + self.failed
    }
}

/// What happened to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity_id: EntityId,
    pub remote_key: Option<String>,
    pub disposition: EntityDisposition,
    #[serde(default)]
    pub matched: bool,
    #[serde(default)]
    pub idempotency: Option<IdempotencyStatus>,
    /// Remote operations applied (or planned, in a dry run).
    #[serde(default)]
    pub operations: usize,
    /// Operations skipped because the replay log already had them.
    #[serde(default)]
    pub replayed: usize,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub review_recommended: Vec<Field>,
    #[serde(default)]
    pub message: Option<String>,
}

impl EntityOutcome {
    #[must_use]
    pub fn new(entity_id: EntityId, disposition: EntityDisposition) -> Self {
        Self {
            entity_id,
            remote_key: None,
            disposition,
            matched: false,
            idempotency: None,
            operations: 0,
            replayed: 0,
            conflicts: Vec::new(),
            review_recommended: Vec::new(),
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Why an epic failed as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicError {
    pub code: String,
    pub message: String,
    /// Authentication or permission failure: the run must stop.
    #[serde(default)]
    pub fatal: bool,
}

impl EpicError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code().to_string(),
            message: message.into(),
            fatal: false,
        }
    }

    #[must_use]
    pub const fn fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }
}

impl fmt::Display for EpicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicResult {
    pub epic_key: String,
    pub status: EpicStatus,
    /// Last phase entered.
    pub phase: SyncPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: SyncCounts,
    pub entities: Vec<EntityOutcome>,
    /// Remote children no local entity corresponds to. Never imported.
    #[serde(default)]
    pub remote_only: Vec<String>,
    #[serde(default)]
    pub unresolved: Vec<Conflict>,
    #[serde(default)]
    pub failed_operations: Vec<FailedOperation>,
    /// Operations a dry run would have applied.
    #[serde(default)]
    pub planned: Vec<Operation>,
    #[serde(default)]
    pub error: Option<EpicError>,
}

impl EpicResult {
    /// An epic that failed before (or instead of) any entity work.
    #[must_use]
    pub fn failed(epic_key: impl Into<String>, phase: SyncPhase, started_at: DateTime<Utc>, error: EpicError) -> Self {
        Self {
            epic_key: epic_key.into(),
            status: EpicStatus::Failed,
            phase,
            started_at,
            finished_at: Utc::now(),
            counts: SyncCounts::default(),
            entities: Vec::new(),
            remote_only: Vec::new(),
            unresolved: Vec::new(),
            failed_operations: Vec::new(),
            planned: Vec::new(),
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == EpicStatus::Completed
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.fatal)
    }

    #[must_use]
    pub fn entity(&self, id: &str) -> Option<&EntityOutcome> {
        self.entities.iter().find(|e| e.entity_id.as_str() == id)
    }
}

/// Aggregate of a (possibly parallel) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub run_id: String,
    #[serde(default)]
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: SyncCounts,
    pub epic_results: Vec<EpicResult>,
    /// Epics never dispatched (fail-fast, fatal error or cancellation).
    #[serde(default)]
    pub not_started: Vec<String>,
    #[serde(default)]
    pub unresolved_conflicts: Vec<Conflict>,
    #[serde(default)]
    pub failed_operations: Vec<FailedOperation>,
    #[serde(default)]
    pub progress: Vec<EpicProgress>,
    #[serde(default)]
    pub fatal_error: Option<EpicError>,
    #[serde(default)]
    pub cancelled: bool,
}

impl SyncResult {
    /// Aggregate counts, conflicts and failed operations from `epic_results`.
    #[must_use]
    pub fn from_epics(run_id: impl Into<String>, started_at: DateTime<Utc>, epic_results: Vec<EpicResult>) -> Self {
        let mut counts = SyncCounts::default();
        let mut unresolved_conflicts = Vec::new();
        let mut failed_operations = Vec::new();
        for epic in &epic_results {
            counts.add(&epic.counts);
            unresolved_conflicts.extend(epic.unresolved.iter().cloned());
            failed_operations.extend(epic.failed_operations.iter().cloned());
        }
        let fatal_error = epic_results
            .iter()
            .find_map(|e| e.error.as_ref().filter(|err| err.fatal).cloned());
        Self {
            run_id: run_id.into(),
            dry_run: false,
            started_at,
            finished_at: Utc::now(),
            counts,
            epic_results,
            not_started: Vec::new(),
            unresolved_conflicts,
            failed_operations,
            progress: Vec::new(),
            fatal_error,
            cancelled: false,
        }
    }

    /// Every dispatched epic completed and nothing was left behind.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.not_started.is_empty()
            && self.fatal_error.is_none()
            && !self.cancelled
            && self.epic_results.iter().all(EpicResult::is_success)
    }

    #[must_use]
    pub fn epic(&self, key: &str) -> Option<&EpicResult> {
        self.epic_results.iter().find(|e| e.epic_key == key)
    }

    /// Remote mutations applied across all epics.
    #[must_use]
    pub fn operations_applied(&self) -> usize {
        self.epic_results
            .iter()
            .flat_map(|e| &e.entities)
            .map(|o| o.operations)
            .sum()
    }
}
