//! Collaborator contracts consumed by the sync engine.
//!
//! The engine never talks to a concrete tracker or document format. It is
//! handed a [`TrackerAdapter`] for the remote side and a [`DocumentStore`]
//! for the local side; both are object-safe and `Send + Sync` so one
//! instance can serve every worker of a parallel run.
//!
//! ## Submodules
//!
//! - [`memory`]: in-memory tracker with call recording and failure rules.
//! - [`document`]: in-memory document store and the JSON document parser.
//! - [`rate_limit`]: token bucket and the [`RateLimitedTracker`] decorator.
//! - [`retry`]: bounded exponential backoff for transient failures.

pub mod document;
pub mod memory;
pub mod rate_limit;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::model::{Entity, EntityFields, EntityId, EntityKind, Epic, Field, FieldValue};

pub use document::{InMemoryDocument, JsonDocumentParser};
pub use memory::{FailureRule, InMemoryTracker, TrackerCall, TrackerOp};
pub use rate_limit::{RateLimitedTracker, TokenBucket};
pub use retry::{RetryPolicy, with_retry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures at the tracker and document boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Network failure or 5xx; worth retrying.
    #[error("transient tracker failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// HTTP 429 or equivalent.
    #[error("tracker rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("tracker authentication failed: {0}")]
    Authentication(String),

    #[error("tracker permission denied: {0}")]
    Permission(String),

    #[error("issue '{key}' not found")]
    NotFound { key: String },

    /// The tracker refused the request as malformed or invalid.
    #[error("tracker rejected the request: {0}")]
    Rejected(String),

    #[error("local document error: {0}")]
    Document(String),
}

impl AdapterError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Network, 5xx and rate-limit failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    /// Authentication and permission failures end the whole run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Permission(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Server-provided wait before the next attempt, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } | Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transient { .. } => ErrorCode::TransientFailure,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Authentication(_) => ErrorCode::AuthenticationFailed,
            Self::Permission(_) => ErrorCode::PermissionDenied,
            Self::NotFound { .. } => ErrorCode::EntityNotFound,
            Self::Rejected(_) => ErrorCode::TrackerRejected,
            Self::Document(_) => ErrorCode::DocumentUnreadable,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker contract
// ---------------------------------------------------------------------------

/// An issue as the tracker reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub key: String,
    pub kind: EntityKind,
    /// Key of the parent story, for subtasks.
    #[serde(default)]
    pub parent_key: Option<String>,
    pub fields: EntityFields,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Request to create a story under an epic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIssue {
    pub epic_key: String,
    pub kind: EntityKind,
    pub fields: EntityFields,
}

/// What a mutating call did, with enough detail to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOutcome {
    /// The issue changed; `previous` holds the overwritten values.
    Changed { previous: BTreeMap<Field, FieldValue> },
    /// The issue already had the requested values.
    NoOp,
}

/// The remote side of a sync.
///
/// Every mutating call reports what it overwrote (or that it was a no-op),
/// which is what the transaction manager turns into rollback payloads.
pub trait TrackerAdapter: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// [`AdapterError::NotFound`] if the issue does not exist.
    fn get_issue(&self, key: &str) -> Result<RemoteIssue, AdapterError>;

    /// Stories of an epic and their subtasks.
    ///
    /// # Errors
    ///
    /// Any [`AdapterError`] from the tracker.
    fn list_epic_children(&self, epic_key: &str) -> Result<Vec<RemoteIssue>, AdapterError>;

    /// # Errors
    ///
    /// Any [`AdapterError`] from the tracker.
    fn create_issue(&self, issue: &NewIssue) -> Result<RemoteIssue, AdapterError>;

    /// # Errors
    ///
    /// [`AdapterError::NotFound`] if the parent does not exist.
    fn create_subtask(&self, parent_key: &str, fields: &EntityFields) -> Result<RemoteIssue, AdapterError>;

    /// Overwrite the given fields. Status changes go through
    /// [`TrackerAdapter::transition`].
    ///
    /// # Errors
    ///
    /// Any [`AdapterError`] from the tracker.
    fn update_issue(
        &self,
        key: &str,
        changes: &BTreeMap<Field, FieldValue>,
    ) -> Result<MutationOutcome, AdapterError>;

    /// Move an issue to `status`. `previous` carries the old status.
    ///
    /// # Errors
    ///
    /// Any [`AdapterError`] from the tracker.
    fn transition(&self, key: &str, status: &str) -> Result<MutationOutcome, AdapterError>;

    /// Returns the new comment's id.
    ///
    /// # Errors
    ///
    /// Any [`AdapterError`] from the tracker.
    fn add_comment(&self, key: &str, body: &str) -> Result<String, AdapterError>;

    /// # Errors
    ///
    /// Any [`AdapterError`] from the tracker.
    fn delete_issue(&self, key: &str) -> Result<(), AdapterError>;

    /// # Errors
    ///
    /// Any [`AdapterError`] from the tracker.
    fn delete_comment(&self, key: &str, comment_id: &str) -> Result<(), AdapterError>;
}

/// Shared trackers can be wrapped by decorators like any other.
impl<T: TrackerAdapter + ?Sized> TrackerAdapter for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn get_issue(&self, key: &str) -> Result<RemoteIssue, AdapterError> {
        (**self).get_issue(key)
    }

    fn list_epic_children(&self, epic_key: &str) -> Result<Vec<RemoteIssue>, AdapterError> {
        (**self).list_epic_children(epic_key)
    }

    fn create_issue(&self, issue: &NewIssue) -> Result<RemoteIssue, AdapterError> {
        (**self).create_issue(issue)
    }

    fn create_subtask(&self, parent_key: &str, fields: &EntityFields) -> Result<RemoteIssue, AdapterError> {
        (**self).create_subtask(parent_key, fields)
    }

    fn update_issue(
        &self,
        key: &str,
        changes: &BTreeMap<Field, FieldValue>,
    ) -> Result<MutationOutcome, AdapterError> {
        (**self).update_issue(key, changes)
    }

    fn transition(&self, key: &str, status: &str) -> Result<MutationOutcome, AdapterError> {
        (**self).transition(key, status)
    }

    fn add_comment(&self, key: &str, body: &str) -> Result<String, AdapterError> {
        (**self).add_comment(key, body)
    }

    fn delete_issue(&self, key: &str) -> Result<(), AdapterError> {
        (**self).delete_issue(key)
    }

    fn delete_comment(&self, key: &str, comment_id: &str) -> Result<(), AdapterError> {
        (**self).delete_comment(key, comment_id)
    }
}

// ---------------------------------------------------------------------------
// Document contract
// ---------------------------------------------------------------------------

/// A change to write back into the local document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum LocalChange {
    /// Replace every tracked field of an entity.
    Update {
        entity_id: EntityId,
        fields: EntityFields,
        modified_at: Option<DateTime<Utc>>,
    },
    /// Record the tracker key of a newly created or matched entity.
    AssignRemoteKey { entity_id: EntityId, remote_key: String },
    /// Drop an entity the tracker deleted.
    Remove { entity_id: EntityId },
    /// Bring back an entity the document deleted.
    Restore { entity: Entity },
}

impl LocalChange {
    #[must_use]
    pub const fn entity_id(&self) -> &EntityId {
        match self {
            Self::Update { entity_id, .. }
            | Self::AssignRemoteKey { entity_id, .. }
            | Self::Remove { entity_id } => entity_id,
            Self::Restore { entity } => &entity.id,
        }
    }
}

/// The local side of a sync.
pub trait DocumentStore: Send + Sync {
    /// # Errors
    ///
    /// [`AdapterError::Document`] if the epic cannot be read.
    fn load_epic(&self, epic_key: &str) -> Result<Epic, AdapterError>;

    /// Apply all changes for one epic, in order.
    ///
    /// # Errors
    ///
    /// [`AdapterError::Document`] if the document cannot be written; no
    /// change is applied in that case.
    fn apply_local_changes(&self, epic_key: &str, changes: &[LocalChange]) -> Result<(), AdapterError>;
}

/// Turns a document source into epics with stable local ids.
pub trait DocumentParser {
    /// # Errors
    ///
    /// [`AdapterError::Document`] on malformed input.
    fn parse_epics(&self, source: &str) -> Result<Vec<Epic>, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_taxonomy() {
        assert!(AdapterError::transient("503").is_transient());
        assert!(AdapterError::RateLimited { retry_after: None }.is_transient());
        assert!(AdapterError::Authentication("expired".into()).is_fatal());
        assert!(AdapterError::Permission("project".into()).is_fatal());
        assert!(AdapterError::not_found("PROJ-1").is_not_found());
        assert!(!AdapterError::Rejected("bad".into()).is_transient());
        assert!(!AdapterError::not_found("PROJ-1").is_fatal());
    }

    #[test]
    fn retry_after_only_on_retryable_errors() {
        let wait = Duration::from_millis(250);
        assert_eq!(
            AdapterError::RateLimited { retry_after: Some(wait) }.retry_after(),
            Some(wait)
        );
        assert_eq!(AdapterError::Authentication("x".into()).retry_after(), None);
    }

    #[test]
    fn errors_map_to_codes() {
        assert_eq!(
            AdapterError::Permission("x".into()).code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(AdapterError::not_found("K").code().code(), "E2001");
    }
}
