//! Transactional apply of remote mutations.
//!
//! # State machine
//!
//! ```text
//! PENDING --all operations applied--> COMMITTED
//! PENDING --operation k fails--> roll back applied 1..k-1 in reverse
//!                                  all inverses succeed --> ROLLED_BACK
//!                                  any inverse fails    --> FAILED
//! ```
//!
//! Operations are applied strictly in the order they were pushed. An
//! operation is marked applied only after its tracker call returned success,
//! and only applied operations are rolled back. Each applied operation
//! records its inverse from what the tracker reported (created key, previous
//! field values, old status, comment id).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::idempotency::operation_hash;
use crate::adapter::{AdapterError, MutationOutcome, NewIssue, RetryPolicy, TrackerAdapter, with_retry};
use crate::error::ErrorCode;
use crate::model::{EntityFields, EntityId, EntityKind, Field, FieldValue};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Transition,
    Comment,
    CreateSubtask,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Transition => "TRANSITION",
            Self::Comment => "COMMENT",
            Self::CreateSubtask => "CREATE_SUBTASK",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The issue an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationTarget {
    /// An existing tracker issue (or, for creates, the epic).
    Key(String),
    /// The issue of a local entity created earlier in the same run.
    Pending(EntityId),
}

impl fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Pending(id) => write!(f, "<new {id}>"),
        }
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ForwardPayload {
    /// Create a story under the epic named by the target.
    Create { fields: EntityFields },
    /// Create a subtask under the story named by the target.
    CreateSubtask { fields: EntityFields },
    Update { changes: BTreeMap<Field, FieldValue> },
    Transition { status: String },
    Comment { body: String },
}

impl ForwardPayload {
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Create { .. } => OperationKind::Create,
            Self::CreateSubtask { .. } => OperationKind::CreateSubtask,
            Self::Update { .. } => OperationKind::Update,
            Self::Transition { .. } => OperationKind::Transition,
            Self::Comment { .. } => OperationKind::Comment,
        }
    }
}

/// How to undo an applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "undo", rename_all = "snake_case")]
pub enum InversePayload {
    DeleteIssue { key: String },
    RestoreFields { key: String, previous: BTreeMap<Field, FieldValue> },
    Transition { key: String, status: String },
    DeleteComment { key: String, comment_id: String },
    /// The tracker reported a no-op.
    Nothing,
}

/// One remote mutation inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Position within the transaction, from 1.
    pub seq: usize,
    pub kind: OperationKind,
    pub entity_id: EntityId,
    pub target: OperationTarget,
    pub forward: ForwardPayload,
    /// Set once the operation has been applied.
    pub inverse: Option<InversePayload>,
    pub applied: bool,
    /// Replay-log hash, see [`operation_hash`].
    pub hash: String,
    /// Key of the issue created by a `CREATE`/`CREATE_SUBTASK`.
    pub created_key: Option<String>,
}

impl Operation {
    /// # Errors
    ///
    /// [`TransactionError::Encode`] if the payload cannot be hashed.
    pub fn new(
        entity_id: EntityId,
        target: OperationTarget,
        forward: ForwardPayload,
    ) -> Result<Self, TransactionError> {
        let kind = forward.kind();
        let hash =
            operation_hash(&entity_id, kind, &(&target, &forward)).map_err(|err| TransactionError::Encode {
                entity_id: entity_id.clone(),
                message: err.to_string(),
            })?;
        Ok(Self {
            seq: 0,
            kind,
            entity_id,
            target,
            forward,
            inverse: None,
            applied: false,
            hash,
            created_key: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Pending,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {id} is {state}; operations can only be added while PENDING")]
    NotPending { id: String, state: TransactionState },

    #[error("cannot encode operation for {entity_id}: {message}")]
    Encode { entity_id: EntityId, message: String },
}

impl TransactionError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InternalUnexpected
    }
}

/// An ordered group of operations applied atomically (with rollback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    operations: Vec<Operation>,
    state: TransactionState,
}

impl Transaction {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operations: Vec::new(),
            state: TransactionState::Pending,
        }
    }

    /// Append an operation.
    ///
    /// # Errors
    ///
    /// [`TransactionError::NotPending`] once the transaction has run.
    pub fn push(&mut self, mut operation: Operation) -> Result<&Operation, TransactionError> {
        if self.state != TransactionState::Pending {
            return Err(TransactionError::NotPending {
                id: self.id.clone(),
                state: self.state,
            });
        }
        operation.seq = self.operations.len() + 1;
        self.operations.push(operation);
        Ok(&self.operations[self.operations.len() - 1])
    }

    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// An applied operation whose inverse could not be executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnrolledOperation {
    pub seq: usize,
    pub kind: OperationKind,
    pub entity_id: EntityId,
    pub inverse: InversePayload,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rollback", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// Nothing had been applied before the failure.
    NotNeeded,
    /// Every applied operation was undone.
    RolledBack { operations: usize },
    /// Some inverses failed; these need manual remediation.
    Incomplete { unrolled: Vec<UnrolledOperation> },
}

/// The operation that failed a transaction, and what rollback achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub transaction_id: String,
    pub seq: usize,
    pub kind: OperationKind,
    pub entity_id: EntityId,
    pub target: String,
    pub error: String,
    pub code: String,
    pub rollback: RollbackOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub state: TransactionState,
    /// Number of operations applied (and still applied after rollback, if
    /// rollback was incomplete).
    pub applied: usize,
    pub failed: Option<FailedOperation>,
    /// The error of the failing operation, for fatal-error detection.
    pub error: Option<AdapterError>,
}

impl TransactionOutcome {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.error.as_ref().is_some_and(AdapterError::is_fatal)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Remote keys of entities created so far in the run, by local id.
pub type CreatedKeys = HashMap<EntityId, String>;

/// Applies transactions against a tracker.
#[derive(Clone, Copy)]
pub struct TransactionManager<'a> {
    tracker: &'a dyn TrackerAdapter,
    retry: &'a RetryPolicy,
}

impl<'a> TransactionManager<'a> {
    #[must_use]
    pub const fn new(tracker: &'a dyn TrackerAdapter, retry: &'a RetryPolicy) -> Self {
        Self { tracker, retry }
    }

    /// Apply every operation in order; roll back on the first failure.
    ///
    /// `created` resolves [`OperationTarget::Pending`] targets and receives
    /// the keys of issues created by this transaction (removed again if they
    /// are rolled back). `on_applied` runs after each successful operation.
    pub fn execute(
        &self,
        tx: &mut Transaction,
        created: &mut CreatedKeys,
        on_applied: &mut dyn FnMut(&Operation),
    ) -> TransactionOutcome {
        let span = tracing::debug_span!("transaction", id = %tx.id, ops = tx.operations.len());
        let _enter = span.enter();

        if tx.state != TransactionState::Pending {
            tracing::warn!(state = %tx.state, "transaction already executed");
            return TransactionOutcome {
                state: tx.state,
                applied: tx.operations.iter().filter(|op| op.applied).count(),
                failed: None,
                error: None,
            };
        }

        for idx in 0..tx.operations.len() {
            let result = self.apply(&tx.operations[idx], created);
            match result {
                Ok((inverse, created_key)) => {
                    let op = &mut tx.operations[idx];
                    if let Some(key) = &created_key {
                        created.insert(op.entity_id.clone(), key.clone());
                    }
                    op.created_key = created_key;
                    op.inverse = Some(inverse);
                    op.applied = true;
                    tracing::debug!(seq = op.seq, op = %op.kind, entity = %op.entity_id, "applied");
                    on_applied(op);
                }
                Err(err) => {
                    let failed_op = &tx.operations[idx];
                    tracing::warn!(
                        seq = failed_op.seq,
                        op = %failed_op.kind,
                        entity = %failed_op.entity_id,
                        %err,
                        "operation failed, rolling back"
                    );
                    let (seq, kind, entity_id, target) = (
                        failed_op.seq,
                        failed_op.kind,
                        failed_op.entity_id.clone(),
                        failed_op.target.to_string(),
                    );
                    let rollback = self.rollback(tx, created);
                    tx.state = match rollback {
                        RollbackOutcome::Incomplete { .. } => TransactionState::Failed,
                        _ => TransactionState::RolledBack,
                    };
                    let applied = tx.operations.iter().filter(|op| op.applied).count();
                    return TransactionOutcome {
                        state: tx.state,
                        applied,
                        failed: Some(FailedOperation {
                            transaction_id: tx.id.clone(),
                            seq,
                            kind,
                            entity_id,
                            target,
                            error: err.to_string(),
                            code: err.code().code().to_string(),
                            rollback,
                        }),
                        error: Some(err),
                    };
                }
            }
        }

        tx.state = TransactionState::Committed;
        TransactionOutcome {
            state: tx.state,
            applied: tx.operations.len(),
            failed: None,
            error: None,
        }
    }

    fn resolve(target: &OperationTarget, created: &CreatedKeys) -> Result<String, AdapterError> {
        match target {
            OperationTarget::Key(key) => Ok(key.clone()),
            OperationTarget::Pending(id) => created
                .get(id)
                .cloned()
                .ok_or_else(|| AdapterError::Rejected(format!("'{id}' has not been created in this run"))),
        }
    }

    fn apply(
        &self,
        op: &Operation,
        created: &CreatedKeys,
    ) -> Result<(InversePayload, Option<String>), AdapterError> {
        let key = Self::resolve(&op.target, created)?;
        let name = op.kind.as_str();
        match &op.forward {
            ForwardPayload::Create { fields } => {
                let request = NewIssue {
                    epic_key: key,
                    kind: EntityKind::Story,
                    fields: fields.clone(),
                };
                let issue = with_retry(self.retry, name, || self.tracker.create_issue(&request))?;
                Ok((InversePayload::DeleteIssue { key: issue.key.clone() }, Some(issue.key)))
            }
            ForwardPayload::CreateSubtask { fields } => {
                let issue = with_retry(self.retry, name, || self.tracker.create_subtask(&key, fields))?;
                Ok((InversePayload::DeleteIssue { key: issue.key.clone() }, Some(issue.key)))
            }
            ForwardPayload::Update { changes } => {
                match with_retry(self.retry, name, || self.tracker.update_issue(&key, changes))? {
                    MutationOutcome::Changed { previous } => {
                        Ok((InversePayload::RestoreFields { key, previous }, None))
                    }
                    MutationOutcome::NoOp => Ok((InversePayload::Nothing, None)),
                }
            }
            ForwardPayload::Transition { status } => {
                match with_retry(self.retry, name, || self.tracker.transition(&key, status))? {
                    MutationOutcome::Changed { previous } => {
                        let old = previous
                            .get(&Field::Status)
                            .and_then(FieldValue::as_text)
                            .unwrap_or_default()
                            .to_string();
                        Ok((InversePayload::Transition { key, status: old }, None))
                    }
                    MutationOutcome::NoOp => Ok((InversePayload::Nothing, None)),
                }
            }
            ForwardPayload::Comment { body } => {
                let comment_id = with_retry(self.retry, name, || self.tracker.add_comment(&key, body))?;
                Ok((InversePayload::DeleteComment { key, comment_id }, None))
            }
        }
    }

    fn undo(&self, inverse: &InversePayload) -> Result<(), AdapterError> {
        let result = match inverse {
            InversePayload::DeleteIssue { key } => {
                with_retry(self.retry, "DELETE_ISSUE", || self.tracker.delete_issue(key))
            }
            InversePayload::RestoreFields { key, previous } => {
                with_retry(self.retry, "RESTORE_FIELDS", || self.tracker.update_issue(key, previous)).map(|_| ())
            }
            InversePayload::Transition { key, status } => {
                with_retry(self.retry, "TRANSITION_BACK", || self.tracker.transition(key, status)).map(|_| ())
            }
            InversePayload::DeleteComment { key, comment_id } => with_retry(self.retry, "DELETE_COMMENT", || {
                self.tracker.delete_comment(key, comment_id)
            }),
            InversePayload::Nothing => Ok(()),
        };
        match result {
            // Already gone is as good as deleted.
            Err(err)
                if err.is_not_found()
                    && matches!(
                        inverse,
                        InversePayload::DeleteIssue { .. } | InversePayload::DeleteComment { .. }
                    ) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn rollback(&self, tx: &mut Transaction, created: &mut CreatedKeys) -> RollbackOutcome {
        let mut undone = 0;
        let mut unrolled = Vec::new();
        for op in tx.operations.iter_mut().rev().filter(|op| op.applied) {
            let Some(inverse) = op.inverse.clone() else {
                continue;
            };
            match self.undo(&inverse) {
                Ok(()) => {
                    op.applied = false;
                    undone += 1;
                    if op.created_key.is_some() {
                        created.remove(&op.entity_id);
                    }
                    tracing::debug!(seq = op.seq, op = %op.kind, "rolled back");
                }
                Err(err) => {
                    tracing::error!(seq = op.seq, op = %op.kind, entity = %op.entity_id, %err, "rollback failed");
                    unrolled.push(UnrolledOperation {
                        seq: op.seq,
                        kind: op.kind,
                        entity_id: op.entity_id.clone(),
                        inverse,
                        error: err.to_string(),
                    });
                }
            }
        }
        if !unrolled.is_empty() {
            RollbackOutcome::Incomplete { unrolled }
        } else if undone == 0 {
            RollbackOutcome::NotNeeded
        } else {
            RollbackOutcome::RolledBack { operations: undone }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{FailureRule, InMemoryTracker, TrackerOp};

    fn tracker_with_story() -> (InMemoryTracker, String) {
        let tracker = InMemoryTracker::default();
        tracker.insert_epic("EPIC-1", "Checkout");
        let key = tracker.seed_story("EPIC-1", EntityFields::titled("Old"), None);
        (tracker, key)
    }

    fn update(key: &str, title: &str) -> Operation {
        Operation::new(
            "US-1".into(),
            OperationTarget::Key(key.into()),
            ForwardPayload::Update {
                changes: BTreeMap::from([(Field::Title, FieldValue::text(title))]),
            },
        )
        .unwrap()
    }

    fn run(tracker: &InMemoryTracker, tx: &mut Transaction) -> TransactionOutcome {
        let retry = RetryPolicy::immediate(1);
        let mut created = CreatedKeys::new();
        TransactionManager::new(tracker, &retry).execute(tx, &mut created, &mut |_| {})
    }

    #[test]
    fn all_applied_commits() {
        let (tracker, key) = tracker_with_story();
        let mut tx = Transaction::new("tx-1");
        tx.push(update(&key, "New")).unwrap();
        tx.push(Operation::new(
            "US-1".into(),
            OperationTarget::Key(key.clone()),
            ForwardPayload::Transition { status: "Done".into() },
        )
        .unwrap())
        .unwrap();

        let outcome = run(&tracker, &mut tx);
        assert!(outcome.is_committed());
        assert_eq!(outcome.applied, 2);
        assert!(tx.operations().iter().all(|op| op.applied));
        assert_eq!(
            tx.operations()[1].inverse,
            Some(InversePayload::Transition {
                key: key.clone(),
                status: "To Do".into()
            })
        );
        assert_eq!(tracker.issue(&key).unwrap().fields.status, "Done");
    }

    #[test]
    fn push_after_commit_is_rejected() {
        let (tracker, key) = tracker_with_story();
        let mut tx = Transaction::new("tx-1");
        run(&tracker, &mut tx);
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(matches!(
            tx.push(update(&key, "x")),
            Err(TransactionError::NotPending { .. })
        ));
    }

    #[test]
    fn failure_rolls_back_in_reverse_order() {
        let (tracker, key) = tracker_with_story();
        tracker.fail_on(FailureRule::on(TrackerOp::AddComment, AdapterError::Rejected("closed".into())));
        let mut tx = Transaction::new("tx-1");
        tx.push(update(&key, "New")).unwrap();
        tx.push(Operation::new(
            "US-1".into(),
            OperationTarget::Key(key.clone()),
            ForwardPayload::Transition { status: "Done".into() },
        )
        .unwrap())
        .unwrap();
        tx.push(Operation::new(
            "US-1".into(),
            OperationTarget::Key(key.clone()),
            ForwardPayload::Comment { body: "hi".into() },
        )
        .unwrap())
        .unwrap();

        let outcome = run(&tracker, &mut tx);
        assert_eq!(outcome.state, TransactionState::RolledBack);
        let failed = outcome.failed.unwrap();
        assert_eq!(failed.seq, 3);
        assert_eq!(failed.rollback, RollbackOutcome::RolledBack { operations: 2 });

        let issue = tracker.issue(&key).unwrap();
        assert_eq!(issue.fields.title, "Old");
        assert_eq!(issue.fields.status, "To Do");

        let mutating: Vec<TrackerOp> = tracker
            .calls()
            .iter()
            .filter(|c| c.ok && c.op.is_mutating())
            .map(|c| c.op)
            .collect();
        assert_eq!(
            mutating,
            vec![
                TrackerOp::UpdateIssue,
                TrackerOp::Transition,
                TrackerOp::Transition,
                TrackerOp::UpdateIssue
            ]
        );
    }

    #[test]
    fn failing_inverse_marks_transaction_failed() {
        let (tracker, key) = tracker_with_story();
        let mut tx = Transaction::new("tx-1");
        tx.push(update(&key, "New")).unwrap();
        tx.push(Operation::new(
            "US-1".into(),
            OperationTarget::Key(key.clone()),
            ForwardPayload::Comment { body: "note".into() },
        )
        .unwrap())
        .unwrap();
        tx.push(Operation::new(
            "US-1".into(),
            OperationTarget::Key(key.clone()),
            ForwardPayload::Transition { status: "Done".into() },
        )
        .unwrap())
        .unwrap();
        tracker.fail_on(FailureRule::on(TrackerOp::Transition, AdapterError::transient("503")));
        tracker.fail_on(FailureRule::on(TrackerOp::DeleteComment, AdapterError::transient("503")));

        let outcome = run(&tracker, &mut tx);
        assert_eq!(outcome.state, TransactionState::Failed);
        assert_eq!(outcome.applied, 1);
        let failed = outcome.failed.unwrap();
        assert_eq!(failed.seq, 3);
        let RollbackOutcome::Incomplete { unrolled } = failed.rollback else {
            panic!("expected incomplete rollback");
        };
        assert_eq!(unrolled.len(), 1);
        assert_eq!(unrolled[0].kind, OperationKind::Comment);
        assert_eq!(tracker.issue(&key).unwrap().fields.title, "Old");
        assert_eq!(tracker.comments_on(&key), vec!["note".to_string()]);
    }

    #[test]
    fn first_operation_failure_needs_no_rollback() {
        let (tracker, key) = tracker_with_story();
        tracker.fail_on(FailureRule::on(TrackerOp::UpdateIssue, AdapterError::Permission("ro".into())));
        let mut tx = Transaction::new("tx-1");
        tx.push(update(&key, "New")).unwrap();
        let outcome = run(&tracker, &mut tx);
        assert_eq!(outcome.state, TransactionState::RolledBack);
        assert!(outcome.is_fatal());
        assert_eq!(outcome.failed.unwrap().rollback, RollbackOutcome::NotNeeded);
    }

    #[test]
    fn subtask_resolves_parent_created_in_same_transaction() {
        let tracker = InMemoryTracker::default();
        tracker.insert_epic("EPIC-1", "Checkout");
        let mut tx = Transaction::new("tx-1");
        tx.push(Operation::new(
            "US-1".into(),
            OperationTarget::Key("EPIC-1".into()),
            ForwardPayload::Create {
                fields: EntityFields::titled("Parent"),
            },
        )
        .unwrap())
        .unwrap();
        tx.push(Operation::new(
            "US-1.1".into(),
            OperationTarget::Pending("US-1".into()),
            ForwardPayload::CreateSubtask {
                fields: EntityFields::titled("Child"),
            },
        )
        .unwrap())
        .unwrap();

        let retry = RetryPolicy::immediate(1);
        let mut created = CreatedKeys::new();
        let mut seen = Vec::new();
        let outcome = TransactionManager::new(&tracker, &retry).execute(&mut tx, &mut created, &mut |op| {
            seen.push(op.seq);
        });
        assert!(outcome.is_committed());
        assert_eq!(seen, vec![1, 2]);
        let parent = &created[&EntityId::new("US-1")];
        let child = tracker.issue(&created[&EntityId::new("US-1.1")]).unwrap();
        assert_eq!(child.parent_key.as_ref(), Some(parent));
    }

    #[test]
    fn rolled_back_create_is_deleted_and_forgotten() {
        let tracker = InMemoryTracker::default();
        tracker.insert_epic("EPIC-1", "Checkout");
        tracker.fail_on(FailureRule::on(TrackerOp::CreateSubtask, AdapterError::transient("503")));
        let mut tx = Transaction::new("tx-1");
        tx.push(Operation::new(
            "US-1".into(),
            OperationTarget::Key("EPIC-1".into()),
            ForwardPayload::Create {
                fields: EntityFields::titled("Parent"),
            },
        )
        .unwrap())
        .unwrap();
        tx.push(Operation::new(
            "US-1.1".into(),
            OperationTarget::Pending("US-1".into()),
            ForwardPayload::CreateSubtask {
                fields: EntityFields::titled("Child"),
            },
        )
        .unwrap())
        .unwrap();

        let retry = RetryPolicy::immediate(2);
        let mut created = CreatedKeys::new();
        let outcome = TransactionManager::new(&tracker, &retry).execute(&mut tx, &mut created, &mut |_| {});
        assert_eq!(outcome.state, TransactionState::RolledBack);
        assert!(created.is_empty());
        assert!(tracker.issues().is_empty());
    }

    #[test]
    fn operation_hash_is_stable_for_equal_operations() {
        assert_eq!(update("PROJ-1", "A").hash, update("PROJ-1", "A").hash);
        assert_ne!(update("PROJ-1", "A").hash, update("PROJ-2", "A").hash);
    }
}
