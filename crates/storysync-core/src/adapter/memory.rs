//! In-memory tracker.
//!
//! Behaves like a small issue tracker: sequential keys, epics with child
//! stories, subtasks under stories, comments. Every call is recorded, and
//! [`FailureRule`]s make chosen calls fail so retry, rollback and fatal-error
//! paths can be driven deterministically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{AdapterError, MutationOutcome, NewIssue, RemoteIssue, TrackerAdapter};
use crate::model::{EntityFields, EntityKind, Field, FieldValue};

/// Tracker calls, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerOp {
    GetIssue,
    ListChildren,
    CreateIssue,
    CreateSubtask,
    UpdateIssue,
    Transition,
    AddComment,
    DeleteIssue,
    DeleteComment,
}

impl TrackerOp {
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::GetIssue | Self::ListChildren)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerCall {
    pub op: TrackerOp,
    pub key: Option<String>,
    pub ok: bool,
}

/// Makes matching calls fail with `error`.
///
/// `op` and `key` of `None` match anything. A rule with `times` set is
/// dropped after failing that many calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRule {
    pub op: Option<TrackerOp>,
    pub key: Option<String>,
    pub error: AdapterError,
    pub times: Option<u32>,
}

impl FailureRule {
    #[must_use]
    pub const fn on(op: TrackerOp, error: AdapterError) -> Self {
        Self {
            op: Some(op),
            key: None,
            error,
            times: None,
        }
    }

    #[must_use]
    pub const fn any(error: AdapterError) -> Self {
        Self {
            op: None,
            key: None,
            error,
            times: None,
        }
    }

    #[must_use]
    pub fn for_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub const fn times(mut self, n: u32) -> Self {
        self.times = Some(n);
        self
    }

    fn matches(&self, op: TrackerOp, key: Option<&str>) -> bool {
        self.op.is_none_or(|o| o == op)
            && self
                .key
                .as_deref()
                .is_none_or(|k| key == Some(k))
    }
}

#[derive(Debug, Clone)]
struct StoredIssue {
    seq: u64,
    epic_key: Option<String>,
    issue: RemoteIssue,
}

#[derive(Debug, Clone)]
struct Comment {
    issue_key: String,
    body: String,
}

#[derive(Debug, Default)]
struct State {
    issues: BTreeMap<String, StoredIssue>,
    comments: BTreeMap<String, Comment>,
    next_issue: u64,
    next_comment: u64,
    calls: Vec<TrackerCall>,
    rules: Vec<FailureRule>,
}

impl State {
    fn take_failure(&mut self, op: TrackerOp, key: Option<&str>) -> Option<AdapterError> {
        let pos = self.rules.iter().position(|rule| rule.matches(op, key))?;
        let rule = &mut self.rules[pos];
        let error = rule.error.clone();
        if let Some(times) = rule.times.as_mut() {
            *times = times.saturating_sub(1);
            if *times == 0 {
                self.rules.remove(pos);
            }
        }
        Some(error)
    }

    fn insert(
        &mut self,
        prefix: &str,
        epic_key: Option<String>,
        kind: EntityKind,
        parent_key: Option<String>,
        fields: EntityFields,
        updated_at: Option<DateTime<Utc>>,
    ) -> RemoteIssue {
        self.next_issue += 1;
        let key = format!("{prefix}-{}", self.next_issue);
        let issue = RemoteIssue {
            key: key.clone(),
            kind,
            parent_key,
            fields,
            updated_at,
        };
        self.issues.insert(
            key,
            StoredIssue {
                seq: self.next_issue,
                epic_key,
                issue: issue.clone(),
            },
        );
        issue
    }

    fn get_mut(&mut self, key: &str) -> Result<&mut StoredIssue, AdapterError> {
        self.issues
            .get_mut(key)
            .ok_or_else(|| AdapterError::not_found(key))
    }
}

/// A tracker held entirely in memory.
#[derive(Debug)]
pub struct InMemoryTracker {
    name: String,
    prefix: String,
    latency: Duration,
    state: Mutex<State>,
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new("PROJ")
    }
}

impl InMemoryTracker {
    /// Keys are issued as `<prefix>-<n>`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            name: "memory".to_string(),
            prefix: prefix.into(),
            latency: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    /// Sleep this long inside every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call<T>(
        &self,
        op: TrackerOp,
        key: Option<&str>,
        f: impl FnOnce(&mut State) -> Result<T, AdapterError>,
    ) -> Result<T, AdapterError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let mut state = self.lock();
        let result = match state.take_failure(op, key) {
            Some(err) => Err(err),
            None => f(&mut state),
        };
        state.calls.push(TrackerCall {
            op,
            key: key.map(str::to_string),
            ok: result.is_ok(),
        });
        result
    }

    // -- Seeding and inspection (not recorded in the call log) -------------

    /// Create an epic issue with a fixed key.
    pub fn insert_epic(&self, key: impl Into<String>, title: impl Into<String>) {
        let key = key.into();
        let mut state = self.lock();
        state.next_issue += 1;
        let seq = state.next_issue;
        state.issues.insert(
            key.clone(),
            StoredIssue {
                seq,
                epic_key: None,
                issue: RemoteIssue {
                    key,
                    kind: EntityKind::Epic,
                    parent_key: None,
                    fields: EntityFields::titled(title),
                    updated_at: None,
                },
            },
        );
    }

    /// Create a story under an epic as if another user had.
    pub fn seed_story(
        &self,
        epic_key: &str,
        fields: EntityFields,
        updated_at: Option<DateTime<Utc>>,
    ) -> String {
        let prefix = self.prefix.clone();
        self.lock()
            .insert(
                &prefix,
                Some(epic_key.to_string()),
                EntityKind::Story,
                None,
                fields,
                updated_at,
            )
            .key
    }

    /// Create a subtask under a story as if another user had.
    pub fn seed_subtask(&self, parent_key: &str, fields: EntityFields) -> Option<String> {
        let prefix = self.prefix.clone();
        let mut state = self.lock();
        let epic_key = state.issues.get(parent_key)?.epic_key.clone();
        Some(
            state
                .insert(
                    &prefix,
                    epic_key,
                    EntityKind::Subtask,
                    Some(parent_key.to_string()),
                    fields,
                    None,
                )
                .key,
        )
    }

    /// Edit an issue as if another user had. Returns `false` if missing.
    pub fn edit(
        &self,
        key: &str,
        at: DateTime<Utc>,
        f: impl FnOnce(&mut EntityFields),
    ) -> bool {
        let mut state = self.lock();
        let Some(stored) = state.issues.get_mut(key) else {
            return false;
        };
        f(&mut stored.issue.fields);
        stored.issue.updated_at = Some(at);
        true
    }

    /// Delete an issue as if another user had.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().issues.remove(key).is_some()
    }

    #[must_use]
    pub fn issue(&self, key: &str) -> Option<RemoteIssue> {
        self.lock().issues.get(key).map(|s| s.issue.clone())
    }

    /// Every non-epic issue, in creation order.
    #[must_use]
    pub fn issues(&self) -> Vec<RemoteIssue> {
        let state = self.lock();
        let mut stored: Vec<&StoredIssue> = state
            .issues
            .values()
            .filter(|s| s.issue.kind != EntityKind::Epic)
            .collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| s.issue.clone()).collect()
    }

    /// Bodies of the comments on an issue, oldest first.
    #[must_use]
    pub fn comments_on(&self, key: &str) -> Vec<String> {
        self.lock()
            .comments
            .values()
            .filter(|c| c.issue_key == key)
            .map(|c| c.body.clone())
            .collect()
    }

    pub fn fail_on(&self, rule: FailureRule) {
        self.lock().rules.push(rule);
    }

    pub fn clear_failures(&self) {
        self.lock().rules.clear();
    }

    #[must_use]
    pub fn calls(&self) -> Vec<TrackerCall> {
        self.lock().calls.clone()
    }

    /// Successful mutating calls since the last [`InMemoryTracker::reset_calls`].
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.ok && c.op.is_mutating())
            .count()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }
}

impl TrackerAdapter for InMemoryTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_issue(&self, key: &str) -> Result<RemoteIssue, AdapterError> {
        self.call(TrackerOp::GetIssue, Some(key), |state| {
            state
                .issues
                .get(key)
                .map(|s| s.issue.clone())
                .ok_or_else(|| AdapterError::not_found(key))
        })
    }

    fn list_epic_children(&self, epic_key: &str) -> Result<Vec<RemoteIssue>, AdapterError> {
        self.call(TrackerOp::ListChildren, Some(epic_key), |state| {
            if !state.issues.contains_key(epic_key) {
                return Err(AdapterError::not_found(epic_key));
            }
            let mut children: Vec<&StoredIssue> = state
                .issues
                .values()
                .filter(|s| s.epic_key.as_deref() == Some(epic_key))
                .collect();
            children.sort_by_key(|s| s.seq);
            Ok(children.into_iter().map(|s| s.issue.clone()).collect())
        })
    }

    fn create_issue(&self, issue: &NewIssue) -> Result<RemoteIssue, AdapterError> {
        self.call(TrackerOp::CreateIssue, Some(&issue.epic_key), |state| {
            if !state.issues.contains_key(&issue.epic_key) {
                return Err(AdapterError::not_found(&issue.epic_key));
            }
            Ok(state.insert(
                &self.prefix,
                Some(issue.epic_key.clone()),
                issue.kind,
                None,
                issue.fields.clone(),
                Some(Utc::now()),
            ))
        })
    }

    fn create_subtask(&self, parent_key: &str, fields: &EntityFields) -> Result<RemoteIssue, AdapterError> {
        self.call(TrackerOp::CreateSubtask, Some(parent_key), |state| {
            let epic_key = state.get_mut(parent_key)?.epic_key.clone();
            Ok(state.insert(
                &self.prefix,
                epic_key,
                EntityKind::Subtask,
                Some(parent_key.to_string()),
                fields.clone(),
                Some(Utc::now()),
            ))
        })
    }

    fn update_issue(
        &self,
        key: &str,
        changes: &BTreeMap<Field, FieldValue>,
    ) -> Result<MutationOutcome, AdapterError> {
        self.call(TrackerOp::UpdateIssue, Some(key), |state| {
            let stored = state.get_mut(key)?;
            let mut fields = stored.issue.fields.clone();
            let mut previous = BTreeMap::new();
            for (field, value) in changes {
                let old = fields.get(*field);
                if old == *value {
                    continue;
                }
                fields
                    .set(*field, value.clone())
                    .map_err(|err| AdapterError::Rejected(err.to_string()))?;
                previous.insert(*field, old);
            }
            if previous.is_empty() {
                return Ok(MutationOutcome::NoOp);
            }
            stored.issue.fields = fields;
            stored.issue.updated_at = Some(Utc::now());
            Ok(MutationOutcome::Changed { previous })
        })
    }

    fn transition(&self, key: &str, status: &str) -> Result<MutationOutcome, AdapterError> {
        self.call(TrackerOp::Transition, Some(key), |state| {
            let stored = state.get_mut(key)?;
            if stored.issue.fields.status == status {
                return Ok(MutationOutcome::NoOp);
            }
            let old = std::mem::replace(&mut stored.issue.fields.status, status.to_string());
            stored.issue.updated_at = Some(Utc::now());
            Ok(MutationOutcome::Changed {
                previous: BTreeMap::from([(Field::Status, FieldValue::text(old))]),
            })
        })
    }

    fn add_comment(&self, key: &str, body: &str) -> Result<String, AdapterError> {
        self.call(TrackerOp::AddComment, Some(key), |state| {
            state.get_mut(key)?;
            state.next_comment += 1;
            let id = format!("c{}", state.next_comment);
            state.comments.insert(
                id.clone(),
                Comment {
                    issue_key: key.to_string(),
                    body: body.to_string(),
                },
            );
            Ok(id)
        })
    }

    fn delete_issue(&self, key: &str) -> Result<(), AdapterError> {
        self.call(TrackerOp::DeleteIssue, Some(key), |state| {
            state
                .issues
                .remove(key)
                .ok_or_else(|| AdapterError::not_found(key))?;
            state
                .issues
                .retain(|_, s| s.issue.parent_key.as_deref() != Some(key));
            state.comments.retain(|_, c| c.issue_key != key);
            Ok(())
        })
    }

    fn delete_comment(&self, key: &str, comment_id: &str) -> Result<(), AdapterError> {
        self.call(TrackerOp::DeleteComment, Some(key), |state| {
            match state.comments.get(comment_id) {
                Some(c) if c.issue_key == key => {
                    state.comments.remove(comment_id);
                    Ok(())
                }
                _ => Err(AdapterError::not_found(comment_id)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> InMemoryTracker {
        let t = InMemoryTracker::default();
        t.insert_epic("EPIC-1", "Checkout");
        t
    }

    #[test]
    fn create_and_list_children_in_creation_order() {
        let t = tracker();
        let a = t
            .create_issue(&NewIssue {
                epic_key: "EPIC-1".into(),
                kind: EntityKind::Story,
                fields: EntityFields::titled("A"),
            })
            .unwrap();
        let sub = t.create_subtask(&a.key, &EntityFields::titled("A.1")).unwrap();
        let children = t.list_epic_children("EPIC-1").unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].key, a.key);
        assert_eq!(children[1].parent_key.as_deref(), Some(a.key.as_str()));
        assert_eq!(sub.kind, EntityKind::Subtask);
    }

    #[test]
    fn update_reports_previous_values_and_noops() {
        let t = tracker();
        let key = t.seed_story("EPIC-1", EntityFields::titled("A"), None);
        let changes = BTreeMap::from([(Field::Title, FieldValue::text("B"))]);
        let outcome = t.update_issue(&key, &changes).unwrap();
        assert_eq!(
            outcome,
            MutationOutcome::Changed {
                previous: BTreeMap::from([(Field::Title, FieldValue::text("A"))])
            }
        );
        assert_eq!(t.update_issue(&key, &changes).unwrap(), MutationOutcome::NoOp);
        assert_eq!(t.mutation_count(), 2);
    }

    #[test]
    fn transition_returns_old_status() {
        let t = tracker();
        let key = t.seed_story("EPIC-1", EntityFields::titled("A"), None);
        let MutationOutcome::Changed { previous } = t.transition(&key, "Done").unwrap() else {
            panic!("expected a change");
        };
        assert_eq!(previous[&Field::Status], FieldValue::text("To Do"));
        assert_eq!(t.issue(&key).unwrap().fields.status, "Done");
    }

    #[test]
    fn failure_rules_fire_then_expire() {
        let t = tracker();
        let key = t.seed_story("EPIC-1", EntityFields::titled("A"), None);
        t.fail_on(FailureRule::on(TrackerOp::Transition, AdapterError::transient("503")).times(1));
        assert!(t.transition(&key, "Done").unwrap_err().is_transient());
        assert!(t.transition(&key, "Done").is_ok());
        let calls = t.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].ok);
    }

    #[test]
    fn key_scoped_rule_only_hits_that_key() {
        let t = tracker();
        let a = t.seed_story("EPIC-1", EntityFields::titled("A"), None);
        let b = t.seed_story("EPIC-1", EntityFields::titled("B"), None);
        t.fail_on(FailureRule::any(AdapterError::Permission("no".into())).for_key(&a));
        assert!(t.get_issue(&a).unwrap_err().is_fatal());
        assert!(t.get_issue(&b).is_ok());
    }

    #[test]
    fn delete_issue_removes_subtasks_and_comments() {
        let t = tracker();
        let a = t.seed_story("EPIC-1", EntityFields::titled("A"), None);
        let sub = t.seed_subtask(&a, EntityFields::titled("A.1")).unwrap();
        t.add_comment(&a, "hello").unwrap();
        t.delete_issue(&a).unwrap();
        assert!(t.issue(&sub).is_none());
        assert!(t.comments_on(&a).is_empty());
        assert!(t.get_issue(&a).unwrap_err().is_not_found());
    }

    #[test]
    fn comments_can_be_deleted() {
        let t = tracker();
        let a = t.seed_story("EPIC-1", EntityFields::titled("A"), None);
        let id = t.add_comment(&a, "note").unwrap();
        assert_eq!(t.comments_on(&a), vec!["note".to_string()]);
        t.delete_comment(&a, &id).unwrap();
        assert!(t.comments_on(&a).is_empty());
        assert!(t.delete_comment(&a, &id).is_err());
    }
}
