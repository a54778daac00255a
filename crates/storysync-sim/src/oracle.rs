//! Checks run against the state a campaign round leaves behind.
//!
//! - **Accounting**: every local entity of an epic that ran has exactly one
//!   disposition in the result.
//! - **Convergence**: after a fault-free round, every entity that did not
//!   fail or wait on an operator is identical (by fingerprint) on both
//!   sides.
//! - **Idempotence**: a further round on unchanged input mutates nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use storysync_core::adapter::{InMemoryDocument, InMemoryTracker};
use storysync_core::fingerprint;
use storysync_core::model::{Epic, Field};
use storysync_core::sync::{EntityDisposition, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    /// A local entity got no disposition, or more than one.
    Accounting {
        round: String,
        epic: String,
        entity: String,
        outcomes: usize,
    },
    /// A synced entity never received a remote key.
    Unsynced { epic: String, entity: String },
    /// The entity's remote key points at nothing.
    MissingIssue { entity: String, key: String },
    /// Local and remote disagree after a clean round.
    Diverged { entity: String, fields: Vec<Field> },
    /// The verification round still wrote to the tracker.
    NotIdempotent { mutations: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accounting {
                round,
                epic,
                entity,
                outcomes,
            } => write!(f, "Accounting: {epic}/{entity} has {outcomes} outcomes in round '{round}'"),
            Self::Unsynced { epic, entity } => write!(f, "Unsynced: {epic}/{entity} has no remote key"),
            Self::MissingIssue { entity, key } => write!(f, "MissingIssue: {entity} points at missing {key}"),
            Self::Diverged { entity, fields } => {
                let names: Vec<&str> = fields.iter().map(|field| field.as_str()).collect();
                write!(f, "Diverged: {entity} differs in {}", names.join(", "))
            }
            Self::NotIdempotent { mutations } => {
                write!(f, "Idempotence: verification round made {mutations} mutations")
            }
        }
    }
}

/// Local epics as they were before a round, keyed by epic.
#[must_use]
pub fn capture(document: &InMemoryDocument, epics: &[Epic]) -> BTreeMap<String, Epic> {
    epics
        .iter()
        .filter_map(|e| document.epic(&e.key).map(|epic| (e.key.clone(), epic)))
        .collect()
}

/// Every local entity of an epic that ran has exactly one outcome.
#[must_use]
pub fn check_accounting(round: &str, before: &BTreeMap<String, Epic>, result: &SyncResult) -> Vec<Violation> {
    let mut violations = Vec::new();
    for epic_result in result.epic_results.iter().filter(|e| e.error.is_none()) {
        let Some(epic) = before.get(&epic_result.epic_key) else {
            continue;
        };
        for entity in &epic.stories {
            let outcomes = epic_result
                .entities
                .iter()
                .filter(|o| o.entity_id == entity.id)
                .count();
            if outcomes != 1 {
                violations.push(Violation::Accounting {
                    round: round.to_string(),
                    epic: epic.key.clone(),
                    entity: entity.id.to_string(),
                    outcomes,
                });
            }
        }
    }
    violations
}

/// Local and remote agree on every entity the round settled.
#[must_use]
pub fn check_convergence(
    document: &InMemoryDocument,
    tracker: &InMemoryTracker,
    epics: &[Epic],
    result: &SyncResult,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    for epic_result in result.epic_results.iter().filter(|e| e.error.is_none()) {
        let Some(epic) = epics.iter().find(|e| e.key == epic_result.epic_key) else {
            continue;
        };
        let Some(local) = document.epic(&epic.key) else {
            continue;
        };
        for entity in &local.stories {
            let settled = epic_result.entity(entity.id.as_str()).is_some_and(|o| {
                !matches!(o.disposition, EntityDisposition::Failed | EntityDisposition::Conflicted)
            });
            if !settled {
                continue;
            }
            let Some(key) = entity.remote_key.clone() else {
                violations.push(Violation::Unsynced {
                    epic: epic.key.clone(),
                    entity: entity.id.to_string(),
                });
                continue;
            };
            let Some(issue) = tracker.issue(&key) else {
                violations.push(Violation::MissingIssue {
                    entity: entity.id.to_string(),
                    key,
                });
                continue;
            };
            let fields: Vec<Field> = Field::ALL
                .into_iter()
                .filter(|field| {
                    fingerprint::hash_value(*field, &entity.fields.get(*field))
                        != fingerprint::hash_value(*field, &issue.fields.get(*field))
                })
                .collect();
            if !fields.is_empty() {
                violations.push(Violation::Diverged {
                    entity: entity.id.to_string(),
                    fields,
                });
            }
        }
    }
    violations
}

#[must_use]
pub fn check_idempotence(tracker: &InMemoryTracker) -> Vec<Violation> {
    match tracker.mutation_count() {
        0 => Vec::new(),
        mutations => vec![Violation::NotIdempotent { mutations }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use storysync_core::model::{Entity, EntityFields};
    use storysync_core::sync::{EntityOutcome, EpicResult, SyncCounts, SyncPhase};
    use storysync_core::sync::EpicStatus;

    fn epic_with(stories: Vec<Entity>) -> Epic {
        let mut epic = Epic::new("EPIC-1", "Checkout");
        epic.stories = stories;
        epic
    }

    fn outcome(id: &str, disposition: EntityDisposition) -> EntityOutcome {
        EntityOutcome {
            entity_id: id.into(),
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

    fn result_with(entities: Vec<EntityOutcome>) -> SyncResult {
        let now = Utc::now();
        let epic = EpicResult {
            epic_key: "EPIC-1".into(),
            status: EpicStatus::Completed,
            phase: SyncPhase::Completed,
            started_at: now,
            finished_at: now,
            counts: SyncCounts::default(),
            entities,
            remote_only: Vec::new(),
            unresolved: Vec::new(),
            failed_operations: Vec::new(),
            planned: Vec::new(),
            error: None,
        };
        SyncResult::from_epics("run-1", now, vec![epic])
    }

    #[test]
    fn accounting_flags_missing_and_duplicate_outcomes() {
        let epic = epic_with(vec![Entity::story("A", "a"), Entity::story("B", "b")]);
        let before = BTreeMap::from([(epic.key.clone(), epic)]);
        let result = result_with(vec![
            outcome("A", EntityDisposition::Created),
            outcome("A", EntityDisposition::Updated),
        ]);
        let violations = check_accounting("initial", &before, &result);
        assert_eq!(violations.len(), 2);
        assert!(violations[0].to_string().contains("EPIC-1/A has 2 outcomes"));
    }

    #[test]
    fn convergence_compares_normalized_fields() {
        let tracker = InMemoryTracker::default();
        tracker.insert_epic("EPIC-1", "Checkout");
        let key = tracker.seed_story("EPIC-1", EntityFields::titled("  LOGIN form"), None);
        let other = tracker.seed_story("EPIC-1", EntityFields::titled("Search"), None);
        let epic = epic_with(vec![
            Entity::story("A", "login form").with_remote_key(key),
            Entity::story("B", "Search v2").with_remote_key(other),
            Entity::story("C", "never synced"),
        ]);
        let document = InMemoryDocument::from_epics([epic.clone()]);
        let result = result_with(vec![
            outcome("A", EntityDisposition::Skipped),
            outcome("B", EntityDisposition::Updated),
            outcome("C", EntityDisposition::Failed),
        ]);

        let violations = check_convergence(&document, &tracker, &[epic], &result);
        assert_eq!(
            violations,
            [Violation::Diverged {
                entity: "B".into(),
                fields: vec![Field::Title],
            }]
        );
    }
}
