//! Three-way conflict classification.
//!
//! Given the base snapshot (last agreed state), the local snapshot and the
//! remote snapshot of one entity, every field is classified by comparing
//! field fingerprints:
//!
//! | local vs base | remote vs base | local vs remote | result            |
//! |---------------|----------------|-----------------|-------------------|
//! | same          | same           | -               | no conflict       |
//! | differs       | same           | -               | `LocalModified`   |
//! | same          | differs        | -               | `RemoteModified`  |
//! | differs       | differs        | same            | no conflict       |
//! | differs       | differs        | differs         | `BothModified`    |
//!
//! Without a base (first sync of an entity that already exists on both
//! sides) there is no common ancestor, so any field where local and remote
//! disagree is `BothModified`.
//!
//! Entity-level deletions: present in base and local but absent remotely is
//! `DeletedRemote`; present in base and remote but absent locally is
//! `DeletedLocal`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{EntityId, EntitySnapshot, Field, FieldValue};

/// How a field (or entity) diverged from the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    LocalModified,
    RemoteModified,
    BothModified,
    DeletedRemote,
    DeletedLocal,
}

impl ConflictType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalModified => "LOCAL_MODIFIED",
            Self::RemoteModified => "REMOTE_MODIFIED",
            Self::BothModified => "BOTH_MODIFIED",
            Self::DeletedRemote => "DELETED_REMOTE",
            Self::DeletedLocal => "DELETED_LOCAL",
        }
    }

    /// One-sided changes resolve without consulting a strategy.
    #[must_use]
    pub const fn is_auto_resolvable(self) -> bool {
        matches!(self, Self::LocalModified | Self::RemoteModified)
    }

    #[must_use]
    pub const fn is_deletion(self) -> bool {
        matches!(self, Self::DeletedRemote | Self::DeletedLocal)
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One divergence between base, local and remote.
///
/// `field` is `None` for entity-level deletions; the three values are then
/// `None` as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub entity_id: EntityId,
    pub field: Option<Field>,
    pub kind: ConflictType,
    pub base: Option<FieldValue>,
    pub local: Option<FieldValue>,
    pub remote: Option<FieldValue>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            Some(field) => write!(f, "{}.{}: {}", self.entity_id, field, self.kind),
            None => write!(f, "{}: {}", self.entity_id, self.kind),
        }
    }
}

/// All conflicts of one entity, in [`Field::ALL`] order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub entity_id: EntityId,
    pub conflicts: Vec<Conflict>,
    /// Set by the merger once every conflict has a chosen value.
    pub resolved: bool,
}

impl ConflictReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    #[must_use]
    pub fn for_field(&self, field: Field) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.field == Some(field))
    }

    #[must_use]
    pub fn deletion(&self) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.kind.is_deletion())
    }

    /// True conflicts or deletions: the ones a strategy has to decide.
    #[must_use]
    pub fn needs_strategy(&self) -> bool {
        self.conflicts
            .iter()
            .any(|c| !c.kind.is_auto_resolvable())
    }

    #[must_use]
    pub fn has_true_conflict(&self) -> bool {
        self.conflicts
            .iter()
            .any(|c| c.kind == ConflictType::BothModified)
    }
}

/// Classify one field from its three fingerprints.
///
/// `None` for `base` means there is no common ancestor.
#[must_use]
pub fn classify(base: Option<&str>, local: &str, remote: &str) -> Option<ConflictType> {
    if local == remote {
        return None;
    }
    let Some(base) = base else {
        return Some(ConflictType::BothModified);
    };
    match (local == base, remote == base) {
        (true, true) => None,
        (false, true) => Some(ConflictType::LocalModified),
        (true, false) => Some(ConflictType::RemoteModified),
        (false, false) => Some(ConflictType::BothModified),
    }
}

/// Detect the conflicts of one entity. Pure: no I/O, no mutation.
#[must_use]
pub fn detect(
    entity_id: &EntityId,
    base: Option<&EntitySnapshot>,
    local: Option<&EntitySnapshot>,
    remote: Option<&EntitySnapshot>,
) -> ConflictReport {
    let mut conflicts = Vec::new();

    match (base, local, remote) {
        (Some(_), Some(_), None) => conflicts.push(entity_conflict(entity_id, ConflictType::DeletedRemote)),
        (Some(_), None, Some(_)) => conflicts.push(entity_conflict(entity_id, ConflictType::DeletedLocal)),
        (base, Some(local), Some(remote)) => {
            for field in Field::ALL {
                let (Some(l), Some(r)) = (local.field(field), remote.field(field)) else {
                    continue;
                };
                let b = base.and_then(|b| b.field(field));
                if let Some(kind) = classify(b.map(|s| s.hash.as_str()), &l.hash, &r.hash) {
                    conflicts.push(Conflict {
                        entity_id: entity_id.clone(),
                        field: Some(field),
                        kind,
                        base: b.map(|s| s.value.clone()),
                        local: Some(l.value.clone()),
                        remote: Some(r.value.clone()),
                    });
                }
            }
        }
        // New local entity, remote-only entity, or gone everywhere.
        _ => {}
    }

    let resolved = conflicts.is_empty();
    ConflictReport {
        entity_id: entity_id.clone(),
        conflicts,
        resolved,
    }
}

fn entity_conflict(entity_id: &EntityId, kind: ConflictType) -> Conflict {
    Conflict {
        entity_id: entity_id.clone(),
        field: None,
        kind,
        base: None,
        local: None,
        remote: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntitySnapshot};

    fn snap(f: impl FnOnce(&mut Entity)) -> EntitySnapshot {
        let mut e = Entity::story("US-1", "Login");
        e.fields.status = "Open".into();
        f(&mut e);
        EntitySnapshot::of_entity(&e)
    }

    fn id() -> EntityId {
        EntityId::new("US-1")
    }

    #[test]
    fn unchanged_everywhere_is_clean() {
        let s = snap(|_| {});
        let report = detect(&id(), Some(&s), Some(&s), Some(&s));
        assert!(report.is_empty());
        assert!(report.resolved);
    }

    #[test]
    fn remote_status_change_is_remote_modified() {
        let base = snap(|_| {});
        let remote = snap(|e| e.fields.status = "Done".into());
        let report = detect(&id(), Some(&base), Some(&base), Some(&remote));
        assert_eq!(report.conflicts.len(), 1);
        let c = &report.conflicts[0];
        assert_eq!(c.field, Some(Field::Status));
        assert_eq!(c.kind, ConflictType::RemoteModified);
        assert!(!report.needs_strategy());
    }

    #[test]
    fn divergent_titles_are_both_modified() {
        let base = snap(|e| e.fields.title = "A".into());
        let local = snap(|e| e.fields.title = "B".into());
        let remote = snap(|e| e.fields.title = "C".into());
        let report = detect(&id(), Some(&base), Some(&local), Some(&remote));
        assert!(report.has_true_conflict());
        let c = report.for_field(Field::Title).unwrap();
        assert_eq!(c.base, Some(FieldValue::text("A")));
        assert_eq!(c.local, Some(FieldValue::text("B")));
        assert_eq!(c.remote, Some(FieldValue::text("C")));
    }

    #[test]
    fn convergent_edit_is_not_a_conflict() {
        let base = snap(|_| {});
        let both = snap(|e| e.fields.story_points = Some(5));
        let report = detect(&id(), Some(&base), Some(&both), Some(&both));
        assert!(report.is_empty());
    }

    #[test]
    fn reformatting_is_not_a_change() {
        let base = snap(|e| e.fields.title = "Login page".into());
        let local = snap(|e| e.fields.title = "  login   PAGE".into());
        let report = detect(&id(), Some(&base), Some(&local), Some(&base));
        assert!(report.is_empty());
    }

    #[test]
    fn deletions_are_entity_level() {
        let s = snap(|_| {});
        let gone_remote = detect(&id(), Some(&s), Some(&s), None);
        assert_eq!(gone_remote.conflicts[0].kind, ConflictType::DeletedRemote);
        assert_eq!(gone_remote.conflicts[0].field, None);

        let gone_local = detect(&id(), Some(&s), None, Some(&s));
        assert_eq!(gone_local.deletion().unwrap().kind, ConflictType::DeletedLocal);
        assert!(gone_local.needs_strategy());
    }

    #[test]
    fn no_base_disagreement_is_both_modified() {
        let local = snap(|e| e.fields.assignee = Some("ana".into()));
        let remote = snap(|e| e.fields.assignee = Some("bo".into()));
        let report = detect(&id(), None, Some(&local), Some(&remote));
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kind, ConflictType::BothModified);
        assert_eq!(report.conflicts[0].base, None);
    }

    #[test]
    fn new_local_entity_has_no_conflicts() {
        let s = snap(|_| {});
        assert!(detect(&id(), None, Some(&s), None).is_empty());
        assert!(detect(&id(), None, None, Some(&s)).is_empty());
    }

    #[test]
    fn classify_table() {
        assert_eq!(classify(Some("b"), "b", "b"), None);
        assert_eq!(classify(Some("b"), "l", "b"), Some(ConflictType::LocalModified));
        assert_eq!(classify(Some("b"), "b", "r"), Some(ConflictType::RemoteModified));
        assert_eq!(classify(Some("b"), "x", "x"), None);
        assert_eq!(classify(Some("b"), "l", "r"), Some(ConflictType::BothModified));
        assert_eq!(classify(None, "l", "r"), Some(ConflictType::BothModified));
        assert_eq!(classify(None, "x", "x"), None);
    }
}
