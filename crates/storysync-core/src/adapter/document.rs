//! In-memory document store and the JSON document parser.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{AdapterError, DocumentParser, DocumentStore, LocalChange};
use crate::model::{Entity, EntityFields, EntityId, EntityKind, Epic};

// ---------------------------------------------------------------------------
// InMemoryDocument
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DocState {
    epics: BTreeMap<String, Epic>,
    fail_writes: bool,
    writes: usize,
}

/// A local document held in memory, keyed by epic.
///
/// Write-backs are all-or-nothing per call.
#[derive(Debug, Default)]
pub struct InMemoryDocument {
    state: Mutex<DocState>,
}

impl InMemoryDocument {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_epics(epics: impl IntoIterator<Item = Epic>) -> Self {
        let doc = Self::new();
        for epic in epics {
            doc.insert(epic);
        }
        doc
    }

    fn lock(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, epic: Epic) {
        self.lock().epics.insert(epic.key.clone(), epic);
    }

    #[must_use]
    pub fn epic(&self, key: &str) -> Option<Epic> {
        self.lock().epics.get(key).cloned()
    }

    #[must_use]
    pub fn entity(&self, epic_key: &str, id: &str) -> Option<Entity> {
        let id = EntityId::new(id);
        self.lock()
            .epics
            .get(epic_key)
            .and_then(|epic| epic.find(&id).cloned())
    }

    /// Edit an entity as a document author would. Returns `false` if missing.
    pub fn edit(
        &self,
        epic_key: &str,
        id: &str,
        at: DateTime<Utc>,
        f: impl FnOnce(&mut EntityFields),
    ) -> bool {
        let id = EntityId::new(id);
        let mut state = self.lock();
        let Some(entity) = state
            .epics
            .get_mut(epic_key)
            .and_then(|epic| epic.stories.iter_mut().find(|e| e.id == id))
        else {
            return false;
        };
        f(&mut entity.fields);
        entity.modified_at = Some(at);
        true
    }

    /// Add an entity to an epic. Returns `false` if the epic is missing.
    pub fn add_entity(&self, epic_key: &str, entity: Entity) -> bool {
        let mut state = self.lock();
        let Some(epic) = state.epics.get_mut(epic_key) else {
            return false;
        };
        epic.stories.push(entity);
        true
    }

    /// Delete an entity as a document author would.
    pub fn remove_entity(&self, epic_key: &str, id: &str) -> bool {
        let id = EntityId::new(id);
        let mut state = self.lock();
        let Some(epic) = state.epics.get_mut(epic_key) else {
            return false;
        };
        let before = epic.stories.len();
        epic.stories.retain(|e| e.id != id);
        epic.stories.len() != before
    }

    /// Make every following write-back fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Number of successful write-back calls.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.lock().writes
    }
}

fn apply_change(epic: &mut Epic, change: &LocalChange) -> Result<(), AdapterError> {
    let epic_key = epic.key.clone();
    let missing = |id: &EntityId| AdapterError::Document(format!("entity '{id}' not in epic '{epic_key}'"));
    match change {
        LocalChange::Update {
            entity_id,
            fields,
            modified_at,
        } => {
            let err = missing(entity_id);
            let entity = epic
                .stories
                .iter_mut()
                .find(|e| &e.id == entity_id)
                .ok_or(err)?;
            entity.fields = fields.clone();
            if modified_at.is_some() {
                entity.modified_at = *modified_at;
            }
        }
        LocalChange::AssignRemoteKey {
            entity_id,
            remote_key,
        } => {
            let err = missing(entity_id);
            let entity = epic
                .stories
                .iter_mut()
                .find(|e| &e.id == entity_id)
                .ok_or(err)?;
            entity.remote_key = Some(remote_key.clone());
        }
        LocalChange::Remove { entity_id } => {
            epic.stories.retain(|e| &e.id != entity_id);
        }
        LocalChange::Restore { entity } => {
            match epic.stories.iter_mut().find(|e| e.id == entity.id) {
                Some(existing) => *existing = entity.clone(),
                None => epic.stories.push(entity.clone()),
            }
        }
    }
    Ok(())
}

impl DocumentStore for InMemoryDocument {
    fn load_epic(&self, epic_key: &str) -> Result<Epic, AdapterError> {
        self.epic(epic_key)
            .ok_or_else(|| AdapterError::Document(format!("epic '{epic_key}' not in document")))
    }

    fn apply_local_changes(&self, epic_key: &str, changes: &[LocalChange]) -> Result<(), AdapterError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(AdapterError::Document("document is read-only".to_string()));
        }
        let mut epic = state
            .epics
            .get(epic_key)
            .cloned()
            .ok_or_else(|| AdapterError::Document(format!("epic '{epic_key}' not in document")))?;
        for change in changes {
            apply_change(&mut epic, change)?;
        }
        state.epics.insert(epic_key.to_string(), epic);
        state.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON parser
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonDocument {
    Wrapped { epics: Vec<Epic> },
    Bare(Vec<Epic>),
}

/// Parses `{"epics": [...]}` or a bare array of epics.
///
/// Rejects duplicate local ids within an epic and subtasks whose parent is
/// not in the same epic.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDocumentParser;

impl DocumentParser for JsonDocumentParser {
    fn parse_epics(&self, source: &str) -> Result<Vec<Epic>, AdapterError> {
        let doc: JsonDocument =
            serde_json::from_str(source).map_err(|err| AdapterError::Document(err.to_string()))?;
        let epics = match doc {
            JsonDocument::Wrapped { epics } | JsonDocument::Bare(epics) => epics,
        };
        for epic in &epics {
            validate_epic(epic)?;
        }
        Ok(epics)
    }
}

fn validate_epic(epic: &Epic) -> Result<(), AdapterError> {
    let mut seen = HashSet::new();
    for entity in &epic.stories {
        if !seen.insert(&entity.id) {
            return Err(AdapterError::Document(format!(
                "duplicate id '{}' in epic '{}'",
                entity.id, epic.key
            )));
        }
    }
    for entity in &epic.stories {
        match (entity.kind, &entity.parent) {
            (EntityKind::Subtask, Some(parent)) if seen.contains(parent) => {}
            (EntityKind::Subtask, _) => {
                return Err(AdapterError::Document(format!(
                    "subtask '{}' has no parent in epic '{}'",
                    entity.id, epic.key
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "epics": [{
            "key": "EPIC-1",
            "title": "Checkout",
            "stories": [
                {"id": "US-1", "kind": "story", "fields": {"title": "Pay by card", "story_points": 3}},
                {"id": "US-1.1", "kind": "subtask", "parent": "US-1", "fields": {"title": "Stripe form"}}
            ]
        }]
    }"#;

    #[test]
    fn parses_wrapped_document() {
        let epics = JsonDocumentParser.parse_epics(DOC).unwrap();
        assert_eq!(epics.len(), 1);
        assert_eq!(epics[0].stories.len(), 2);
        assert_eq!(epics[0].stories[0].fields.story_points, Some(3));
        assert_eq!(epics[0].stories[0].fields.status, "To Do");
    }

    #[test]
    fn parses_bare_array() {
        let epics = JsonDocumentParser
            .parse_epics(r#"[{"key": "EPIC-2"}]"#)
            .unwrap();
        assert_eq!(epics[0].key, "EPIC-2");
        assert!(epics[0].stories.is_empty());
    }

    #[test]
    fn rejects_orphan_subtask() {
        let src = r#"[{"key": "E", "stories": [
            {"id": "S", "kind": "subtask", "parent": "missing", "fields": {"title": "x"}}
        ]}]"#;
        assert!(JsonDocumentParser.parse_epics(src).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let src = r#"[{"key": "E", "stories": [
            {"id": "S", "kind": "story", "fields": {"title": "x"}},
            {"id": "S", "kind": "story", "fields": {"title": "y"}}
        ]}]"#;
        let err = JsonDocumentParser.parse_epics(src).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn write_back_is_all_or_nothing() {
        let doc = InMemoryDocument::from_epics(JsonDocumentParser.parse_epics(DOC).unwrap());
        let changes = [
            LocalChange::AssignRemoteKey {
                entity_id: "US-1".into(),
                remote_key: "PROJ-1".into(),
            },
            LocalChange::Remove {
                entity_id: "US-1.1".into(),
            },
            LocalChange::AssignRemoteKey {
                entity_id: "ghost".into(),
                remote_key: "PROJ-9".into(),
            },
        ];
        assert!(doc.apply_local_changes("EPIC-1", &changes).is_err());
        let epic = doc.epic("EPIC-1").unwrap();
        assert_eq!(epic.stories.len(), 2);
        assert_eq!(epic.stories[0].remote_key, None);

        doc.apply_local_changes("EPIC-1", &changes[..2]).unwrap();
        let epic = doc.epic("EPIC-1").unwrap();
        assert_eq!(epic.stories.len(), 1);
        assert_eq!(epic.stories[0].remote_key.as_deref(), Some("PROJ-1"));
        assert_eq!(doc.writes(), 1);
    }

    #[test]
    fn restore_brings_entity_back() {
        let doc = InMemoryDocument::from_epics([Epic::new("E", "x")]);
        let entity = Entity::story("US-5", "Back again").with_remote_key("PROJ-5");
        doc.apply_local_changes("E", &[LocalChange::Restore { entity }])
            .unwrap();
        assert_eq!(
            doc.entity("E", "US-5").unwrap().remote_key.as_deref(),
            Some("PROJ-5")
        );
    }

    #[test]
    fn read_only_document_rejects_writes() {
        let doc = InMemoryDocument::from_epics([Epic::new("E", "x")]);
        doc.fail_writes(true);
        assert!(doc.apply_local_changes("E", &[]).is_err());
    }
}
