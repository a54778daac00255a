//! Point-in-time captures of entity state.
//!
//! An [`EntitySnapshot`] is taken independently for the local document and
//! for the remote tracker at sync start. A [`BaseSnapshot`] is the snapshot
//! persisted after the last successful sync and acts as the common ancestor
//! for three-way comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::entity::{Entity, EntityFields, EntityId};
use super::field::{Field, FieldValue};
use crate::fingerprint;

/// One field's value plus the fingerprint of that value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub value: FieldValue,
    pub hash: String,
}

impl FieldSnapshot {
    #[must_use]
    pub fn capture(field: Field, value: FieldValue) -> Self {
        let hash = fingerprint::hash_value(field, &value);
        Self { value, hash }
    }
}

/// Every tracked field of one entity with an aggregate content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    #[serde(default)]
    pub remote_key: Option<String>,
    pub fields: BTreeMap<Field, FieldSnapshot>,
    pub content_hash: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl EntitySnapshot {
    /// Capture a snapshot from a field set.
    #[must_use]
    pub fn capture(
        entity_id: EntityId,
        remote_key: Option<String>,
        fields: &EntityFields,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        let fields: BTreeMap<Field, FieldSnapshot> = Field::ALL
            .into_iter()
            .map(|field| (field, FieldSnapshot::capture(field, fields.get(field))))
            .collect();
        let content_hash = fingerprint::combine(|field| {
            fields
                .get(&field)
                .map_or_else(|| fingerprint::hash_value(field, &FieldValue::Empty), |s| s.hash.clone())
        });
        Self {
            entity_id,
            remote_key,
            fields,
            content_hash,
            modified_at,
        }
    }

    #[must_use]
    pub fn of_entity(entity: &Entity) -> Self {
        Self::capture(
            entity.id.clone(),
            entity.remote_key.clone(),
            &entity.fields,
            entity.modified_at,
        )
    }

    #[must_use]
    pub fn field(&self, field: Field) -> Option<&FieldSnapshot> {
        self.fields.get(&field)
    }

    #[must_use]
    pub fn field_hash(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(|s| s.hash.as_str())
    }

    #[must_use]
    pub fn value(&self, field: Field) -> FieldValue {
        self.fields
            .get(&field)
            .map_or(FieldValue::Empty, |s| s.value.clone())
    }

    /// Rebuild the typed field set from the captured values. Values that no
    /// longer fit their field are skipped and left at their defaults.
    #[must_use]
    pub fn to_fields(&self) -> EntityFields {
        let mut fields = EntityFields::default();
        for (field, snapshot) in &self.fields {
            if let Err(err) = fields.set(*field, snapshot.value.clone()) {
                tracing::warn!(entity = %self.entity_id, %err, "skipping malformed snapshot field");
            }
        }
        fields
    }
}

/// The sync anchor: the snapshot agreed by both sides after the last
/// successful sync of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSnapshot {
    pub epic_key: String,
    pub snapshot: EntitySnapshot,
    pub synced_at: DateTime<Utc>,
    pub run_id: String,
}

impl BaseSnapshot {
    #[must_use]
    pub fn entity_id(&self) -> &EntityId {
        &self.snapshot.entity_id
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.snapshot.content_hash
    }

    #[must_use]
    pub fn remote_key(&self) -> Option<&str> {
        self.snapshot.remote_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_hash_matches_entity_fingerprint() {
        let mut entity = Entity::story("US-1", "Checkout");
        entity.fields.labels = vec!["payments".into()];
        let snap = EntitySnapshot::of_entity(&entity);
        assert_eq!(snap.content_hash, fingerprint::hash(&entity));
        assert_eq!(snap.fields.len(), Field::ALL.len());
    }

    #[test]
    fn to_fields_restores_values() {
        let mut entity = Entity::story("US-1", "Checkout");
        entity.fields.story_points = Some(8);
        entity.fields.assignee = Some("kim".into());
        let snap = EntitySnapshot::of_entity(&entity);
        assert_eq!(snap.to_fields(), entity.fields);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snap = EntitySnapshot::of_entity(&Entity::story("US-1", "Checkout"));
        let json = serde_json::to_string(&snap).expect("serialize");
        let back: EntitySnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, snap);
    }
}
