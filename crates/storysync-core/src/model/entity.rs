use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::field::{Field, FieldTypeMismatch, FieldValue};
use crate::graph::dependency::{Dependency, DependencyType};

/// Stable local identifier of a story, subtask or epic.
///
/// Local ids come from the document; the engine never invents them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kinds of trackable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Epic,
    Story,
    Subtask,
}

impl EntityKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Story => "story",
            Self::Subtask => "subtask",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed relation from the owning entity to another entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub relation: DependencyType,
    pub target: EntityId,
}

impl Link {
    #[must_use]
    pub fn new(relation: DependencyType, target: impl Into<EntityId>) -> Self {
        Self {
            relation,
            target: target.into(),
        }
    }

    /// The graph edge this link declares for its owner.
    #[must_use]
    pub fn to_dependency(&self, owner: &EntityId) -> Dependency {
        Dependency::new(owner.as_str(), self.target.as_str(), self.relation)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.relation, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid link '{0}', expected '<relation>:<target>'")]
pub struct InvalidLink(pub String);

impl FromStr for Link {
    type Err = InvalidLink;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (relation, target) = s.split_once(':').ok_or_else(|| InvalidLink(s.to_string()))?;
        let relation = relation
            .parse::<DependencyType>()
            .map_err(|_| InvalidLink(s.to_string()))?;
        let target = target.trim();
        if target.is_empty() {
            return Err(InvalidLink(s.to_string()));
        }
        Ok(Self::new(relation, target))
    }
}

fn default_status() -> String {
    "To Do".to_string()
}

/// The mutable, tracked fields of an entity.
///
/// [`EntityFields::get`] and [`EntityFields::set`] form the accessor table
/// used by the conflict detector and the merger; both match exhaustively on
/// [`Field`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFields {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub story_points: Option<u32>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Default for EntityFields {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            status: default_status(),
            priority: None,
            story_points: None,
            assignee: None,
            labels: Vec::new(),
            links: Vec::new(),
        }
    }
}

impl EntityFields {
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Read one field as a [`FieldValue`].
    #[must_use]
    pub fn get(&self, field: Field) -> FieldValue {
        match field {
            Field::Title => FieldValue::text(self.title.clone()),
            Field::Description => FieldValue::text(self.description.clone()),
            Field::Status => FieldValue::text(self.status.clone()),
            Field::Priority => self.priority.clone().map_or(FieldValue::Empty, FieldValue::text),
            Field::StoryPoints => self.story_points.map_or(FieldValue::Empty, FieldValue::Number),
            Field::Assignee => self.assignee.clone().map_or(FieldValue::Empty, FieldValue::text),
            Field::Labels => FieldValue::list(self.labels.iter().cloned()),
            Field::Links => FieldValue::list(self.links.iter().map(ToString::to_string)),
        }
    }

    /// Write one field from a [`FieldValue`].
    ///
    /// # Errors
    ///
    /// Returns [`FieldTypeMismatch`] if the value's shape does not fit the
    /// field, or if a link entry cannot be parsed.
    pub fn set(&mut self, field: Field, value: FieldValue) -> Result<(), FieldTypeMismatch> {
        if !field.accepts(&value) {
            return Err(FieldTypeMismatch { field, value });
        }
        match (field, value) {
            (Field::Title, value) => self.title = text_or_blank(value),
            (Field::Description, value) => self.description = text_or_blank(value),
            (Field::Status, value) => self.status = text_or_blank(value),
            (Field::Priority, value) => self.priority = text_or_none(value),
            (Field::Assignee, value) => self.assignee = text_or_none(value),
            (Field::StoryPoints, FieldValue::Number(n)) => self.story_points = Some(n),
            (Field::StoryPoints, _) => self.story_points = None,
            (Field::Labels, FieldValue::List(items)) => self.labels = items,
            (Field::Labels, _) => self.labels.clear(),
            (Field::Links, FieldValue::List(items)) => {
                let mut links = Vec::with_capacity(items.len());
                for item in &items {
                    let link = item.parse::<Link>().map_err(|_| FieldTypeMismatch {
                        field,
                        value: FieldValue::List(items.clone()),
                    })?;
                    links.push(link);
                }
                self.links = links;
            }
            (Field::Links, _) => self.links.clear(),
        }
        Ok(())
    }
}

fn text_or_blank(value: FieldValue) -> String {
    match value {
        FieldValue::Text(text) => text,
        _ => String::new(),
    }
}

fn text_or_none(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(text) => Some(text),
        _ => None,
    }
}

/// A story, subtask or epic as described by the local document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Tracker key, assigned once the entity has been created remotely.
    #[serde(default)]
    pub remote_key: Option<String>,
    /// Local id of the parent story, for subtasks.
    #[serde(default)]
    pub parent: Option<EntityId>,
    pub fields: EntityFields,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Entity {
    #[must_use]
    pub fn story(id: impl Into<EntityId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: EntityKind::Story,
            remote_key: None,
            parent: None,
            fields: EntityFields::titled(title),
            modified_at: None,
        }
    }

    #[must_use]
    pub fn subtask(
        id: impl Into<EntityId>,
        parent: impl Into<EntityId>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            kind: EntityKind::Subtask,
            parent: Some(parent.into()),
            ..Self::story(id, title)
        }
    }

    #[must_use]
    pub fn with_remote_key(mut self, key: impl Into<String>) -> Self {
        self.remote_key = Some(key.into());
        self
    }

    /// Declared dependency edges, plus an implicit `depends_on` edge to the
    /// parent for subtasks.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = self
            .fields
            .links
            .iter()
            .map(|link| link.to_dependency(&self.id))
            .collect();
        if let Some(parent) = &self.parent {
            deps.push(Dependency::new(
                self.id.as_str(),
                parent.as_str(),
                DependencyType::DependsOn,
            ));
        }
        deps
    }
}

/// A top-level grouping of stories; the unit of parallel scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    /// Tracker key of the epic (the remote parent of its stories).
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub stories: Vec<Entity>,
    /// Keys of epics that must finish syncing before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Epic {
    #[must_use]
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            stories: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn find(&self, id: &EntityId) -> Option<&Entity> {
        self.stories.iter().find(|entity| &entity.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessor_table_round_trips_every_field() {
        let mut fields = EntityFields {
            title: "Login".into(),
            description: "As a user".into(),
            status: "In Progress".into(),
            priority: Some("High".into()),
            story_points: Some(5),
            assignee: Some("ana".into()),
            labels: vec!["auth".into()],
            links: vec![Link::new(DependencyType::Blocks, "US-2")],
        };
        let copy = fields.clone();
        for field in Field::ALL {
            let value = copy.get(field);
            fields.set(field, value).expect("same shape");
        }
        assert_eq!(fields, copy);
    }

    #[test]
    fn set_rejects_wrong_shape() {
        let mut fields = EntityFields::titled("x");
        let err = fields
            .set(Field::StoryPoints, FieldValue::text("lots"))
            .unwrap_err();
        assert_eq!(err.field, Field::StoryPoints);
    }

    #[test]
    fn set_empty_clears_optional_fields() {
        let mut fields = EntityFields {
            priority: Some("High".into()),
            story_points: Some(3),
            ..EntityFields::titled("x")
        };
        fields.set(Field::Priority, FieldValue::Empty).unwrap();
        fields.set(Field::StoryPoints, FieldValue::Empty).unwrap();
        assert_eq!(fields.priority, None);
        assert_eq!(fields.story_points, None);
    }

    #[test]
    fn invalid_link_rejected() {
        let mut fields = EntityFields::titled("x");
        let err = fields.set(Field::Links, FieldValue::list(["nonsense"]));
        assert!(err.is_err());
        assert!("blocks:".parse::<Link>().is_err());
        assert_eq!(
            "depends_on:US-9".parse::<Link>().unwrap(),
            Link::new(DependencyType::DependsOn, "US-9")
        );
    }

    #[test]
    fn subtask_depends_on_parent() {
        let sub = Entity::subtask("US-1.1", "US-1", "Write tests");
        let deps = sub.dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].target, "US-1");
        assert_eq!(deps[0].kind, DependencyType::DependsOn);
    }
}
