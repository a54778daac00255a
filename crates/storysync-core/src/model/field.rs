//! Closed set of tracked fields and their values.
//!
//! Every field an entity carries is a variant of [`Field`]. Values travel as
//! [`FieldValue`], and the mapping between the two is checked by
//! [`Field::accepts`], so a new field is a compile-time-visible change in
//! every `match` over `Field`.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A tracked field of a story, subtask or epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Description,
    Status,
    Priority,
    StoryPoints,
    Assignee,
    Labels,
    Links,
}

/// Shape of the value a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Free text; normalized for whitespace and case before hashing.
    FreeText,
    /// Short keyword-like text (status, priority, assignee); case-insensitive.
    Keyword,
    /// Non-negative integer.
    Number,
    /// Unordered set of keywords.
    List,
}

impl Field {
    /// All fields in canonical order. Hashing and merging iterate this order.
    pub const ALL: [Self; 8] = [
        Self::Title,
        Self::Description,
        Self::Status,
        Self::Priority,
        Self::StoryPoints,
        Self::Assignee,
        Self::Labels,
        Self::Links,
    ];

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::StoryPoints => "story_points",
            Self::Assignee => "assignee",
            Self::Labels => "labels",
            Self::Links => "links",
        }
    }

    #[must_use]
    pub const fn value_kind(self) -> ValueKind {
        match self {
            Self::Title | Self::Description => ValueKind::FreeText,
            Self::Status | Self::Priority | Self::Assignee => ValueKind::Keyword,
            Self::StoryPoints => ValueKind::Number,
            Self::Labels | Self::Links => ValueKind::List,
        }
    }

    /// Fields eligible for line-based text merging.
    #[must_use]
    pub const fn is_free_text(self) -> bool {
        matches!(self.value_kind(), ValueKind::FreeText)
    }

    /// Whether `value` has a shape this field can hold. `Empty` is always
    /// accepted.
    #[must_use]
    pub const fn accepts(self, value: &FieldValue) -> bool {
        match (self.value_kind(), value) {
            (_, FieldValue::Empty)
            | (ValueKind::FreeText | ValueKind::Keyword, FieldValue::Text(_))
            | (ValueKind::Number, FieldValue::Number(_))
            | (ValueKind::List, FieldValue::List(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown field name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown field '{0}'")]
pub struct UnknownField(pub String);

impl FromStr for Field {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "title" | "summary" => Ok(Self::Title),
            "description" => Ok(Self::Description),
            "status" => Ok(Self::Status),
            "priority" => Ok(Self::Priority),
            "story_points" | "points" => Ok(Self::StoryPoints),
            "assignee" => Ok(Self::Assignee),
            "labels" => Ok(Self::Labels),
            "links" => Ok(Self::Links),
            other => Err(UnknownField(other.to_string())),
        }
    }
}

/// The value of one field at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Empty,
    Text(String),
    Number(u32),
    List(Vec<String>),
}

impl FieldValue {
    /// Build a text value, mapping blank strings to [`FieldValue::Empty`].
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(value)
        }
    }

    /// Build a list value, mapping an empty list to [`FieldValue::Empty`].
    #[must_use]
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        if items.is_empty() {
            Self::Empty
        } else {
            Self::List(items)
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("(empty)"),
            Self::Text(text) => f.write_str(text),
            Self::Number(n) => write!(f, "{n}"),
            Self::List(items) => f.write_str(&items.join(", ")),
        }
    }
}

/// Error returned when a value does not fit the field it is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field '{field}' cannot hold value {value:?}")]
pub struct FieldTypeMismatch {
    pub field: Field,
    pub value: FieldValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(field.as_str().parse::<Field>(), Ok(field));
        }
    }

    #[test]
    fn aliases_parse() {
        assert_eq!("Summary".parse::<Field>(), Ok(Field::Title));
        assert_eq!("points".parse::<Field>(), Ok(Field::StoryPoints));
        assert!("sprint".parse::<Field>().is_err());
    }

    #[test]
    fn accepts_checks_shape() {
        assert!(Field::Title.accepts(&FieldValue::text("x")));
        assert!(Field::StoryPoints.accepts(&FieldValue::Number(3)));
        assert!(Field::Labels.accepts(&FieldValue::Empty));
        assert!(!Field::StoryPoints.accepts(&FieldValue::text("three")));
        assert!(!Field::Labels.accepts(&FieldValue::Number(1)));
    }

    #[test]
    fn blank_text_is_empty() {
        assert_eq!(FieldValue::text("   "), FieldValue::Empty);
        assert_eq!(FieldValue::list(Vec::<String>::new()), FieldValue::Empty);
    }

    #[test]
    fn only_title_and_description_are_free_text() {
        let free: Vec<Field> = Field::ALL.into_iter().filter(|f| f.is_free_text()).collect();
        assert_eq!(free, vec![Field::Title, Field::Description]);
    }
}
