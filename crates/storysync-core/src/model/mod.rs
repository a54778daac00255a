//! Entities, fields and snapshots shared by every sync component.

pub mod entity;
pub mod field;
pub mod snapshot;

pub use entity::{Entity, EntityFields, EntityId, EntityKind, Epic, Link};
pub use field::{Field, FieldValue};
pub use snapshot::{BaseSnapshot, EntitySnapshot, FieldSnapshot};
