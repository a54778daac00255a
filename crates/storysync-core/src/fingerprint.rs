//! Content fingerprints for change detection and idempotency.
//!
//! Fingerprints are BLAKE3 hashes over *normalized* field values, formatted
//! as `blake3:<lowercase hex>`. Normalization removes differences that carry
//! no meaning for a tracker:
//!
//! - free text: whitespace runs collapse to one space, leading/trailing
//!   whitespace is dropped, case is folded;
//! - keywords (status, priority, assignee): trimmed and case-folded;
//! - lists: every item normalized as a keyword, blanks dropped, sorted and
//!   de-duplicated;
//! - blank text and empty lists hash as [`FieldValue::Empty`].
//!
//! The entity fingerprint covers every field in [`Field::ALL`] order, so two
//! entities hash equal iff every normalized field is equal. Identity
//! (local id, remote key) and timestamps are not part of the content.

use crate::model::entity::{Entity, EntityFields};
use crate::model::field::{Field, FieldValue, ValueKind};

const HASH_PREFIX: &str = "blake3:";

/// Normalize a value the way it is compared.
#[must_use]
pub fn normalize(field: Field, value: &FieldValue) -> FieldValue {
    match (field.value_kind(), value) {
        (_, FieldValue::Empty) => FieldValue::Empty,
        (ValueKind::FreeText | ValueKind::Keyword, FieldValue::Text(text)) => {
            FieldValue::text(normalize_text(text))
        }
        (ValueKind::List, FieldValue::List(items)) => {
            let mut items: Vec<String> = items
                .iter()
                .map(|item| normalize_text(item))
                .filter(|item| !item.is_empty())
                .collect();
            items.sort_unstable();
            items.dedup();
            FieldValue::list(items)
        }
        (_, other) => other.clone(),
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn encode(value: &FieldValue, out: &mut Vec<u8>) {
    match value {
        FieldValue::Empty => out.push(b'e'),
        FieldValue::Text(text) => {
            out.extend_from_slice(b"t:");
            out.extend_from_slice(text.as_bytes());
        }
        FieldValue::Number(n) => {
            out.extend_from_slice(b"n:");
            out.extend_from_slice(n.to_string().as_bytes());
        }
        FieldValue::List(items) => {
            out.extend_from_slice(b"l:");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(0x1f);
                }
                out.extend_from_slice(item.as_bytes());
            }
        }
    }
}

fn format_hash(hash: &blake3::Hash) -> String {
    format!("{HASH_PREFIX}{}", hash.to_hex())
}

/// Hash one field value after normalization.
#[must_use]
pub fn hash_value(field: Field, value: &FieldValue) -> String {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(field.as_str().as_bytes());
    buf.push(0);
    encode(&normalize(field, value), &mut buf);
    format_hash(&blake3::hash(&buf))
}

/// Hash a single field of an entity.
#[must_use]
pub fn hash_field(entity: &Entity, field: Field) -> String {
    hash_value(field, &entity.fields.get(field))
}

/// Combine per-field hashes into the aggregate content hash.
///
/// `field_hash` is called once per field in canonical order.
pub fn combine<F>(mut field_hash: F) -> String
where
    F: FnMut(Field) -> String,
{
    let mut hasher = blake3::Hasher::new();
    for field in Field::ALL {
        hasher.update(field.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(field_hash(field).as_bytes());
        hasher.update(b"\n");
    }
    format_hash(&hasher.finalize())
}

/// Aggregate content hash of a field set.
#[must_use]
pub fn hash_fields(fields: &EntityFields) -> String {
    combine(|field| hash_value(field, &fields.get(field)))
}

/// Aggregate content hash of an entity.
#[must_use]
pub fn hash(entity: &Entity) -> String {
    hash_fields(&entity.fields)
}

/// Hash arbitrary bytes with the fingerprint format. Used for operation
/// payloads.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    format_hash(&blake3::hash(bytes))
}
