//! Three-way merge of one entity.
//!
//! # Resolution order
//!
//! For every field present in base, local or remote:
//!
//! 1. No conflict: keep the agreed value.
//! 2. `LocalModified` / `RemoteModified`: take the side that changed. The
//!    configured strategy is never consulted for these.
//! 3. `BothModified`: an operator choice from [`Resolutions`] wins; otherwise
//!    the field's strategy decides (per-field override, then default).
//!
//! Entity-level deletions follow the same choice → strategy order and
//! produce a [`DeletionDecision`].
//!
//! The merged field map always holds every field of the inputs; a field
//! left undecided by `Manual` keeps the remote value and is listed in
//! [`MergeResult::unresolved`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::conflict::{Conflict, ConflictReport, ConflictType};
use super::text;
use crate::model::{EntityId, EntitySnapshot, Field, FieldValue};

/// How a true conflict is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    PreferLocal,
    PreferRemote,
    /// Newer `modified_at` wins; ties and missing timestamps use the
    /// configured tie breaker.
    PreferNewest,
    /// Line merge for free text, then the default strategy.
    MergeText,
    /// Leave the conflict for an operator.
    Manual,
}

/// A side of the three-way comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

const fn default_strategy() -> MergeStrategy {
    MergeStrategy::PreferNewest
}

const fn default_tie_breaker() -> Side {
    Side::Remote
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_strategy")]
    pub default_strategy: MergeStrategy,
    #[serde(default)]
    pub field_overrides: BTreeMap<Field, MergeStrategy>,
    #[serde(default = "default_tie_breaker")]
    pub newest_tie_breaker: Side,
    /// Post a tracker comment listing fields flagged for manual review.
    #[serde(default)]
    pub comment_on_review: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            field_overrides: BTreeMap::new(),
            newest_tie_breaker: default_tie_breaker(),
            comment_on_review: false,
        }
    }
}

impl MergeConfig {
    #[must_use]
    pub fn with_strategy(strategy: MergeStrategy) -> Self {
        Self {
            default_strategy: strategy,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn strategy_for(&self, field: Field) -> MergeStrategy {
        self.field_overrides
            .get(&field)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Whether any conflict could be left for an operator.
    #[must_use]
    pub fn can_be_manual(&self) -> bool {
        self.default_strategy == MergeStrategy::Manual
            || self.field_overrides.values().any(|s| *s == MergeStrategy::Manual)
    }

    /// Strategy used after a text merge collides, or for fields a text
    /// merge does not apply to.
    fn fallback(&self) -> MergeStrategy {
        match self.default_strategy {
            MergeStrategy::MergeText => MergeStrategy::PreferRemote,
            other => other,
        }
    }
}

/// Operator choices that settle conflicts a strategy left open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolutions {
    fields: BTreeMap<(EntityId, Field), Side>,
    entities: BTreeMap<EntityId, Side>,
}

impl Resolutions {
    pub fn choose_field(&mut self, entity: impl Into<EntityId>, field: Field, side: Side) {
        self.fields.insert((entity.into(), field), side);
    }

    /// Choose a side for an entity-level deletion conflict.
    pub fn choose_entity(&mut self, entity: impl Into<EntityId>, side: Side) {
        self.entities.insert(entity.into(), side);
    }

    #[must_use]
    pub fn field(&self, entity: &EntityId, field: Field) -> Option<Side> {
        self.fields.get(&(entity.clone(), field)).copied()
    }

    #[must_use]
    pub fn entity(&self, entity: &EntityId) -> Option<Side> {
        self.entities.get(entity).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.entities.is_empty()
    }
}

/// How one field of the merge result was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by")]
pub enum Resolution {
    /// No conflict; both sides agree.
    Agreed,
    /// One-sided change taken as-is.
    Auto { side: Side },
    /// A strategy picked a side.
    Strategy { strategy: MergeStrategy, side: Side },
    /// The line merge combined both edits.
    TextMerged,
    /// An operator picked a side.
    Operator { side: Side },
    /// Left for an operator.
    Unresolved,
}

/// What happens to an entity that one side deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionDecision {
    /// Deleted remotely, kept locally: create it again in the tracker.
    Recreate,
    /// Deleted remotely, deletion accepted: remove it from the document.
    RemoveLocal,
    /// Deleted locally, kept remotely: restore it into the document.
    RestoreLocal,
    /// Deleted locally, deletion accepted: stop tracking it.
    Forget,
}

/// Timestamps the merger needs beyond the snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeContext {
    /// When the base snapshot was agreed.
    pub base_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub entity_id: EntityId,
    pub fields: BTreeMap<Field, FieldValue>,
    pub resolutions: BTreeMap<Field, Resolution>,
    pub had_true_conflict: bool,
    /// Fields whose text merge collided and fell back to a strategy.
    pub review_recommended: Vec<Field>,
    pub unresolved: Vec<Conflict>,
    pub deletion: Option<DeletionDecision>,
}

impl MergeResult {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }

    #[must_use]
    pub fn value(&self, field: Field) -> FieldValue {
        self.fields.get(&field).cloned().unwrap_or(FieldValue::Empty)
    }
}

enum Pick {
    Side(Side),
    Text(String),
    Undecided,
}

/// Resolves a [`ConflictReport`] into a [`MergeResult`].
#[derive(Debug, Clone, Copy)]
pub struct ThreeWayMerger<'a> {
    config: &'a MergeConfig,
    resolutions: Option<&'a Resolutions>,
}

impl<'a> ThreeWayMerger<'a> {
    #[must_use]
    pub const fn new(config: &'a MergeConfig) -> Self {
        Self {
            config,
            resolutions: None,
        }
    }

    #[must_use]
    pub const fn with_resolutions(mut self, resolutions: &'a Resolutions) -> Self {
        self.resolutions = Some(resolutions);
        self
    }

    /// Merge one entity. Marks `report.resolved` when every conflict has a
    /// chosen value.
    pub fn merge(
        &self,
        report: &mut ConflictReport,
        base: Option<&EntitySnapshot>,
        local: Option<&EntitySnapshot>,
        remote: Option<&EntitySnapshot>,
        ctx: MergeContext,
    ) -> MergeResult {
        let mut result = MergeResult {
            entity_id: report.entity_id.clone(),
            fields: BTreeMap::new(),
            resolutions: BTreeMap::new(),
            had_true_conflict: report.has_true_conflict(),
            review_recommended: Vec::new(),
            unresolved: Vec::new(),
            deletion: None,
        };

        if let Some(conflict) = report.deletion().cloned() {
            self.merge_deletion(&conflict, base, local, remote, ctx, &mut result);
        } else {
            for field in Field::ALL {
                if !any_has(field, [base, local, remote]) {
                    continue;
                }
                self.merge_field(field, report, base, local, remote, &mut result);
            }
        }

        report.resolved = result.unresolved.is_empty();
        result
    }

    fn merge_field(
        &self,
        field: Field,
        report: &ConflictReport,
        base: Option<&EntitySnapshot>,
        local: Option<&EntitySnapshot>,
        remote: Option<&EntitySnapshot>,
        result: &mut MergeResult,
    ) {
        let local_value = local.map_or(FieldValue::Empty, |s| s.value(field));
        let remote_value = remote.map_or(FieldValue::Empty, |s| s.value(field));

        let Some(conflict) = report.for_field(field) else {
            // Agreed: prefer the remote spelling so no tracker write is needed.
            let value = remote.or(local).or(base).map_or(FieldValue::Empty, |s| s.value(field));
            result.fields.insert(field, value);
            result.resolutions.insert(field, Resolution::Agreed);
            return;
        };

        let (value, resolution) = match conflict.kind {
            ConflictType::LocalModified => (local_value, Resolution::Auto { side: Side::Local }),
            ConflictType::RemoteModified => (remote_value, Resolution::Auto { side: Side::Remote }),
            _ => {
                if let Some(side) = self.resolutions.and_then(|r| r.field(&report.entity_id, field)) {
                    (pick(side, local_value, remote_value), Resolution::Operator { side })
                } else {
                    let strategy = self.config.strategy_for(field);
                    match self.decide(strategy, field, base, local, remote, result) {
                        Pick::Side(side) => (
                            pick(side, local_value, remote_value),
                            Resolution::Strategy { strategy, side },
                        ),
                        Pick::Text(merged) => (FieldValue::text(merged), Resolution::TextMerged),
                        Pick::Undecided => {
                            result.unresolved.push(conflict.clone());
                            (remote_value, Resolution::Unresolved)
                        }
                    }
                }
            }
        };

        result.fields.insert(field, value);
        result.resolutions.insert(field, resolution);
    }

    fn decide(
        &self,
        strategy: MergeStrategy,
        field: Field,
        base: Option<&EntitySnapshot>,
        local: Option<&EntitySnapshot>,
        remote: Option<&EntitySnapshot>,
        result: &mut MergeResult,
    ) -> Pick {
        match strategy {
            MergeStrategy::PreferLocal => Pick::Side(Side::Local),
            MergeStrategy::PreferRemote => Pick::Side(Side::Remote),
            MergeStrategy::PreferNewest => Pick::Side(self.newest(
                local.and_then(|s| s.modified_at),
                remote.and_then(|s| s.modified_at),
            )),
            MergeStrategy::Manual => Pick::Undecided,
            MergeStrategy::MergeText => {
                if field.is_free_text() {
                    let text_of = |s: Option<&EntitySnapshot>| {
                        s.map(|s| s.value(field))
                            .and_then(|v| v.as_text().map(str::to_string))
                            .unwrap_or_default()
                    };
                    match text::merge_lines(&text_of(base), &text_of(local), &text_of(remote)) {
                        Ok(merged) => return Pick::Text(merged),
                        Err(collision) => {
                            tracing::debug!(%field, %collision, "text merge collided, falling back");
                            result.review_recommended.push(field);
                        }
                    }
                }
                self.decide(self.config.fallback(), field, base, local, remote, result)
            }
        }
    }

    fn newest(&self, local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> Side {
        match (local, remote) {
            (Some(l), Some(r)) if l > r => Side::Local,
            (Some(l), Some(r)) if r > l => Side::Remote,
            _ => self.config.newest_tie_breaker,
        }
    }

    fn merge_deletion(
        &self,
        conflict: &Conflict,
        base: Option<&EntitySnapshot>,
        local: Option<&EntitySnapshot>,
        remote: Option<&EntitySnapshot>,
        ctx: MergeContext,
        result: &mut MergeResult,
    ) {
        let survivor = local.or(remote).or(base);
        for field in Field::ALL {
            if any_has(field, [base, local, remote]) {
                let value = survivor.map_or(FieldValue::Empty, |s| s.value(field));
                result.fields.insert(field, value);
                result.resolutions.insert(field, Resolution::Agreed);
            }
        }

        let side = if let Some(side) = self.resolutions.and_then(|r| r.entity(&conflict.entity_id)) {
            Some(side)
        } else {
            let strategy = match self.config.default_strategy {
                MergeStrategy::MergeText => self.config.fallback(),
                other => other,
            };
            match strategy {
                MergeStrategy::PreferLocal => Some(Side::Local),
                MergeStrategy::PreferRemote => Some(Side::Remote),
                MergeStrategy::PreferNewest => {
                    // The deleting side has no timestamp of its own; the
                    // deletion happened after the base was agreed.
                    let (survivor_side, survivor_at) = match conflict.kind {
                        ConflictType::DeletedRemote => (Side::Local, local.and_then(|s| s.modified_at)),
                        _ => (Side::Remote, remote.and_then(|s| s.modified_at)),
                    };
                    match (survivor_at, ctx.base_synced_at) {
                        (Some(at), Some(synced)) if at > synced => Some(survivor_side),
                        (Some(at), Some(synced)) if at < synced => Some(other(survivor_side)),
                        _ => Some(self.config.newest_tie_breaker),
                    }
                }
                MergeStrategy::Manual | MergeStrategy::MergeText => None,
            }
        };

        result.deletion = match (conflict.kind, side) {
            (ConflictType::DeletedRemote, Some(Side::Local)) => Some(DeletionDecision::Recreate),
            (ConflictType::DeletedRemote, Some(Side::Remote)) => Some(DeletionDecision::RemoveLocal),
            (ConflictType::DeletedLocal, Some(Side::Local)) => Some(DeletionDecision::Forget),
            (ConflictType::DeletedLocal, Some(Side::Remote)) => Some(DeletionDecision::RestoreLocal),
            _ => {
                result.unresolved.push(conflict.clone());
                None
            }
        };
    }
}

const fn other(side: Side) -> Side {
    match side {
        Side::Local => Side::Remote,
        Side::Remote => Side::Local,
    }
}

fn pick(side: Side, local: FieldValue, remote: FieldValue) -> FieldValue {
    match side {
        Side::Local => local,
        Side::Remote => remote,
    }
}

fn any_has(field: Field, snapshots: [Option<&EntitySnapshot>; 3]) -> bool {
    snapshots
        .into_iter()
        .flatten()
        .any(|s| s.fields.contains_key(&field))
}
