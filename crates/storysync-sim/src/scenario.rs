//! Seeded scenarios: the epics a campaign starts from and the edits made
//! on both sides between syncs.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use storysync_core::adapter::{InMemoryDocument, InMemoryTracker};
use storysync_core::model::{Entity, EntityKind, Epic};

use crate::rng::DeterministicRng;

const WORDS: &[&str] = &[
    "cart", "checkout", "search", "profile", "invoice", "login", "export", "billing", "audit", "inbox",
];
const STATUSES: &[&str] = &["To Do", "In Progress", "Done"];
const LABELS: &[&str] = &["backend", "frontend", "ux", "infra"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub epics: usize,
    /// Upper bound; each epic gets 1..=max stories.
    pub max_stories: usize,
    /// Chance of each story carrying a subtask (percent).
    pub subtask_percent: u8,
    /// Chance of an epic depending on an earlier one (percent).
    pub dependency_percent: u8,
    /// Per-entity chances of drift between syncs (percent).
    pub local_edit_percent: u8,
    pub remote_edit_percent: u8,
    pub remote_delete_percent: u8,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            epics: 3,
            max_stories: 4,
            subtask_percent: 30,
            dependency_percent: 30,
            local_edit_percent: 30,
            remote_edit_percent: 30,
            remote_delete_percent: 10,
        }
    }
}

/// A generated batch of epics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub seed: u64,
    pub epics: Vec<Epic>,
}

impl Scenario {
    #[must_use]
    pub fn generate(seed: u64, config: &ScenarioConfig) -> Self {
        let mut rng = DeterministicRng::derive(seed, 1);
        let mut epics: Vec<Epic> = Vec::with_capacity(config.epics);
        let mut serial = 0u32;
        for e in 0..config.epics {
            let key = format!("EPIC-{}", e + 1);
            let mut epic = Epic::new(key.clone(), format!("{} epic", word(&mut rng)));
            if e > 0 && rng.percent(config.dependency_percent) {
                let prereq = rng.index(e);
                epic.depends_on.push(epics[prereq].key.clone());
            }
            let stories = 1 + rng.index(config.max_stories.max(1));
            for s in 1..=stories {
                let id = format!("{key}-S{s}");
                serial += 1;
                let mut story = Entity::story(id.clone(), title(&mut rng, serial));
                randomize(&mut rng, &mut story);
                let subtask = rng.percent(config.subtask_percent).then(|| {
                    serial += 1;
                    let mut sub = Entity::subtask(format!("{id}.1"), id.clone(), title(&mut rng, serial));
                    randomize(&mut rng, &mut sub);
                    sub
                });
                epic.stories.push(story);
                epic.stories.extend(subtask);
            }
            epics.push(epic);
        }
        Self { seed, epics }
    }

    /// A tracker with every epic issue and a document holding the batch.
    #[must_use]
    pub fn materialize(&self) -> (InMemoryTracker, InMemoryDocument) {
        let tracker = InMemoryTracker::new("SIM");
        for epic in &self.epics {
            tracker.insert_epic(epic.key.clone(), epic.title.clone());
        }
        let document = InMemoryDocument::from_epics(self.epics.iter().cloned());
        (tracker, document)
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.epics.iter().map(|e| e.stories.len()).sum()
    }
}

fn word(rng: &mut DeterministicRng) -> &'static str {
    rng.pick(WORDS).copied().unwrap_or("story")
}

/// Titles end in a fixed-width serial so no title contains another.
fn title(rng: &mut DeterministicRng, serial: u32) -> String {
    format!("{} {} n{serial:04}", word(rng), word(rng))
}

fn randomize(rng: &mut DeterministicRng, entity: &mut Entity) {
    entity.fields.description = format!("As a user I want {} to work", word(rng));
    entity.fields.status = rng.pick(STATUSES).map_or_else(|| "To Do".to_string(), |s| (*s).to_string());
    entity.fields.story_points = rng.percent(70).then(|| u32::try_from(rng.below(8)).unwrap_or(1));
    if rng.percent(50) {
        entity.fields.labels = rng.pick(LABELS).map(|l| vec![(*l).to_string()]).unwrap_or_default();
    }
}

/// One change made between syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "edit", rename_all = "snake_case")]
pub enum DriftEdit {
    LocalTitle { epic: String, entity: String, title: String, offset_secs: i64 },
    LocalStatus { epic: String, entity: String, status: String, offset_secs: i64 },
    RemoteDescription { epic: String, entity: String, description: String, offset_secs: i64 },
    RemoteStatus { epic: String, entity: String, status: String, offset_secs: i64 },
    RemoteDelete { epic: String, entity: String },
}

/// Edits to apply after the first sync, decided up front from the seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftPlan {
    pub edits: Vec<DriftEdit>,
}

impl DriftPlan {
    /// Plan edits for `scenario`. Remote deletions only target entities
    /// without subtasks.
    #[must_use]
    pub fn generate(scenario: &Scenario, config: &ScenarioConfig) -> Self {
        let mut rng = DeterministicRng::derive(scenario.seed, 2);
        let mut edits = Vec::new();
        for epic in &scenario.epics {
            for entity in &epic.stories {
                let ctx = (epic.key.clone(), entity.id.as_str().to_string());
                let has_children = entity.kind == EntityKind::Story
                    && epic.stories.iter().any(|e| e.parent.as_ref() == Some(&entity.id));
                if !has_children && rng.percent(config.remote_delete_percent) {
                    edits.push(DriftEdit::RemoteDelete {
                        epic: ctx.0,
                        entity: ctx.1,
                    });
                    continue;
                }
                if rng.percent(config.local_edit_percent) {
                    let offset_secs = offset(&mut rng);
                    edits.push(if rng.percent(50) {
                        DriftEdit::LocalTitle {
                            epic: ctx.0.clone(),
                            entity: ctx.1.clone(),
                            title: format!("{} (edited locally)", entity.fields.title),
                            offset_secs,
                        }
                    } else {
                        DriftEdit::LocalStatus {
                            epic: ctx.0.clone(),
                            entity: ctx.1.clone(),
                            status: status(&mut rng),
                            offset_secs,
                        }
                    });
                }
                if rng.percent(config.remote_edit_percent) {
                    let offset_secs = offset(&mut rng);
                    edits.push(if rng.percent(50) {
                        DriftEdit::RemoteDescription {
                            epic: ctx.0,
                            entity: ctx.1,
                            description: format!("Reworded: {}", word(&mut rng)),
                            offset_secs,
                        }
                    } else {
                        DriftEdit::RemoteStatus {
                            epic: ctx.0,
                            entity: ctx.1,
                            status: status(&mut rng),
                            offset_secs,
                        }
                    });
                }
            }
        }
        Self { edits }
    }

    /// Apply every edit. Edits are stamped `now + offset`, so both sides
    /// look newer than the last sync. Returns the remote keys of edited
    /// entities that still exist.
    pub fn apply(&self, tracker: &InMemoryTracker, document: &InMemoryDocument, now: DateTime<Utc>) -> Vec<String> {
        let at = |secs: i64| now + TimeDelta::seconds(secs);
        let key_of = |epic: &str, entity: &str| document.entity(epic, entity).and_then(|e| e.remote_key);
        let mut touched = Vec::new();
        for edit in &self.edits {
            match edit {
                DriftEdit::LocalTitle { epic, entity, title, offset_secs } => {
                    document.edit(epic, entity, at(*offset_secs), |f| f.title.clone_from(title));
                    touched.extend(key_of(epic, entity));
                }
                DriftEdit::LocalStatus { epic, entity, status, offset_secs } => {
                    document.edit(epic, entity, at(*offset_secs), |f| f.status.clone_from(status));
                    touched.extend(key_of(epic, entity));
                }
                DriftEdit::RemoteDescription { epic, entity, description, offset_secs } => {
                    if let Some(key) = key_of(epic, entity) {
                        tracker.edit(&key, at(*offset_secs), |f| f.description.clone_from(description));
                        touched.push(key);
                    }
                }
                DriftEdit::RemoteStatus { epic, entity, status, offset_secs } => {
                    if let Some(key) = key_of(epic, entity) {
                        tracker.edit(&key, at(*offset_secs), |f| f.status.clone_from(status));
                        touched.push(key);
                    }
                }
                DriftEdit::RemoteDelete { epic, entity } => {
                    if let Some(key) = key_of(epic, entity) {
                        tracker.remove(&key);
                    }
                }
            }
        }
        touched
    }
}

fn offset(rng: &mut DeterministicRng) -> i64 {
    i64::try_from(rng.below(600)).unwrap_or(0) + 1
}

fn status(rng: &mut DeterministicRng) -> String {
    rng.pick(STATUSES).map_or_else(|| "Done".to_string(), |s| (*s).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let config = ScenarioConfig::default();
        let a = Scenario::generate(42, &config);
        assert_eq!(a, Scenario::generate(42, &config));
        assert_eq!(DriftPlan::generate(&a, &config), DriftPlan::generate(&a, &config));
        assert_ne!(a, Scenario::generate(43, &config));
    }

    #[test]
    fn dependencies_point_backwards() {
        let config = ScenarioConfig {
            epics: 6,
            dependency_percent: 100,
            ..ScenarioConfig::default()
        };
        let scenario = Scenario::generate(5, &config);
        for (i, epic) in scenario.epics.iter().enumerate() {
            for dep in &epic.depends_on {
                let pos = scenario.epics.iter().position(|e| &e.key == dep).unwrap();
                assert!(pos < i);
            }
        }
    }

    #[test]
    fn subtasks_follow_their_parent_and_are_never_deleted_with_it() {
        let config = ScenarioConfig {
            subtask_percent: 100,
            remote_delete_percent: 100,
            ..ScenarioConfig::default()
        };
        let scenario = Scenario::generate(9, &config);
        for epic in &scenario.epics {
            for (i, entity) in epic.stories.iter().enumerate() {
                if let Some(parent) = &entity.parent {
                    assert_eq!(&epic.stories[i - 1].id, parent);
                }
            }
        }
        let plan = DriftPlan::generate(&scenario, &config);
        assert!(plan.edits.iter().all(|e| match e {
            DriftEdit::RemoteDelete { entity, .. } => entity.contains('.'),
            _ => true,
        }));
    }

    #[test]
    fn titles_do_not_contain_each_other() {
        let scenario = Scenario::generate(1, &ScenarioConfig::default());
        let titles: Vec<&str> = scenario
            .epics
            .iter()
            .flat_map(|e| e.stories.iter().map(|s| s.fields.title.as_str()))
            .collect();
        for (i, a) in titles.iter().enumerate() {
            for (j, b) in titles.iter().enumerate() {
                assert!(i == j || !a.contains(b), "{a} contains {b}");
            }
        }
    }
}
