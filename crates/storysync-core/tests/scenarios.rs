//! End-to-end runs through the parallel orchestrator with the in-memory
//! tracker and document.

use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use storysync_core::adapter::{InMemoryDocument, InMemoryTracker, RetryPolicy};
use storysync_core::config::{self, SyncConfig};
use storysync_core::model::{Entity, Epic, Field};
use storysync_core::store::{FileStateStore, MemoryStateStore, StateStore};
use storysync_core::sync::{ConflictType, EntityDisposition, EpicStatus, MergeConfig, MergeStrategy};
use storysync_core::{ParallelSyncConfig, ParallelSyncOrchestrator, SyncContext, SyncOptions, SyncRegistry};

struct World {
    tracker: Arc<InMemoryTracker>,
    document: Arc<InMemoryDocument>,
    epics: Vec<Epic>,
}

fn epic(key: &str, deps: &[&str], stories: Vec<Entity>) -> Epic {
    let mut epic = Epic::new(key, format!("Epic {key}"));
    epic.stories = stories;
    epic.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
    epic
}

fn world(epics: Vec<Epic>) -> World {
    let tracker = Arc::new(InMemoryTracker::default());
    for e in &epics {
        tracker.insert_epic(e.key.clone(), e.title.clone());
    }
    let document = Arc::new(InMemoryDocument::from_epics(epics.iter().cloned()));
    World {
        tracker,
        document,
        epics,
    }
}

fn context(w: &World, store: Arc<dyn StateStore>) -> SyncContext {
    SyncContext::new(w.tracker.clone(), w.document.clone(), store).with_retry(RetryPolicy::immediate(1))
}

fn pool(workers: usize) -> ParallelSyncConfig {
    ParallelSyncConfig {
        max_workers: workers,
        ..ParallelSyncConfig::default()
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn key_of(w: &World, epic: &str, id: &str) -> String {
    w.document.entity(epic, id).unwrap().remote_key.unwrap()
}

#[test]
fn second_run_on_unchanged_input_issues_no_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(vec![
        epic("E1", &[], vec![Entity::story("A-1", "Cart"), Entity::subtask("A-1.1", "A-1", "Cart badge")]),
        epic("E2", &[], vec![Entity::story("B-1", "Search")]),
    ]);
    let store = Arc::new(FileStateStore::open(dir.path(), Duration::from_secs(2)).unwrap());
    let orchestrator = ParallelSyncOrchestrator::new(context(&w, store), pool(2));

    let first = orchestrator.sync(&w.epics, &SyncOptions::default());
    assert!(first.is_success(), "{first:?}");
    assert_eq!(first.counts.created, 3);

    w.tracker.reset_calls();
    let second = orchestrator.sync(&w.epics, &SyncOptions::default());
    assert!(second.is_success());
    assert_eq!(second.counts.skipped, 3);
    assert_eq!(w.tracker.mutation_count(), 0);
    assert_eq!(second.operations_applied(), 0);
}

#[test]
fn clean_pull_takes_remote_status() {
    let mut story = Entity::story("A-1", "Cart");
    story.fields.status = "Open".into();
    let w = world(vec![epic("E1", &[], vec![story])]);
    let orchestrator = ParallelSyncOrchestrator::new(context(&w, Arc::new(MemoryStateStore::new())), pool(1));
    orchestrator.sync(&w.epics, &SyncOptions::default());

    let key = key_of(&w, "E1", "A-1");
    w.tracker.edit(&key, Utc::now(), |f| f.status = "Done".into());
    w.tracker.reset_calls();

    let result = orchestrator.sync(&w.epics, &SyncOptions::default());
    let outcome = result.epic("E1").unwrap().entity("A-1").unwrap();
    assert_eq!(outcome.disposition, EntityDisposition::Updated);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].kind, ConflictType::RemoteModified);
    assert_eq!(w.document.entity("E1", "A-1").unwrap().fields.status, "Done");
    assert_eq!(w.tracker.mutation_count(), 0);
}

#[test]
fn true_conflict_resolves_to_newer_remote_title() {
    let w = world(vec![epic("E1", &[], vec![Entity::story("A-1", "A")])]);
    let ctx = context(&w, Arc::new(MemoryStateStore::new()))
        .with_merge_config(MergeConfig::with_strategy(MergeStrategy::PreferNewest));
    let orchestrator = ParallelSyncOrchestrator::new(ctx, pool(1));
    orchestrator.sync(&w.epics, &SyncOptions::default());

    let key = key_of(&w, "E1", "A-1");
    w.document.edit("E1", "A-1", at(10), |f| f.title = "B".into());
    w.tracker.edit(&key, at(20), |f| f.title = "C".into());

    let result = orchestrator.sync(&w.epics, &SyncOptions::default());
    let outcome = result.epic("E1").unwrap().entity("A-1").unwrap();
    let title = outcome.conflicts.iter().find(|c| c.field == Some(Field::Title)).unwrap();
    assert_eq!(title.kind, ConflictType::BothModified);
    assert_eq!(w.document.entity("E1", "A-1").unwrap().fields.title, "C");
    assert_eq!(w.tracker.issue(&key).unwrap().fields.title, "C");
}

#[test]
fn dependent_epic_waits_for_its_prerequisite() {
    let w = world(vec![
        epic("E1", &[], vec![Entity::story("A-1", "Cart"), Entity::story("A-2", "Checkout")]),
        epic("E2", &["E1"], vec![Entity::story("B-1", "Receipt")]),
    ]);
    let ctx = context(&w, Arc::new(MemoryStateStore::new()));
    let result = ParallelSyncOrchestrator::new(ctx, pool(2)).sync(&w.epics, &SyncOptions::default());

    assert!(result.is_success(), "{result:?}");
    let e1 = result.epic("E1").unwrap();
    let e2 = result.epic("E2").unwrap();
    assert_eq!(e1.status, EpicStatus::Completed);
    assert!(e2.started_at >= e1.finished_at, "E2 started before E1 finished");
}

#[test]
fn fail_fast_reports_fewer_epics() {
    let epics = || {
        vec![
            epic("E1", &[], vec![Entity::story("A-1", "Cart")]),
            epic("E2", &[], vec![Entity::story("B-1", "Search")]),
            epic("E3", &[], vec![Entity::story("C-1", "Profile")]),
        ]
    };

    for (fail_fast, expected) in [(true, 1), (false, 3)] {
        let w = world(epics());
        w.tracker.remove("E1");
        let config = ParallelSyncConfig {
            fail_fast,
            ..pool(1)
        };
        let result = ParallelSyncOrchestrator::new(context(&w, Arc::new(MemoryStateStore::new())), config)
            .sync(&w.epics, &SyncOptions::default());
        assert_eq!(result.epic_results.len(), expected, "fail_fast = {fail_fast}");
        assert_eq!(result.epic("E1").unwrap().status, EpicStatus::Failed);
        assert!(!result.is_success());
    }
}

#[test]
fn dry_run_through_orchestrator_writes_nothing() {
    let w = world(vec![epic("E1", &[], vec![Entity::story("A-1", "Cart")])]);
    let store = Arc::new(MemoryStateStore::new());
    let orchestrator = ParallelSyncOrchestrator::new(context(&w, store.clone()), pool(1));
    let options = SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    };

    let result = orchestrator.sync(&w.epics, &options);
    assert!(result.dry_run);
    assert_eq!(result.counts.created, 1);
    assert_eq!(w.tracker.mutation_count(), 0);
    assert_eq!(store.snapshot_count(), 0);
    assert!(w.document.entity("E1", "A-1").unwrap().remote_key.is_none());
}

#[test]
fn project_config_drives_the_registry_context() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join(config::PROJECT_DIR);
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        "[merge]\ndefault_strategy = \"manual\"\n\n[parallel]\nmax_workers = 1\n",
    )
    .unwrap();
    let sync_config: SyncConfig = config::load_sync_config(dir.path()).unwrap();

    let w = world(vec![epic("E1", &[], vec![Entity::story("A-1", "Cart")])]);
    let registry = SyncRegistry::new().with_tracker("memory", w.tracker.clone());
    let ctx = registry
        .build_context("memory", w.document.clone(), Arc::new(MemoryStateStore::new()), &sync_config)
        .unwrap();
    let orchestrator = ParallelSyncOrchestrator::new(ctx, sync_config.parallel.to_parallel_config());
    assert_eq!(orchestrator.config().max_workers, 1);
    orchestrator.sync(&w.epics, &SyncOptions::default());

    let key = key_of(&w, "E1", "A-1");
    w.document.edit("E1", "A-1", at(1), |f| f.title = "Local".into());
    w.tracker.edit(&key, at(2), |f| f.title = "Remote".into());

    let result = orchestrator.sync(&w.epics, &SyncOptions::default());
    assert_eq!(result.counts.conflicted, 1);
    assert_eq!(result.unresolved_conflicts.len(), 1);
    assert_eq!(w.tracker.issue(&key).unwrap().fields.title, "Remote");
    assert_eq!(w.document.entity("E1", "A-1").unwrap().fields.title, "Local");
}
