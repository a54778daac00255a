use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{StateStore, StoreError};
use crate::model::{BaseSnapshot, EntityId};

#[derive(Debug, Default)]
struct Inner {
    snapshots: BTreeMap<EntityId, BaseSnapshot>,
    logs: HashMap<String, Vec<String>>,
}

/// State store held in memory. State is lost when the store is dropped.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }
}

impl StateStore for MemoryStateStore {
    fn load_base_snapshot(&self, entity_id: &EntityId) -> Result<Option<BaseSnapshot>, StoreError> {
        Ok(self.lock().snapshots.get(entity_id).cloned())
    }

    fn save_base_snapshot(&self, snapshot: &BaseSnapshot) -> Result<(), StoreError> {
        self.lock()
            .snapshots
            .insert(snapshot.entity_id().clone(), snapshot.clone());
        Ok(())
    }

    fn delete_base_snapshot(&self, entity_id: &EntityId) -> Result<(), StoreError> {
        self.lock().snapshots.remove(entity_id);
        Ok(())
    }

    fn list_base_snapshots(&self, epic_key: &str) -> Result<Vec<BaseSnapshot>, StoreError> {
        Ok(self
            .lock()
            .snapshots
            .values()
            .filter(|s| s.epic_key == epic_key)
            .cloned()
            .collect())
    }

    fn load_operation_log(&self, run_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().logs.get(run_id).cloned().unwrap_or_default())
    }

    fn append_operation_log(&self, run_id: &str, operation_hash: &str) -> Result<(), StoreError> {
        self.lock()
            .logs
            .entry(run_id.to_string())
            .or_default()
            .push(operation_hash.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntitySnapshot};
    use chrono::Utc;

    fn base(epic: &str, id: &str) -> BaseSnapshot {
        BaseSnapshot {
            epic_key: epic.into(),
            snapshot: EntitySnapshot::of_entity(&Entity::story(id, "t")),
            synced_at: Utc::now(),
            run_id: "run-1".into(),
        }
    }

    #[test]
    fn load_or_none() {
        let store = MemoryStateStore::new();
        assert!(store.load_base_snapshot(&"US-1".into()).unwrap().is_none());
        store.save_base_snapshot(&base("E1", "US-1")).unwrap();
        assert!(store.load_base_snapshot(&"US-1".into()).unwrap().is_some());
        store.delete_base_snapshot(&"US-1".into()).unwrap();
        store.delete_base_snapshot(&"US-1".into()).unwrap();
        assert_eq!(store.snapshot_count(), 0);
    }

    #[test]
    fn list_filters_by_epic() {
        let store = MemoryStateStore::new();
        store.save_base_snapshot(&base("E1", "US-2")).unwrap();
        store.save_base_snapshot(&base("E1", "US-1")).unwrap();
        store.save_base_snapshot(&base("E2", "US-3")).unwrap();
        let listed = store.list_base_snapshots("E1").unwrap();
        let ids: Vec<&str> = listed.iter().map(|b| b.entity_id().as_str()).collect();
        assert_eq!(ids, vec!["US-1", "US-2"]);
    }

    #[test]
    fn operation_log_appends_per_run() {
        let store = MemoryStateStore::new();
        store.append_operation_log("r1", "h1").unwrap();
        store.append_operation_log("r1", "h2").unwrap();
        store.append_operation_log("r2", "h3").unwrap();
        assert_eq!(store.load_operation_log("r1").unwrap(), vec!["h1", "h2"]);
        assert!(store.load_operation_log("nope").unwrap().is_empty());
    }
}
