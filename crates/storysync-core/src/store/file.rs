//! File-backed state store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/store.lock              advisory lock (shared for reads, exclusive for writes)
//! <root>/snapshots/<id>.json     one base snapshot per entity
//! <root>/runs/<run_id>.log       one operation hash per line, append-only
//! ```
//!
//! Snapshot writes go to a temporary file in the same directory and are
//! renamed into place, so a crash never leaves a half-written snapshot.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{StateStore, StoreError};
use crate::lock::{StoreReadLock, StoreWriteLock};
use crate::model::{BaseSnapshot, EntityId};

const LOCK_FILE: &str = "store.lock";
const SNAPSHOT_DIR: &str = "snapshots";
const RUN_DIR: &str = "runs";

#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FileStateStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Write`] if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join(SNAPSHOT_DIR), root.join(RUN_DIR)] {
            fs::create_dir_all(&dir).map_err(|source| StoreError::Write { path: dir, source })?;
        }
        Ok(Self { root, lock_timeout })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn snapshot_path(&self, entity_id: &EntityId) -> PathBuf {
        self.root
            .join(SNAPSHOT_DIR)
            .join(format!("{}.json", file_stem(entity_id.as_str())))
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.root.join(RUN_DIR).join(format!("{}.log", file_stem(run_id)))
    }

    fn read_snapshot(path: &Path) -> Result<Option<BaseSnapshot>, StoreError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }
}

/// Map an id to a file name: ASCII alphanumerics, `-`, `_` and `.` are kept,
/// everything else becomes `%XX`.
fn file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(char::from(byte)),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl StateStore for FileStateStore {
    fn load_base_snapshot(&self, entity_id: &EntityId) -> Result<Option<BaseSnapshot>, StoreError> {
        let _lock = StoreReadLock::acquire(&self.lock_path(), self.lock_timeout)?;
        Self::read_snapshot(&self.snapshot_path(entity_id))
    }

    fn save_base_snapshot(&self, snapshot: &BaseSnapshot) -> Result<(), StoreError> {
        let path = self.snapshot_path(snapshot.entity_id());
        let json = serde_json::to_vec_pretty(snapshot).map_err(|err| StoreError::Corrupt {
            path: path.clone(),
            message: err.to_string(),
        })?;

        let _lock = StoreWriteLock::acquire(&self.lock_path(), self.lock_timeout)?;
        let tmp = path.with_extension("json.tmp");
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::trace!(entity = %snapshot.entity_id(), path = %path.display(), "base snapshot saved");
        Ok(())
    }

    fn delete_base_snapshot(&self, entity_id: &EntityId) -> Result<(), StoreError> {
        let path = self.snapshot_path(entity_id);
        let _lock = StoreWriteLock::acquire(&self.lock_path(), self.lock_timeout)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }

    fn list_base_snapshots(&self, epic_key: &str) -> Result<Vec<BaseSnapshot>, StoreError> {
        let dir = self.root.join(SNAPSHOT_DIR);
        let _lock = StoreReadLock::acquire(&self.lock_path(), self.lock_timeout)?;
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Read {
            path: dir.clone(),
            source,
        })?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_snapshot(&path)? {
                Some(snapshot) if snapshot.epic_key == epic_key => out.push(snapshot),
                _ => {}
            }
        }
        out.sort_by(|a, b| a.entity_id().cmp(b.entity_id()));
        Ok(out)
    }

    fn load_operation_log(&self, run_id: &str) -> Result<Vec<String>, StoreError> {
        let path = self.log_path(run_id);
        let _lock = StoreReadLock::acquire(&self.lock_path(), self.lock_timeout)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(StoreError::Read { path, source }),
        }
    }

    fn append_operation_log(&self, run_id: &str, operation_hash: &str) -> Result<(), StoreError> {
        let path = self.log_path(run_id);
        let _lock = StoreWriteLock::acquire(&self.lock_path(), self.lock_timeout)?;
        let append = || -> io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{operation_hash}")?;
            file.sync_data()
        };
        append().map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntitySnapshot};
    use chrono::Utc;

    fn store() -> (tempfile::TempDir, FileStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path().join("state"), Duration::from_millis(200)).unwrap();
        (dir, store)
    }

    fn base(epic: &str, id: &str, title: &str) -> BaseSnapshot {
        BaseSnapshot {
            epic_key: epic.into(),
            snapshot: EntitySnapshot::of_entity(&Entity::story(id, title)),
            synced_at: Utc::now(),
            run_id: "run-1".into(),
        }
    }

    #[test]
    fn snapshot_survives_reopen() {
        let (dir, store) = store();
        let snap = base("E1", "US-1", "Checkout");
        store.save_base_snapshot(&snap).unwrap();

        let reopened = FileStateStore::open(dir.path().join("state"), Duration::from_millis(200)).unwrap();
        let loaded = reopened.load_base_snapshot(&"US-1".into()).unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let (_dir, store) = store();
        assert!(store.load_base_snapshot(&"nope".into()).unwrap().is_none());
        store.delete_base_snapshot(&"nope".into()).unwrap();
    }

    #[test]
    fn overwrite_and_delete() {
        let (_dir, store) = store();
        store.save_base_snapshot(&base("E1", "US-1", "A")).unwrap();
        store.save_base_snapshot(&base("E1", "US-1", "B")).unwrap();
        let loaded = store.load_base_snapshot(&"US-1".into()).unwrap().unwrap();
        assert_eq!(loaded.snapshot.to_fields().title, "B");
        store.delete_base_snapshot(&"US-1".into()).unwrap();
        assert!(store.load_base_snapshot(&"US-1".into()).unwrap().is_none());
    }

    #[test]
    fn list_filters_by_epic_and_sorts() {
        let (_dir, store) = store();
        store.save_base_snapshot(&base("E1", "US-2", "b")).unwrap();
        store.save_base_snapshot(&base("E2", "US-9", "x")).unwrap();
        store.save_base_snapshot(&base("E1", "US-1", "a")).unwrap();
        let ids: Vec<String> = store
            .list_base_snapshots("E1")
            .unwrap()
            .iter()
            .map(|b| b.entity_id().to_string())
            .collect();
        assert_eq!(ids, vec!["US-1", "US-2"]);
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let (_dir, store) = store();
        let path = store.snapshot_path(&"US-1".into());
        fs::write(&path, "{not json").unwrap();
        let err = store.load_base_snapshot(&"US-1".into()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert_eq!(err.code(), crate::error::ErrorCode::StoreReadFailed);
    }

    #[test]
    fn operation_log_is_append_only() {
        let (_dir, store) = store();
        store.append_operation_log("run/1", "blake3:aa").unwrap();
        store.append_operation_log("run/1", "blake3:bb").unwrap();
        assert_eq!(
            store.load_operation_log("run/1").unwrap(),
            vec!["blake3:aa", "blake3:bb"]
        );
        assert!(store.load_operation_log("run-2").unwrap().is_empty());
    }

    #[test]
    fn file_stem_escapes_path_characters() {
        assert_eq!(file_stem("US-1.2"), "US-1.2");
        assert_eq!(file_stem("a/b"), "a%2Fb");
        assert_eq!(file_stem("..x"), "%2E.x");
    }
}
