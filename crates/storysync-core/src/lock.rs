use crate::error::ErrorCode;
use crate::model::EntityId;
use fs2::FileExt;
use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

/// Lock errors for the state directory and for in-process entity locks.
#[derive(Debug)]
pub enum LockError {
    Timeout { path: PathBuf, waited: Duration },
    EntityBusy { entity: EntityId, waited: Duration },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } | Self::EntityBusy { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::StoreWriteFailed,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => {
                write!(
                    f,
                    "{}: lock timed out after {:?} at {}",
                    self.code().code(),
                    waited,
                    path.display()
                )
            }
            Self::EntityBusy { entity, waited } => {
                write!(
                    f,
                    "{}: entity '{entity}' still locked after {waited:?}",
                    self.code().code()
                )
            }
            Self::IoError(err) => write!(f, "{}: {}", self.code().code(), err),
        }
    }
}

impl std::error::Error for LockError {}

// ---------------------------------------------------------------------------
// Advisory file locks
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    fn acquire(path: &Path, timeout: Duration, kind: LockKind) -> Result<Self, LockError> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent")
        })?;
        fs::create_dir_all(parent)?;

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            let busy = match kind {
                LockKind::Shared => file.try_lock_shared().is_err(),
                LockKind::Exclusive => file.try_lock_exclusive().is_err(),
            };

            if !busy {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// RAII guard for the exclusive lock taken while writing the state store.
#[derive(Debug)]
pub struct StoreWriteLock {
    guard: FileGuard,
}

impl StoreWriteLock {
    /// Acquire an exclusive advisory lock on the lock path.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if another holder keeps the lock past `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            guard: FileGuard::acquire(path, timeout, LockKind::Exclusive)?,
        })
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

/// RAII guard for the shared lock taken while reading the state store.
#[derive(Debug)]
pub struct StoreReadLock {
    guard: FileGuard,
}

impl StoreReadLock {
    /// Acquire a shared advisory lock on the lock path.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if a writer keeps the lock past `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            guard: FileGuard::acquire(path, timeout, LockKind::Shared)?,
        })
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

// ---------------------------------------------------------------------------
// In-process entity locks
// ---------------------------------------------------------------------------

/// Serializes work on the same entity across concurrently running epics.
#[derive(Debug, Default)]
pub struct EntityLockTable {
    held: Mutex<HashSet<EntityId>>,
    released: Condvar,
}

impl EntityLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<EntityId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout` for `id` to be free, then hold it until the
    /// guard drops.
    ///
    /// # Errors
    ///
    /// [`LockError::EntityBusy`] if the entity is still held at the deadline.
    pub fn acquire(&self, id: &EntityId, timeout: Duration) -> Result<EntityLockGuard<'_>, LockError> {
        let start = Instant::now();
        let mut held = self.lock();
        while held.contains(id) {
            let waited = start.elapsed();
            let Some(remaining) = timeout.checked_sub(waited).filter(|d| !d.is_zero()) else {
                return Err(LockError::EntityBusy {
                    entity: id.clone(),
                    waited,
                });
            };
            held = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        held.insert(id.clone());
        Ok(EntityLockGuard {
            table: self,
            id: id.clone(),
        })
    }

    #[must_use]
    pub fn is_held(&self, id: &EntityId) -> bool {
        self.lock().contains(id)
    }

    fn release(&self, id: &EntityId) {
        self.lock().remove(id);
        self.released.notify_all();
    }
}

/// Holds one entity of an [`EntityLockTable`].
#[derive(Debug)]
pub struct EntityLockGuard<'a> {
    table: &'a EntityLockTable,
    id: EntityId,
}

impl EntityLockGuard<'_> {
    #[must_use]
    pub const fn entity(&self) -> &EntityId {
        &self.id
    }
}

impl Drop for EntityLockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityLockTable, LockError, StoreReadLock, StoreWriteLock};
    use crate::error::ErrorCode;
    use crate::model::EntityId;
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    fn lock_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        dir.path().join("locks").join(name)
    }

    #[test]
    fn write_lock_times_out_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir, "timeout.lock");
        let guard = StoreWriteLock::acquire(&path, Duration::from_millis(50)).unwrap();
        assert_eq!(guard.path(), path.as_path());
        let err = StoreWriteLock::acquire(&path, Duration::from_millis(20)).unwrap_err();

        assert!(matches!(err, LockError::Timeout { path: p, .. } if p == path));
    }

    #[test]
    fn read_locks_are_compatible() -> Result<(), LockError> {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir, "read-share.lock");
        let first = StoreReadLock::acquire(&path, Duration::from_millis(50))?;
        let second = StoreReadLock::acquire(&path, Duration::from_millis(50))?;
        assert_eq!(first.path(), second.path());
        Ok(())
    }

    #[test]
    fn writer_blocks_readers_until_released() -> Result<(), LockError> {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir, "write-blocks-read.lock");
        {
            let _write = StoreWriteLock::acquire(&path, Duration::from_millis(50))?;
            assert!(matches!(
                StoreReadLock::acquire(&path, Duration::from_millis(20)),
                Err(LockError::Timeout { .. })
            ));
        }
        let _read = StoreReadLock::acquire(&path, Duration::from_millis(50))?;
        Ok(())
    }

    #[test]
    fn lock_error_maps_to_machine_code() {
        let busy = LockError::EntityBusy {
            entity: EntityId::new("US-1"),
            waited: Duration::from_millis(10),
        };
        assert_eq!(busy.code(), ErrorCode::LockContention);
        assert!(busy.hint().is_some());
        assert!(busy.to_string().starts_with("E5003"));
    }

    #[test]
    fn entity_lock_is_exclusive_per_id() {
        let table = EntityLockTable::new();
        let a = EntityId::new("US-1");
        let b = EntityId::new("US-2");
        let guard = table.acquire(&a, Duration::ZERO).unwrap();
        assert!(table.acquire(&b, Duration::ZERO).is_ok());
        assert!(matches!(
            table.acquire(&a, Duration::from_millis(10)),
            Err(LockError::EntityBusy { .. })
        ));
        drop(guard);
        assert!(!table.is_held(&a));
        assert!(table.acquire(&a, Duration::ZERO).is_ok());
    }

    #[test]
    fn entity_lock_waiter_wakes_on_release() {
        let table = Arc::new(EntityLockTable::new());
        let id = EntityId::new("US-1");
        let held = Arc::new(Barrier::new(2));

        let worker = {
            let table = Arc::clone(&table);
            let held = Arc::clone(&held);
            let id = id.clone();
            thread::spawn(move || {
                let _guard = table.acquire(&id, Duration::ZERO).unwrap();
                held.wait();
                thread::sleep(Duration::from_millis(20));
            })
        };

        held.wait();
        let guard = table.acquire(&id, Duration::from_secs(5)).unwrap();
        assert_eq!(guard.entity(), &id);
        worker.join().unwrap();
    }
}
