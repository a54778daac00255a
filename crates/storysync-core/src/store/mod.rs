//! Persistence of base snapshots and operation replay logs.
//!
//! Base snapshots are keyed by entity id and written only after an entity's
//! transaction commits. Replay logs are keyed by run id and only ever grow.

pub mod file;
pub mod memory;

use std::io;
use std::path::PathBuf;

use crate::error::ErrorCode;
use crate::lock::LockError;
use crate::model::{BaseSnapshot, EntityId};

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("corrupt record {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } | Self::Corrupt { .. } => ErrorCode::StoreReadFailed,
            Self::Write { .. } => ErrorCode::StoreWriteFailed,
            Self::Lock(err) => err.code(),
        }
    }
}

/// Where sync state lives between runs.
///
/// Implementations must be safe to share between workers; the engine
/// serializes access per entity id, not per store.
pub trait StateStore: Send + Sync {
    /// `None` on the first sync of an entity.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the record exists but cannot be read.
    fn load_base_snapshot(&self, entity_id: &EntityId) -> Result<Option<BaseSnapshot>, StoreError>;

    /// Create or overwrite the base snapshot of `snapshot.entity_id()`.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the record cannot be written.
    fn save_base_snapshot(&self, snapshot: &BaseSnapshot) -> Result<(), StoreError>;

    /// Forget an entity. Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the record exists but cannot be removed.
    fn delete_base_snapshot(&self, entity_id: &EntityId) -> Result<(), StoreError>;

    /// Every base snapshot recorded for an epic, ordered by entity id.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the snapshots cannot be listed or read.
    fn list_base_snapshots(&self, epic_key: &str) -> Result<Vec<BaseSnapshot>, StoreError>;

    /// Operation hashes recorded for a run, oldest first. Empty for an
    /// unknown run.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the log exists but cannot be read.
    fn load_operation_log(&self, run_id: &str) -> Result<Vec<String>, StoreError>;

    /// # Errors
    ///
    /// [`StoreError`] if the log cannot be appended to.
    fn append_operation_log(&self, run_id: &str, operation_hash: &str) -> Result<(), StoreError>;
}
