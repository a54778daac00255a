//! The sync engine.
//!
//! ## Submodules
//!
//! - [`conflict`]: field-level three-way classification.
//! - [`text`]: line-based three-way text merge.
//! - [`merge`]: strategies, operator resolutions and deletion decisions.
//! - [`idempotency`]: content and operation fingerprints, replay logs.
//! - [`transaction`]: ordered remote operations with compensating rollback.
//! - [`matcher`]: title matching for entities without a remote key.
//! - [`progress`]: phases, per-epic progress and the aggregator thread.
//! - [`result`]: epic and run reports.
//! - [`bidirectional`]: one epic, fetch to persist.
//! - [`parallel`]: many epics, dependency-ordered, on a worker pool.

pub mod bidirectional;
pub mod conflict;
pub mod idempotency;
pub mod matcher;
pub mod merge;
pub mod parallel;
pub mod progress;
pub mod result;
pub mod text;
pub mod transaction;

pub use bidirectional::{BidirectionalSync, RunControl, SyncContext, SyncOptions, new_run_id};
pub use conflict::{Conflict, ConflictReport, ConflictType};
pub use idempotency::{IdempotencyCheck, IdempotencyGuard, IdempotencyStatus};
pub use matcher::{NormalizedContainmentMatcher, TitleMatcher, normalize_title};
pub use merge::{DeletionDecision, MergeConfig, MergeResult, MergeStrategy, Resolutions, Side, ThreeWayMerger};
pub use parallel::{ExecutionStrategy, ParallelSyncConfig, ParallelSyncOrchestrator};
pub use progress::{EpicProgress, EpicStatus, NoProgress, ProgressCallback, ProgressSink, SyncPhase};
pub use result::{EntityDisposition, EntityOutcome, EpicError, EpicResult, SyncCounts, SyncResult};
pub use transaction::{
    FailedOperation, Operation, OperationKind, RollbackOutcome, Transaction, TransactionError, TransactionManager,
    TransactionState,
};
