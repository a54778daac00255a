//! storysync-core library.
//!
//! Keeps a local story document and a remote issue tracker in agreement.
//! Each epic is synced by diffing both sides against the last agreed
//! snapshot, merging field by field, and pushing remote changes as a
//! transaction that rolls back on failure. Epics run in dependency order
//! on a worker pool.
//!
//! ```text
//! SyncRegistry ──build_context──▶ SyncContext
//!                                    │
//!            ParallelSyncOrchestrator┤ (schedule, workers, timeouts)
//!                                    ▼
//!                           BidirectionalSync (one epic)
//!                 fetch ▸ diff ▸ conflicts ▸ merge ▸ transact ▸ persist
//! ```
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums per layer, folded into [`SyncError`].
//!   Every error has a stable [`ErrorCode`].
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).
//!   Each epic runs inside a `sync_epic` span.

pub mod adapter;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod lock;
pub mod model;
pub mod registry;
pub mod store;
pub mod sync;

pub use error::{ErrorCode, SyncError};
pub use registry::{Secret, SyncRegistry};
pub use sync::{
    BidirectionalSync, EpicResult, ParallelSyncConfig, ParallelSyncOrchestrator, SyncContext, SyncOptions,
    SyncResult,
};
