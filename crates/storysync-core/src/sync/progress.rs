//! Per-epic progress reporting.
//!
//! Workers never share the progress map. Each update is sent over a channel
//! to a single aggregator thread that owns the map; snapshots are requested
//! over the same channel and answered on a reply channel. The user callback,
//! if any, runs on the aggregator thread, so a slow callback delays
//! snapshots but never a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl EpicStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Steps of one epic's sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Initialized,
    Fetching,
    Diffing,
    ConflictCheck,
    Merging,
    Transacting,
    Persisting,
    Completed,
    Failed,
}

impl SyncPhase {
    /// Progress fraction reached when the phase starts.
    #[must_use]
    pub const fn fraction(self) -> f64 {
        match self {
            Self::Initialized => 0.0,
            Self::Fetching => 0.1,
            Self::Diffing => 0.25,
            Self::ConflictCheck => 0.4,
            Self::Merging => 0.55,
            Self::Transacting => 0.7,
            Self::Persisting => 0.9,
            Self::Completed | Self::Failed => 1.0,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Fetching => "FETCHING",
            Self::Diffing => "DIFFING",
            Self::ConflictCheck => "CONFLICT_CHECK",
            Self::Merging => "MERGING",
            Self::Transacting => "TRANSACTING",
            Self::Persisting => "PERSISTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicProgress {
    pub epic_key: String,
    pub status: EpicStatus,
    pub phase: SyncPhase,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EpicProgress {
    #[must_use]
    pub fn pending(epic_key: impl Into<String>) -> Self {
        Self {
            epic_key: epic_key.into(),
            status: EpicStatus::Pending,
            phase: SyncPhase::Initialized,
            progress: 0.0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Receives `(epic, status, phase, progress)` at every state transition.
///
/// Must not block: it runs on the worker's thread.
pub trait ProgressSink: Send + Sync {
    fn report(&self, epic_key: &str, status: EpicStatus, phase: SyncPhase, progress: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, EpicStatus, SyncPhase, f64) + Send + Sync,
{
    fn report(&self, epic_key: &str, status: EpicStatus, phase: SyncPhase, progress: f64) {
        self(epic_key, status, phase, progress);
    }
}

/// Discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _: &str, _: EpicStatus, _: SyncPhase, _: f64) {}
}

/// User callback shared with the aggregator thread.
pub type ProgressCallback = Arc<dyn Fn(&str, EpicStatus, SyncPhase, f64) + Send + Sync>;

// ---------------------------------------------------------------------------
// Aggregator actor
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Update {
    epic_key: String,
    status: EpicStatus,
    phase: SyncPhase,
    progress: f64,
    at: DateTime<Utc>,
}

enum Message {
    Update(Update),
    Snapshot(Sender<Vec<EpicProgress>>),
}

/// Cheap, cloneable sender side of the aggregator.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Sender<Message>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update(update) => f.debug_tuple("Update").field(update).finish(),
            Self::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

impl ProgressHandle {
    /// Current progress of every known epic, ordered by epic key. Empty once
    /// the aggregator has stopped.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EpicProgress> {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(Message::Snapshot(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.recv().unwrap_or_default()
    }
}

impl ProgressSink for ProgressHandle {
    fn report(&self, epic_key: &str, status: EpicStatus, phase: SyncPhase, progress: f64) {
        let update = Update {
            epic_key: epic_key.to_string(),
            status,
            phase,
            progress: progress.clamp(0.0, 1.0),
            at: Utc::now(),
        };
        if self.tx.send(Message::Update(update)).is_err() {
            tracing::trace!(epic = epic_key, "progress aggregator gone, update dropped");
        }
    }
}

/// Owns the progress map on its own thread.
#[derive(Debug)]
pub struct ProgressAggregator {
    handle: ProgressHandle,
    thread: Option<JoinHandle<Vec<EpicProgress>>>,
}

impl ProgressAggregator {
    /// Start the aggregator with every epic `Pending`.
    #[must_use]
    pub fn spawn<'a>(epics: impl IntoIterator<Item = &'a str>, callback: Option<ProgressCallback>) -> Self {
        let map: BTreeMap<String, EpicProgress> = epics
            .into_iter()
            .map(|key| (key.to_string(), EpicProgress::pending(key)))
            .collect();
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("storysync-progress".to_string())
            .spawn(move || aggregate(&rx, map, callback.as_deref()))
            .map_err(|err| tracing::error!(%err, "failed to spawn progress aggregator"))
            .ok();
        Self {
            handle: ProgressHandle { tx },
            thread,
        }
    }

    #[must_use]
    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    /// Stop the aggregator once every handle is dropped and return the final
    /// map.
    #[must_use]
    pub fn finish(self) -> Vec<EpicProgress> {
        let Self { handle, thread } = self;
        drop(handle);
        thread
            .and_then(|t| t.join().map_err(|_| tracing::error!("progress aggregator panicked")).ok())
            .unwrap_or_default()
    }
}

fn aggregate(
    rx: &Receiver<Message>,
    mut map: BTreeMap<String, EpicProgress>,
    callback: Option<&(dyn Fn(&str, EpicStatus, SyncPhase, f64) + Send + Sync)>,
) -> Vec<EpicProgress> {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Update(update) => {
                let entry = map
                    .entry(update.epic_key.clone())
                    .or_insert_with(|| EpicProgress::pending(&update.epic_key));
                if update.status == EpicStatus::Running && entry.started_at.is_none() {
                    entry.started_at = Some(update.at);
                }
                if update.status.is_terminal() {
                    entry.finished_at = Some(update.at);
                }
                entry.status = update.status;
                entry.phase = update.phase;
                entry.progress = update.progress;
                if let Some(cb) = callback {
                    cb(&update.epic_key, update.status, update.phase, update.progress);
                }
            }
            Message::Snapshot(reply) => {
                let _ = reply.send(map.values().cloned().collect());
            }
        }
    }
    map.into_values().collect()
}
