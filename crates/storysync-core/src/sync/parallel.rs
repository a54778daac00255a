//! Many epics at once.
//!
//! Epics run on a fixed pool of worker threads. An epic whose
//! `depends_on` names another epic of the same batch is dispatched only
//! after that epic completed; if it failed, the dependent fails without
//! running. Epics on a dependency cycle fail up front.
//!
//! The coordinator (the calling thread) owns the schedule. Workers pull
//! jobs from a shared queue and send results back; nothing else is shared
//! between them except the tracker, the document, the state store and the
//! entity lock table.
//!
//! A per-epic timeout is enforced twice: cooperatively inside the epic
//! (between phases and between entity transactions), and by the
//! coordinator, which marks the epic failed at its deadline even if the
//! worker is stuck in a slow call. A worker is never interrupted. When its
//! late result arrives, the entities it committed are folded into the
//! reported failure; the epic stays failed with its timeout error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::bidirectional::{BidirectionalSync, RunControl, SyncContext, SyncOptions, new_run_id};
use super::progress::{
    EpicProgress, EpicStatus, ProgressAggregator, ProgressCallback, ProgressHandle, ProgressSink, SyncPhase,
};
use super::result::{EpicError, EpicResult, SyncResult};
use crate::error::ErrorCode;
use crate::graph::{Dependency, DependencyGraph, DependencyType};
use crate::model::Epic;

/// How epics are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One epic at a time on the calling thread.
    Sequential,
    /// A fixed pool of `max_workers` threads.
    #[default]
    ThreadPool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelSyncConfig {
    pub max_workers: usize,
    pub strategy: ExecutionStrategy,
    pub epic_timeout: Option<Duration>,
    /// Stop dispatching after the first failed epic.
    pub fail_fast: bool,
}

impl Default for ParallelSyncConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            strategy: ExecutionStrategy::ThreadPool,
            epic_timeout: None,
            fail_fast: false,
        }
    }
}

impl ParallelSyncConfig {
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            max_workers: 1,
            strategy: ExecutionStrategy::Sequential,
            ..Self::default()
        }
    }
}

/// Runs a batch of epics, honoring their dependencies.
pub struct ParallelSyncOrchestrator {
    ctx: SyncContext,
    config: ParallelSyncConfig,
    callback: Option<ProgressCallback>,
    live: Mutex<Option<ProgressHandle>>,
    last: Mutex<Vec<EpicProgress>>,
    control: Mutex<Option<RunControl>>,
}

impl std::fmt::Debug for ParallelSyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelSyncOrchestrator")
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ParallelSyncOrchestrator {
    #[must_use]
    pub fn new(ctx: SyncContext, config: ParallelSyncConfig) -> Self {
        Self {
            ctx,
            config,
            callback: None,
            live: Mutex::new(None),
            last: Mutex::new(Vec::new()),
            control: Mutex::new(None),
        }
    }

    /// Called on every epic state transition, from the progress thread.
    #[must_use]
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ParallelSyncConfig {
        &self.config
    }

    /// Progress of the running batch, or of the last one once it finished.
    #[must_use]
    pub fn get_progress(&self) -> Vec<EpicProgress> {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match live {
            Some(handle) => handle.snapshot(),
            None => self.last.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    /// Cancel the running batch. Epics stop at their next checkpoint;
    /// undispatched epics are reported as not started.
    pub fn cancel(&self) {
        if let Some(control) = self.control.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            tracing::info!("cancelling sync run");
            control.cancel();
        }
    }

    /// Sync every epic of the batch.
    pub fn sync(&self, epics: &[Epic], options: &SyncOptions) -> SyncResult {
        let started_at = Utc::now();
        let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
        let span = tracing::info_span!("sync_run", run_id = %run_id, epics = epics.len());
        let _enter = span.enter();

        let mut schedule = Schedule::new(epics);
        let aggregator = ProgressAggregator::spawn(schedule.keys.iter().map(String::as_str), self.callback.clone());
        let handle = aggregator.handle();
        let control = RunControl::new();
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        *self.control.lock().unwrap_or_else(PoisonError::into_inner) = Some(control.clone());

        schedule.fail_cycles(&handle);
        tracing::info!(
            epics = schedule.keys.len(),
            workers = self.config.max_workers,
            strategy = ?self.config.strategy,
            dry_run = options.dry_run,
            "starting sync run"
        );

        let runner = Runner {
            ctx: &self.ctx,
            config: &self.config,
            options,
            run_id: &run_id,
            handle: &handle,
            control: &control,
        };
        let fatal = match self.config.strategy {
            ExecutionStrategy::Sequential => runner.run_sequential(&mut schedule),
            ExecutionStrategy::ThreadPool => runner.run_pool(&mut schedule),
        };

        drop(handle);
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.control.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let progress = aggregator.finish();

        let cancelled = control.is_cancelled() && !fatal;
        let (epic_results, not_started) = schedule.into_results();
        let mut result = SyncResult::from_epics(run_id, started_at, epic_results);
        result.dry_run = options.dry_run;
        result.not_started = not_started;
        result.cancelled = cancelled;
        result.progress = reconcile(progress, &result);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = result.progress.clone();

        tracing::info!(
            created = result.counts.created,
            updated = result.counts.updated,
            skipped = result.counts.skipped,
            conflicted = result.counts.conflicted,
            failed = result.counts.failed,
            not_started = result.not_started.len(),
            "sync run finished"
        );
        result
    }
}

/// Late worker updates can leave the progress map disagreeing with the
/// recorded result of a timed-out epic; the result wins.
fn reconcile(mut progress: Vec<EpicProgress>, result: &SyncResult) -> Vec<EpicProgress> {
    for entry in &mut progress {
        let Some(epic) = result.epic(&entry.epic_key) else {
            continue;
        };
        if entry.status != epic.status {
            entry.status = epic.status;
            entry.phase = if epic.is_success() {
                SyncPhase::Completed
            } else {
                SyncPhase::Failed
            };
            entry.progress = 1.0;
            entry.finished_at = Some(epic.finished_at);
        }
    }
    progress
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Slot {
    Waiting,
    Running { started_at: DateTime<Utc> },
    Done(EpicResult),
}

/// Dependency-aware dispatch order. Owned by the coordinator only.
#[derive(Debug)]
struct Schedule {
    keys: Vec<String>,
    /// Indices of the epics each epic waits for.
    prereqs: Vec<Vec<usize>>,
    cyclic: HashSet<usize>,
    slots: Vec<Slot>,
}

impl Schedule {
    fn new(epics: &[Epic]) -> Self {
        let mut keys: Vec<String> = Vec::with_capacity(epics.len());
        let mut index: HashMap<&str, usize> = HashMap::new();
        for epic in epics {
            if index.contains_key(epic.key.as_str()) {
                tracing::warn!(epic = %epic.key, "epic listed twice, ignoring the duplicate");
                continue;
            }
            index.insert(epic.key.as_str(), keys.len());
            keys.push(epic.key.clone());
        }

        let mut prereqs = vec![Vec::new(); keys.len()];
        let mut deps = Vec::new();
        for epic in epics {
            let Some(&i) = index.get(epic.key.as_str()) else {
                continue;
            };
            for dep in &epic.depends_on {
                match index.get(dep.as_str()) {
                    Some(&j) if j != i && !prereqs[i].contains(&j) => {
                        prereqs[i].push(j);
                        deps.push(Dependency::new(epic.key.as_str(), dep.as_str(), DependencyType::DependsOn));
                    }
                    Some(_) => {}
                    None => tracing::debug!(epic = %epic.key, dependency = %dep, "dependency outside the batch, ignored"),
                }
            }
        }

        let graph = DependencyGraph::build(keys.iter().map(String::as_str), deps);
        let cyclic = if graph.has_cycles() {
            graph
                .detect_cycles()
                .iter()
                .flat_map(|cycle| cycle.nodes.iter())
                .filter_map(|key| index.get(key.as_str()).copied())
                .collect()
        } else {
            HashSet::new()
        };

        let slots = keys.iter().map(|_| Slot::Waiting).collect();
        Self {
            keys,
            prereqs,
            cyclic,
            slots,
        }
    }

    fn fail_cycles(&mut self, progress: &dyn ProgressSink) {
        let mut cyclic: Vec<usize> = self.cyclic.iter().copied().collect();
        cyclic.sort_unstable();
        for i in cyclic {
            tracing::warn!(epic = %self.keys[i], "epic is part of a dependency cycle");
            let error = EpicError::new(ErrorCode::CycleDetected, "epic is part of a dependency cycle");
            self.fail(i, error, progress);
        }
    }

    fn fail(&mut self, i: usize, error: EpicError, progress: &dyn ProgressSink) {
        let result = EpicResult::failed(self.keys[i].clone(), SyncPhase::Initialized, Utc::now(), error);
        progress.report(&self.keys[i], EpicStatus::Failed, SyncPhase::Failed, 1.0);
        self.slots[i] = Slot::Done(result);
    }

    fn succeeded(&self, i: usize) -> Option<bool> {
        match &self.slots[i] {
            Slot::Done(result) => Some(result.is_success()),
            _ => None,
        }
    }

    /// Fail every waiting epic with a failed prerequisite, transitively.
    fn propagate_failures(&mut self, progress: &dyn ProgressSink) {
        loop {
            let failed = (0..self.keys.len()).find_map(|i| {
                if !matches!(self.slots[i], Slot::Waiting) {
                    return None;
                }
                self.prereqs[i]
                    .iter()
                    .find(|&&j| self.succeeded(j) == Some(false))
                    .map(|&j| (i, j))
            });
            let Some((i, j)) = failed else {
                return;
            };
            tracing::warn!(epic = %self.keys[i], dependency = %self.keys[j], "prerequisite epic failed");
            let error = EpicError::new(ErrorCode::DependencyFailed, format!("dependency '{}' failed", self.keys[j]));
            self.fail(i, error, progress);
        }
    }

    /// First waiting epic, in input order, whose prerequisites all succeeded.
    fn next_ready(&mut self) -> Option<usize> {
        let i = (0..self.keys.len()).find(|&i| {
            matches!(self.slots[i], Slot::Waiting) && self.prereqs[i].iter().all(|&j| self.succeeded(j) == Some(true))
        })?;
        self.slots[i] = Slot::Running { started_at: Utc::now() };
        Some(i)
    }

    fn is_running(&self, i: usize) -> bool {
        matches!(self.slots[i], Slot::Running { .. })
    }

    fn complete(&mut self, i: usize, result: EpicResult) {
        self.slots[i] = Slot::Done(result);
    }

    /// Fold the late result of a timed-out epic into its reported failure.
    fn absorb_late(&mut self, i: usize, late: EpicResult) {
        let Slot::Done(reported) = &mut self.slots[i] else {
            self.slots[i] = Slot::Done(late);
            return;
        };
        reported.finished_at = late.finished_at;
        reported.counts = late.counts;
        reported.entities = late.entities;
        reported.remote_only = late.remote_only;
        reported.unresolved = late.unresolved;
        reported.failed_operations = late.failed_operations;
        reported.planned = late.planned;
    }

    fn has_waiting(&self) -> bool {
        self.slots.iter().any(|s| matches!(s, Slot::Waiting))
    }

    /// Results in input order, plus the keys of epics never dispatched.
    fn into_results(self) -> (Vec<EpicResult>, Vec<String>) {
        let mut results = Vec::new();
        let mut not_started = Vec::new();
        for (key, slot) in self.keys.into_iter().zip(self.slots) {
            match slot {
                Slot::Done(result) => results.push(result),
                Slot::Waiting => not_started.push(key),
                Slot::Running { started_at } => {
                    // Only reachable if a worker vanished without a result.
                    let error = EpicError::new(ErrorCode::InternalUnexpected, "worker exited without a result");
                    results.push(EpicResult::failed(key, SyncPhase::Failed, started_at, error));
                }
            }
        }
        (results, not_started)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

struct Job {
    index: usize,
    key: String,
    control: RunControl,
}

struct Runner<'r> {
    ctx: &'r SyncContext,
    config: &'r ParallelSyncConfig,
    options: &'r SyncOptions,
    run_id: &'r str,
    handle: &'r ProgressHandle,
    control: &'r RunControl,
}

impl Runner<'_> {
    fn job_control(&self) -> RunControl {
        self.config
            .epic_timeout
            .map_or_else(|| self.control.clone(), |timeout| self.control.with_timeout(timeout))
    }

    fn sync_one(&self, key: &str, control: RunControl, progress: &dyn ProgressSink) -> EpicResult {
        let started_at = Utc::now();
        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            BidirectionalSync::new(self.ctx, self.options)
                .with_run_id(self.run_id)
                .with_progress(progress)
                .with_control(control)
                .sync_epic(key)
        }));
        run.unwrap_or_else(|_| {
            tracing::error!(epic = key, "epic sync panicked");
            progress.report(key, EpicStatus::Failed, SyncPhase::Failed, 1.0);
            EpicResult::failed(
                key,
                SyncPhase::Failed,
                started_at,
                EpicError::new(ErrorCode::InternalUnexpected, "epic sync panicked"),
            )
        })
    }

    /// After an epic finished: whether dispatching must stop, and whether
    /// the reason is a fatal error.
    fn should_stop(&self, result: &EpicResult) -> (bool, bool) {
        if result.is_fatal() {
            tracing::error!(epic = %result.epic_key, "fatal error, stopping the run");
            self.control.cancel();
            return (true, true);
        }
        if self.config.fail_fast && !result.is_success() {
            tracing::warn!(epic = %result.epic_key, "epic failed, fail-fast stops dispatch");
            return (true, false);
        }
        (self.control.is_cancelled(), false)
    }

    /// Returns whether the run stopped on a fatal error.
    fn run_sequential(&self, schedule: &mut Schedule) -> bool {
        loop {
            schedule.propagate_failures(self.handle);
            if self.control.is_cancelled() {
                return false;
            }
            let Some(i) = schedule.next_ready() else {
                return false;
            };
            let key = schedule.keys[i].clone();
            let result = self.sync_one(&key, self.job_control(), self.handle);
            let (stop, fatal) = self.should_stop(&result);
            schedule.complete(i, result);
            if stop {
                return fatal;
            }
        }
    }

    /// Returns whether the run stopped on a fatal error.
    fn run_pool(&self, schedule: &mut Schedule) -> bool {
        let workers = self.config.max_workers.clamp(1, schedule.keys.len().max(1));
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel::<(usize, EpicResult)>();

        thread::scope(|s| {
            for n in 0..workers {
                let job_rx = Arc::clone(&job_rx);
                let result_tx = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("storysync-worker-{n}"))
                    .spawn_scoped(s, move || {
                        loop {
                            let job = job_rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                            let Ok(job) = job else {
                                break;
                            };
                            let result = self.sync_one(&job.key, job.control, self.handle);
                            if result_tx.send((job.index, result)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(err) = spawned {
                    tracing::error!(%err, worker = n, "failed to spawn worker");
                }
            }
            drop(result_tx);

            let mut busy = 0usize;
            let mut deadlines: HashMap<usize, Instant> = HashMap::new();
            let mut timed_out: HashSet<usize> = HashSet::new();
            let mut stopped = false;
            let mut fatal = false;

            loop {
                if !stopped {
                    schedule.propagate_failures(self.handle);
                    while busy < workers {
                        let Some(i) = schedule.next_ready() else {
                            break;
                        };
                        let job = Job {
                            index: i,
                            key: schedule.keys[i].clone(),
                            control: self.job_control(),
                        };
                        if job_tx.send(job).is_err() {
                            tracing::error!("no worker left to take jobs");
                            stopped = true;
                            break;
                        }
                        busy += 1;
                        if let Some(timeout) = self.config.epic_timeout {
                            deadlines.insert(i, Instant::now() + timeout);
                        }
                    }
                }
                if busy == 0 {
                    break;
                }

                let received = match deadlines.values().min().copied() {
                    Some(deadline) => result_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
                    None => result_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match received {
                    Ok((i, result)) => {
                        busy -= 1;
                        if timed_out.remove(&i) {
                            tracing::warn!(
                                epic = %result.epic_key,
                                created = result.counts.created,
                                updated = result.counts.updated,
                                "timed-out epic finished late"
                            );
                            schedule.absorb_late(i, result);
                            continue;
                        }
                        deadlines.remove(&i);
                        let (stop, was_fatal) = self.should_stop(&result);
                        schedule.complete(i, result);
                        if stop && !stopped {
                            stopped = true;
                            fatal = was_fatal;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        let expired: Vec<usize> =
                            deadlines.iter().filter(|(_, d)| **d <= now).map(|(i, _)| *i).collect();
                        for i in expired {
                            deadlines.remove(&i);
                            if !schedule.is_running(i) {
                                continue;
                            }
                            let timeout = self.config.epic_timeout.unwrap_or_default();
                            tracing::warn!(epic = %schedule.keys[i], ?timeout, "epic timed out");
                            timed_out.insert(i);
                            let started_at = match &schedule.slots[i] {
                                Slot::Running { started_at } => *started_at,
                                _ => Utc::now(),
                            };
                            let message = format!("epic '{}' exceeded its {}ms timeout", schedule.keys[i], timeout.as_millis());
                            let result = EpicResult::failed(
                                schedule.keys[i].clone(),
                                SyncPhase::Failed,
                                started_at,
                                EpicError::new(ErrorCode::EpicTimedOut, message),
                            );
                            self.handle.report(&schedule.keys[i], EpicStatus::Failed, SyncPhase::Failed, 1.0);
                            let (stop, _) = self.should_stop(&result);
                            schedule.complete(i, result);
                            stopped |= stop;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        tracing::error!(busy, "workers exited with epics in flight");
                        break;
                    }
                }
            }
            if schedule.has_waiting() && !stopped {
                tracing::warn!("epics left waiting on unfinished prerequisites");
            }
            drop(job_tx);
            fatal
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, FailureRule, InMemoryDocument, InMemoryTracker, RetryPolicy};
    use crate::model::Entity;
    use crate::store::{MemoryStateStore, StateStore};
    use crate::sync::result::EntityDisposition;

    fn epic(key: &str, deps: &[&str]) -> Epic {
        let mut epic = Epic::new(key, format!("Epic {key}"));
        epic.stories = vec![Entity::story(format!("{key}-S1"), format!("{key} story"))];
        epic.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
        epic
    }

    fn setup(epics: &[Epic], tracker: InMemoryTracker) -> (Arc<InMemoryTracker>, SyncContext) {
        let tracker = Arc::new(tracker);
        for e in epics {
            tracker.insert_epic(e.key.clone(), e.title.clone());
        }
        let document = Arc::new(InMemoryDocument::from_epics(epics.iter().cloned()));
        let ctx = SyncContext::new(tracker.clone(), document, Arc::new(MemoryStateStore::new()))
            .with_retry(RetryPolicy::immediate(1));
        (tracker, ctx)
    }

    fn pool(workers: usize) -> ParallelSyncConfig {
        ParallelSyncConfig {
            max_workers: workers,
            ..ParallelSyncConfig::default()
        }
    }

    #[test]
    fn independent_epics_all_complete() {
        let epics = vec![epic("E1", &[]), epic("E2", &[]), epic("E3", &[])];
        let (tracker, ctx) = setup(&epics, InMemoryTracker::default());
        let orchestrator = ParallelSyncOrchestrator::new(ctx, pool(2));

        let result = orchestrator.sync(&epics, &SyncOptions::default());
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.counts.created, 3);
        assert_eq!(tracker.issues().len(), 3);
        let keys: Vec<_> = result.epic_results.iter().map(|e| e.epic_key.as_str()).collect();
        assert_eq!(keys, ["E1", "E2", "E3"]);
    }

    #[test]
    fn dependent_epic_starts_after_its_prerequisite() {
        let epics = vec![epic("E2", &["E1"]), epic("E1", &[])];
        let (_, ctx) = setup(&epics, InMemoryTracker::default());
        let result = ParallelSyncOrchestrator::new(ctx, pool(4)).sync(&epics, &SyncOptions::default());
        assert!(result.is_success());
        let e1 = result.epic("E1").unwrap();
        let e2 = result.epic("E2").unwrap();
        assert!(e2.started_at >= e1.finished_at);
    }

    #[test]
    fn failed_prerequisite_fails_dependents_without_running_them() {
        let epics = vec![epic("E1", &[]), epic("E2", &["E1"]), epic("E3", &["E2"])];
        let (tracker, ctx) = setup(&epics, InMemoryTracker::default());
        tracker.remove("E1");

        let result = ParallelSyncOrchestrator::new(ctx, pool(2)).sync(&epics, &SyncOptions::default());
        assert_eq!(result.epic("E1").unwrap().status, EpicStatus::Failed);
        for key in ["E2", "E3"] {
            let failed = result.epic(key).unwrap();
            assert_eq!(failed.error.as_ref().unwrap().code, "E6003");
            assert!(failed.entities.is_empty());
        }
    }

    #[test]
    fn cyclic_epics_fail_and_others_proceed() {
        let epics = vec![epic("E1", &["E2"]), epic("E2", &["E1"]), epic("E3", &[])];
        let (_, ctx) = setup(&epics, InMemoryTracker::default());
        let result = ParallelSyncOrchestrator::new(ctx, pool(2)).sync(&epics, &SyncOptions::default());
        for key in ["E1", "E2"] {
            assert_eq!(result.epic(key).unwrap().error.as_ref().unwrap().code, "E2002");
        }
        assert!(result.epic("E3").unwrap().is_success());
    }

    #[test]
    fn fail_fast_leaves_remaining_epics_not_started() {
        let epics = vec![epic("E1", &[]), epic("E2", &[]), epic("E3", &[])];
        let (tracker, ctx) = setup(&epics, InMemoryTracker::default());
        tracker.remove("E1");
        let config = ParallelSyncConfig {
            fail_fast: true,
            ..ParallelSyncConfig::sequential()
        };

        let result = ParallelSyncOrchestrator::new(ctx, config).sync(&epics, &SyncOptions::default());
        assert_eq!(result.epic_results.len(), 1);
        assert_eq!(result.not_started, ["E2", "E3"]);
        assert!(!result.is_success());
    }

    #[test]
    fn fatal_error_stops_the_run() {
        let epics = vec![epic("E1", &[]), epic("E2", &[])];
        let (tracker, ctx) = setup(&epics, InMemoryTracker::default());
        tracker.fail_on(FailureRule::any(AdapterError::Authentication("token expired".into())));

        let result = ParallelSyncOrchestrator::new(ctx, pool(1)).sync(&epics, &SyncOptions::default());
        assert_eq!(result.fatal_error.as_ref().unwrap().code, "E3003");
        assert_eq!(result.not_started, ["E2"]);
        assert!(!result.cancelled);
    }

    #[test]
    fn slow_epic_times_out() {
        let epics = vec![epic("E1", &[])];
        let (_, ctx) = setup(&epics, InMemoryTracker::default().with_latency(Duration::from_millis(60)));
        let config = ParallelSyncConfig {
            epic_timeout: Some(Duration::from_millis(20)),
            ..pool(1)
        };
        let result = ParallelSyncOrchestrator::new(ctx, config).sync(&epics, &SyncOptions::default());
        let e1 = result.epic("E1").unwrap();
        assert_eq!(e1.status, EpicStatus::Failed);
        assert_eq!(e1.error.as_ref().unwrap().code, "E6001");
    }

    #[test]
    fn timed_out_epic_reports_entities_committed_late() {
        let epics = vec![epic("E1", &[])];
        let (tracker, ctx) = setup(&epics, InMemoryTracker::default().with_latency(Duration::from_millis(100)));
        let store = Arc::clone(&ctx.store);
        let config = ParallelSyncConfig {
            epic_timeout: Some(Duration::from_millis(150)),
            ..pool(1)
        };

        // The fetch fits the deadline; the create call overruns it.
        let result = ParallelSyncOrchestrator::new(ctx, config).sync(&epics, &SyncOptions::default());
        let e1 = result.epic("E1").unwrap();
        assert_eq!(e1.status, EpicStatus::Failed);
        assert_eq!(e1.error.as_ref().unwrap().code, "E6001");
        assert_eq!(tracker.issues().len(), 1);
        assert!(store.load_base_snapshot(&"E1-S1".into()).unwrap().is_some());
        assert_eq!(e1.counts.created, 1);
        assert_eq!(e1.entities.len(), 1);
        assert_eq!(e1.entities[0].disposition, EntityDisposition::Created);
        assert_eq!(result.counts.created, 1);
    }

    #[test]
    fn fail_fast_in_pool_stops_dispatching() {
        let epics = vec![epic("E1", &[]), epic("E2", &[]), epic("E3", &[])];
        let (tracker, ctx) = setup(&epics, InMemoryTracker::default());
        tracker.remove("E1");
        let config = ParallelSyncConfig {
            max_workers: 1,
            strategy: ExecutionStrategy::ThreadPool,
            fail_fast: true,
            ..ParallelSyncConfig::default()
        };

        let result = ParallelSyncOrchestrator::new(ctx, config).sync(&epics, &SyncOptions::default());
        assert_eq!(result.epic_results.len(), 1);
        assert_eq!(result.epic("E1").unwrap().status, EpicStatus::Failed);
        assert_eq!(result.not_started, ["E2", "E3"]);
        assert!(tracker.issues().is_empty());
    }

    #[test]
    fn fail_fast_in_pool_lets_running_epics_finish() {
        let epics = vec![epic("E1", &[]), epic("E2", &[]), epic("E3", &[]), epic("E4", &[])];
        let (tracker, ctx) = setup(&epics, InMemoryTracker::default().with_latency(Duration::from_millis(10)));
        tracker.remove("E1");
        let config = ParallelSyncConfig {
            max_workers: 2,
            strategy: ExecutionStrategy::ThreadPool,
            fail_fast: true,
            ..ParallelSyncConfig::default()
        };

        // E1 and E2 are dispatched together; E1 fails on its first call.
        let result = ParallelSyncOrchestrator::new(ctx, config).sync(&epics, &SyncOptions::default());
        assert!(!result.is_success());
        assert!(result.epic("E2").unwrap().is_success());
        assert_eq!(result.epic_results.len() + result.not_started.len(), 4);
        assert!(result.not_started.contains(&"E4".to_string()));
    }

    #[test]
    fn epics_sharing_an_entity_wait_for_its_lock() {
        let epics = vec![epic("E1", &[]), epic("E2", &[])];
        let (_, ctx) = setup(&epics, InMemoryTracker::default());
        let ctx = ctx.with_lock_timeout(Duration::from_millis(20));
        let locks = Arc::clone(&ctx.locks);
        let held = locks.acquire(&"E1-S1".into(), Duration::from_secs(1)).unwrap();

        let orchestrator = ParallelSyncOrchestrator::new(ctx, pool(2));
        let result = orchestrator.sync(&epics, &SyncOptions::default());
        let e1 = result.epic("E1").unwrap();
        assert_eq!(e1.status, EpicStatus::Failed);
        let outcome = e1.entity("E1-S1").unwrap();
        assert_eq!(outcome.disposition, EntityDisposition::Failed);
        assert!(outcome.message.as_deref().unwrap_or_default().contains("E5003"), "{outcome:?}");
        assert!(result.epic("E2").unwrap().is_success());

        drop(held);
        let again = orchestrator.sync(&epics, &SyncOptions::default());
        assert!(again.is_success(), "{again:?}");
        assert_eq!(again.epic("E1").unwrap().counts.created, 1);
    }

    #[test]
    fn progress_is_kept_after_the_run() {
        let epics = vec![epic("E1", &[]), epic("E2", &[])];
        let (_, ctx) = setup(&epics, InMemoryTracker::default());
        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        let callback: ProgressCallback = Arc::new(move |epic: &str, status: EpicStatus, _: SyncPhase, _: f64| {
            if status == EpicStatus::Completed {
                sink.lock().unwrap().push(epic.to_string());
            }
        });
        let orchestrator = ParallelSyncOrchestrator::new(ctx, pool(2)).with_callback(callback);
        assert!(orchestrator.get_progress().is_empty());

        let result = orchestrator.sync(&epics, &SyncOptions::default());
        let progress = orchestrator.get_progress();
        assert_eq!(progress, result.progress);
        assert!(progress.iter().all(|p| p.status == EpicStatus::Completed));
        let mut seen = completed.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, ["E1", "E2"]);
    }
}
