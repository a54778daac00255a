//! One epic's sync, end to end.
//!
//! ```text
//! INITIALIZED → FETCHING → DIFFING → CONFLICT_CHECK → MERGING → TRANSACTING → PERSISTING → COMPLETED
//!       └──────────────┴──────────┴───────────┴───────────┴───────────┴──────────→ FAILED
//! ```
//!
//! - **Fetching** reads the local epic and the remote children concurrently,
//!   then loads the epic's base snapshots. Local entities are paired with
//!   remote issues by remote key, then by base snapshot, then by title.
//! - **Diffing** captures local and remote snapshots and runs the
//!   entity-level idempotency check. Entities unchanged on both sides stop
//!   here.
//! - **Conflict check** classifies every field of every remaining entity.
//! - **Merging** resolves conflicts and turns the merged state into one
//!   transaction per entity plus local write-back changes. An entity left
//!   with unresolved conflicts is paused; its siblings continue.
//! - **Transacting** runs the transactions in dependency order. Cancellation
//!   and the epic deadline are honored between entities, never inside a
//!   transaction.
//! - **Persisting** writes the local changes back, then saves base snapshots
//!   for committed entities only. Failed or skipped entities keep their old
//!   base so the next run re-diffs them.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::conflict::{self, Conflict, ConflictReport};
use super::idempotency::{IdempotencyCheck, IdempotencyGuard, IdempotencyStatus};
use super::matcher::{NormalizedContainmentMatcher, TitleMatcher};
use super::merge::{DeletionDecision, MergeConfig, MergeContext, MergeResult, Resolutions, ThreeWayMerger};
use super::progress::{EpicStatus, NoProgress, ProgressSink, SyncPhase};
use super::result::{EntityDisposition, EntityOutcome, EpicError, EpicResult, SyncCounts};
use super::transaction::{
    CreatedKeys, FailedOperation, ForwardPayload, Operation, OperationKind, OperationTarget, Transaction,
    TransactionManager,
};
use crate::adapter::{AdapterError, DocumentStore, LocalChange, RemoteIssue, RetryPolicy, TrackerAdapter, with_retry};
use crate::error::{ErrorCode, SyncError};
use crate::fingerprint;
use crate::graph::DependencyGraph;
use crate::lock::{EntityLockGuard, EntityLockTable};
use crate::model::{BaseSnapshot, Entity, EntityFields, EntityId, EntityKind, EntitySnapshot, Epic, Field, FieldValue};
use crate::store::StateStore;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Context, options, control
// ---------------------------------------------------------------------------

/// Collaborators and settings shared by every epic of a run.
#[derive(Clone)]
pub struct SyncContext {
    pub tracker: Arc<dyn TrackerAdapter>,
    pub document: Arc<dyn DocumentStore>,
    pub store: Arc<dyn StateStore>,
    pub locks: Arc<EntityLockTable>,
    pub matcher: Arc<dyn TitleMatcher>,
    pub merge: MergeConfig,
    pub retry: RetryPolicy,
    /// How long to wait for an entity another epic is working on.
    pub lock_timeout: Duration,
}

impl SyncContext {
    #[must_use]
    pub fn new(
        tracker: Arc<dyn TrackerAdapter>,
        document: Arc<dyn DocumentStore>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            tracker,
            document,
            store,
            locks: Arc::new(EntityLockTable::new()),
            matcher: Arc::new(NormalizedContainmentMatcher::default()),
            merge: MergeConfig::default(),
            retry: RetryPolicy::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_merge_config(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: Arc<dyn TitleMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    #[must_use]
    pub fn with_locks(mut self, locks: Arc<EntityLockTable>) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("tracker", &self.tracker.name())
            .field("merge", &self.merge)
            .field("retry", &self.retry)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Reuse a previous run id to resume it; its replay log suppresses
    /// operations already applied. A fresh id is generated when `None`.
    pub run_id: Option<String>,
    /// Plan everything, apply and persist nothing.
    pub dry_run: bool,
    /// Operator choices for conflicts a strategy left open.
    pub resolutions: Resolutions,
}

impl SyncOptions {
    #[must_use]
    pub fn resume(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }
}

/// A fresh, sortable run id.
#[must_use]
pub fn new_run_id() -> String {
    format!(
        "run-{}-{:08x}",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        rand::random::<u32>()
    )
}

/// Cancellation flag shared by every epic of a run, plus an optional
/// per-epic deadline.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
    deadline: Option<(Instant, Duration)>,
}

impl RunControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Same cancellation flag, with a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some((Instant::now() + timeout, timeout)),
        }
    }

    /// # Errors
    ///
    /// [`SyncError::Cancelled`] or [`SyncError::EpicTimedOut`].
    pub fn check(&self, epic_key: &str) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        match self.deadline {
            Some((deadline, timeout)) if Instant::now() >= deadline => Err(SyncError::EpicTimedOut {
                epic: epic_key.to_string(),
                timeout,
            }),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives the sync of one epic at a time.
pub struct BidirectionalSync<'a> {
    ctx: &'a SyncContext,
    options: &'a SyncOptions,
    run_id: String,
    progress: &'a dyn ProgressSink,
    control: RunControl,
}

impl<'a> BidirectionalSync<'a> {
    #[must_use]
    pub fn new(ctx: &'a SyncContext, options: &'a SyncOptions) -> Self {
        let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
        Self {
            ctx,
            options,
            run_id,
            progress: &NoProgress,
            control: RunControl::default(),
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sync one epic. Never panics on collaborator failure: every error ends
    /// up in the returned [`EpicResult`].
    pub fn sync_epic(&self, epic_key: &str) -> EpicResult {
        let span = tracing::info_span!("sync_epic", epic = epic_key, run_id = %self.run_id);
        let _enter = span.enter();

        let mut run = EpicRun::new(self, epic_key);
        let stopped = run.execute();
        let result = run.finish(stopped);

        let phase = if result.is_success() {
            SyncPhase::Completed
        } else {
            SyncPhase::Failed
        };
        self.progress.report(epic_key, result.status, phase, 1.0);
        match &result.error {
            None => tracing::info!(
                created = result.counts.created,
                updated = result.counts.updated,
                skipped = result.counts.skipped,
                conflicted = result.counts.conflicted,
                failed = result.counts.failed,
                "epic synced"
            ),
            Some(err) => tracing::warn!(phase = %result.phase, %err, "epic sync failed"),
        }
        result
    }
}

impl fmt::Debug for BidirectionalSync<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidirectionalSync")
            .field("run_id", &self.run_id)
            .field("dry_run", &self.options.dry_run)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Per-entity plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseUpdate {
    Keep,
    Save,
    Forget,
}

#[derive(Debug, Default)]
struct Snapshots {
    base: Option<EntitySnapshot>,
    local: Option<EntitySnapshot>,
    remote: Option<EntitySnapshot>,
}

/// Everything known and decided about one entity during a run.
#[derive(Debug)]
struct Plan {
    id: EntityId,
    local: Option<Entity>,
    remote: Option<RemoteIssue>,
    base: Option<BaseSnapshot>,
    /// Remote key the entity is paired with.
    key: Option<String>,
    matched: bool,
    snapshots: Snapshots,
    idempotency: Option<IdempotencyCheck>,
    report: Option<ConflictReport>,
    conflicts: Vec<Conflict>,
    unresolved: Vec<Conflict>,
    review: Vec<Field>,
    tx: Transaction,
    replayed: usize,
    /// A skipped operation's effect is missing from the fetched issue.
    unconfirmed: bool,
    local_changes: Vec<LocalChange>,
    merged: Option<EntityFields>,
    base_update: BaseUpdate,
    /// Set once the transaction committed (or there was nothing to apply).
    committed: bool,
    applied: usize,
    note: Option<String>,
    /// Final outcome, set early for entities that stop before persisting.
    outcome: Option<EntityOutcome>,
}

impl Plan {
    fn new(id: EntityId, local: Option<Entity>, base: Option<BaseSnapshot>, run_id: &str) -> Self {
        let tx = Transaction::new(format!("{run_id}/{id}"));
        Self {
            id,
            local,
            remote: None,
            base,
            key: None,
            matched: false,
            snapshots: Snapshots::default(),
            idempotency: None,
            report: None,
            conflicts: Vec::new(),
            unresolved: Vec::new(),
            review: Vec::new(),
            tx,
            replayed: 0,
            unconfirmed: false,
            local_changes: Vec::new(),
            merged: None,
            base_update: BaseUpdate::Keep,
            committed: false,
            applied: 0,
            note: None,
            outcome: None,
        }
    }

    fn is_open(&self) -> bool {
        self.outcome.is_none()
    }

    fn conclude(&self, disposition: EntityDisposition, message: Option<String>) -> EntityOutcome {
        EntityOutcome {
            entity_id: self.id.clone(),
            remote_key: self.key.clone(),
            disposition,
            matched: self.matched,
            idempotency: self.idempotency.as_ref().map(|c| c.status),
            operations: self.applied,
            replayed: self.replayed,
            conflicts: self.conflicts.clone(),
            review_recommended: self.review.clone(),
            message,
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(entity = %self.id, %message, "entity failed");
        self.outcome = Some(self.conclude(EntityDisposition::Failed, Some(message)));
    }

    fn creates(&self) -> bool {
        self.tx
            .operations()
            .iter()
            .any(|op| matches!(op.kind, OperationKind::Create | OperationKind::CreateSubtask))
    }
}

struct Fetched {
    epic: Epic,
    children: Vec<RemoteIssue>,
    bases: Vec<BaseSnapshot>,
}

// ---------------------------------------------------------------------------
// Epic run
// ---------------------------------------------------------------------------

struct EpicRun<'a> {
    sync: &'a BidirectionalSync<'a>,
    epic_key: &'a str,
    started_at: DateTime<Utc>,
    phase: SyncPhase,
    plans: Vec<Plan>,
    remote_only: Vec<String>,
    created: CreatedKeys,
    failed_operations: Vec<FailedOperation>,
    planned: Vec<Operation>,
}

impl<'a> EpicRun<'a> {
    fn new(sync: &'a BidirectionalSync<'a>, epic_key: &'a str) -> Self {
        Self {
            sync,
            epic_key,
            started_at: Utc::now(),
            phase: SyncPhase::Initialized,
            plans: Vec::new(),
            remote_only: Vec::new(),
            created: CreatedKeys::new(),
            failed_operations: Vec::new(),
            planned: Vec::new(),
        }
    }

    fn enter(&mut self, phase: SyncPhase) -> Result<(), SyncError> {
        self.sync.control.check(self.epic_key)?;
        self.phase = phase;
        self.sync
            .progress
            .report(self.epic_key, EpicStatus::Running, phase, phase.fraction());
        tracing::debug!(%phase, "entering phase");
        Ok(())
    }

    fn execute(&mut self) -> Result<(), SyncError> {
        let ctx = self.sync.ctx;
        self.enter(SyncPhase::Initialized)?;
        let mut guard = IdempotencyGuard::load(ctx.store.as_ref(), &self.sync.run_id)?;

        self.enter(SyncPhase::Fetching)?;
        let fetched = self.fetch()?;
        self.pair(fetched)?;
        let _locks = self.lock_entities();

        self.enter(SyncPhase::Diffing)?;
        self.diff(&guard);

        self.enter(SyncPhase::ConflictCheck)?;
        for plan in self.plans.iter_mut().filter(|p| p.is_open()) {
            let snaps = &plan.snapshots;
            let report = conflict::detect(&plan.id, snaps.base.as_ref(), snaps.local.as_ref(), snaps.remote.as_ref());
            if !report.is_empty() {
                tracing::debug!(entity = %plan.id, conflicts = report.conflicts.len(), "conflicts detected");
            }
            plan.report = Some(report);
        }

        self.enter(SyncPhase::Merging)?;
        self.merge(&guard);

        self.enter(SyncPhase::Transacting)?;
        let stopped = self.transact(&mut guard);

        // Committed transactions are persisted even when the run was stopped.
        self.phase = SyncPhase::Persisting;
        self.sync.progress.report(
            self.epic_key,
            EpicStatus::Running,
            SyncPhase::Persisting,
            SyncPhase::Persisting.fraction(),
        );
        self.persist();

        stopped.map_or(Ok(()), Err)
    }

    // -- Fetching -----------------------------------------------------------

    fn fetch(&self) -> Result<Fetched, SyncError> {
        let ctx = self.sync.ctx;
        let epic_key = self.epic_key;
        let (local, remote) = thread::scope(|s| {
            let remote = s.spawn(|| {
                with_retry(&ctx.retry, "LIST_EPIC_CHILDREN", || ctx.tracker.list_epic_children(epic_key))
            });
            let local = ctx.document.load_epic(epic_key);
            let remote = remote
                .join()
                .unwrap_or_else(|_| Err(AdapterError::Rejected("remote fetch panicked".to_string())));
            (local, remote)
        });
        let children = remote?;
        let epic = local?;
        let bases = ctx.store.list_base_snapshots(epic_key)?;
        tracing::debug!(
            local = epic.stories.len(),
            remote = children.len(),
            bases = bases.len(),
            "fetched both sides"
        );
        Ok(Fetched { epic, children, bases })
    }

    /// Pair local entities, base snapshots and remote issues.
    fn pair(&mut self, fetched: Fetched) -> Result<(), SyncError> {
        let Fetched { epic, children, bases } = fetched;
        let run_id = self.sync.run_id.as_str();
        let order: Vec<String> = children.iter().map(|c| c.key.clone()).collect();
        let remote: HashMap<String, RemoteIssue> = children.into_iter().map(|c| (c.key.clone(), c)).collect();
        let mut bases: BTreeMap<EntityId, BaseSnapshot> = bases
            .into_iter()
            .map(|b| (b.entity_id().clone(), b))
            .collect();
        let mut claimed: HashSet<String> = HashSet::new();

        for entity in epic.stories {
            let base = bases.remove(&entity.id);
            let key = entity
                .remote_key
                .clone()
                .or_else(|| base.as_ref().and_then(BaseSnapshot::remote_key).map(str::to_string));
            let mut plan = Plan::new(entity.id.clone(), Some(entity), base, run_id);
            if let Some(key) = key {
                self.attach(&mut plan, key, &remote, &mut claimed)?;
            }
            self.plans.push(plan);
        }

        // Base snapshots without a local entity: deleted from the document.
        for (id, base) in bases {
            let key = base.remote_key().map(str::to_string);
            let mut plan = Plan::new(id, None, Some(base), run_id);
            if let Some(key) = key {
                self.attach(&mut plan, key, &remote, &mut claimed)?;
            }
            self.plans.push(plan);
        }

        self.match_titles(&order, &remote, &mut claimed);
        self.remote_only = order.into_iter().filter(|k| !claimed.contains(k)).collect();
        if !self.remote_only.is_empty() {
            tracing::info!(count = self.remote_only.len(), "remote issues without a local entity");
        }
        Ok(())
    }

    fn attach(
        &self,
        plan: &mut Plan,
        key: String,
        remote: &HashMap<String, RemoteIssue>,
        claimed: &mut HashSet<String>,
    ) -> Result<(), SyncError> {
        let ctx = self.sync.ctx;
        claimed.insert(key.clone());
        if let Some(issue) = remote.get(&key) {
            plan.remote = Some(issue.clone());
            plan.key = Some(key);
            return Ok(());
        }
        match with_retry(&ctx.retry, "GET_ISSUE", || ctx.tracker.get_issue(&key)) {
            Ok(issue) => {
                tracing::debug!(entity = %plan.id, %key, "issue is no longer a child of the epic");
                plan.remote = Some(issue);
                plan.key = Some(key);
            }
            Err(err) if err.is_not_found() => {
                if plan.base.is_some() {
                    tracing::debug!(entity = %plan.id, %key, "issue deleted remotely");
                    plan.key = Some(key);
                } else {
                    tracing::warn!(entity = %plan.id, %key, "remote key no longer exists, creating anew");
                }
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                plan.key = Some(key);
                plan.fail(format!("{}: {err}", err.code()));
            }
        }
        Ok(())
    }

    fn match_titles(&mut self, order: &[String], remote: &HashMap<String, RemoteIssue>, claimed: &mut HashSet<String>) {
        let matcher = self.sync.ctx.matcher.as_ref();
        let mut keys: HashMap<EntityId, String> = self
            .plans
            .iter()
            .filter_map(|p| p.key.clone().map(|k| (p.id.clone(), k)))
            .collect();

        for plan in &mut self.plans {
            if !plan.is_open() || plan.key.is_some() || plan.base.is_some() {
                continue;
            }
            let Some(entity) = &plan.local else {
                continue;
            };
            let parent_key = entity.parent.as_ref().and_then(|p| keys.get(p)).map(String::as_str);
            let candidates: Vec<&RemoteIssue> = order
                .iter()
                .filter(|k| !claimed.contains(*k))
                .filter_map(|k| remote.get(k))
                .filter(|issue| same_kind(entity.kind, issue.kind))
                .filter(|issue| entity.kind != EntityKind::Subtask || issue.parent_key.as_deref() == parent_key)
                .collect();
            let titles: Vec<&str> = candidates.iter().map(|i| i.fields.title.as_str()).collect();
            let Some(idx) = matcher.best_match(&entity.fields.title, &titles) else {
                continue;
            };
            let issue = candidates[idx].clone();
            tracing::info!(entity = %plan.id, key = %issue.key, "matched remote issue by title");
            claimed.insert(issue.key.clone());
            keys.insert(plan.id.clone(), issue.key.clone());
            plan.key = Some(issue.key.clone());
            plan.remote = Some(issue);
            plan.matched = true;
        }
    }

    fn lock_entities(&mut self) -> Vec<EntityLockGuard<'a>> {
        let ctx: &'a SyncContext = self.sync.ctx;
        let mut order: Vec<usize> = (0..self.plans.len()).collect();
        order.sort_by(|a, b| self.plans[*a].id.cmp(&self.plans[*b].id));
        let mut guards = Vec::with_capacity(order.len());
        for idx in order {
            let plan = &mut self.plans[idx];
            match ctx.locks.acquire(&plan.id, ctx.lock_timeout) {
                Ok(guard) => guards.push(guard),
                Err(err) => plan.fail(err.to_string()),
            }
        }
        guards
    }

    // -- Diffing ------------------------------------------------------------

    fn diff(&mut self, guard: &IdempotencyGuard) {
        for plan in self.plans.iter_mut().filter(|p| p.is_open()) {
            let local = plan
                .local
                .as_ref()
                .map(|e| EntitySnapshot::capture(e.id.clone(), plan.key.clone(), &e.fields, e.modified_at));
            let remote = plan
                .remote
                .as_ref()
                .map(|r| EntitySnapshot::capture(plan.id.clone(), Some(r.key.clone()), &r.fields, r.updated_at));
            let base = plan.base.as_ref().map(|b| b.snapshot.clone());

            if let Some(entity) = &plan.local {
                let check = guard.check(entity, plan.base.as_ref().map(BaseSnapshot::content_hash));
                let untouched = check.status == IdempotencyStatus::Unchanged
                    && remote
                        .as_ref()
                        .zip(base.as_ref())
                        .is_some_and(|(r, b)| r.content_hash == b.content_hash)
                    && entity.remote_key == plan.key;
                plan.idempotency = Some(check);
                if untouched {
                    tracing::trace!(entity = %plan.id, "unchanged on both sides");
                    plan.outcome = Some(plan.conclude(EntityDisposition::Skipped, Some("unchanged".to_string())));
                    continue;
                }
            }
            plan.snapshots = Snapshots { base, local, remote };
        }
    }

    // -- Merging ------------------------------------------------------------

    fn merge(&mut self, guard: &IdempotencyGuard) {
        // Keys of issues that still exist remotely; parents created in this
        // run are resolved at apply time instead.
        let keys: HashMap<EntityId, String> = self
            .plans
            .iter()
            .filter(|p| p.remote.is_some())
            .filter_map(|p| p.key.clone().map(|k| (p.id.clone(), k)))
            .collect();
        let ids: HashMap<String, EntityId> = keys.iter().map(|(id, key)| (key.clone(), id.clone())).collect();
        let planner = Planner {
            ctx: self.sync.ctx,
            options: self.sync.options,
            guard,
            epic_key: self.epic_key,
            keys: &keys,
            ids: &ids,
        };
        for plan in self.plans.iter_mut().filter(|p| p.is_open()) {
            if let Err(err) = planner.plan(plan) {
                plan.fail(format!("{}: {err}", err.code()));
            }
        }
    }

    // -- Transacting --------------------------------------------------------

    /// Entity indices in dependency order; document order if the entities'
    /// links form a cycle.
    fn order(&self) -> Vec<usize> {
        let index: HashMap<&str, usize> = self
            .plans
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.as_str(), i))
            .collect();
        let deps: Vec<_> = self
            .plans
            .iter()
            .filter_map(|p| p.local.as_ref())
            .flat_map(Entity::dependencies)
            .filter(|d| index.contains_key(d.source.as_str()) && index.contains_key(d.target.as_str()))
            .collect();
        let graph = DependencyGraph::build(self.plans.iter().map(|p| p.id.as_str()), deps);

        let mut order = Vec::with_capacity(self.plans.len());
        let mut seen = vec![false; self.plans.len()];
        match graph.topological_sort() {
            Ok(sorted) => {
                for id in &sorted {
                    if let Some(&i) = index.get(id.as_str()) {
                        if !seen[i] {
                            seen[i] = true;
                            order.push(i);
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "entity dependencies form a cycle, using document order"),
        }
        order.extend((0..self.plans.len()).filter(|i| !seen[*i]));
        order
    }

    /// Run every open entity's transaction. Returns the reason the run
    /// stopped early, if it did.
    fn transact(&mut self, guard: &mut IdempotencyGuard) -> Option<SyncError> {
        let ctx = self.sync.ctx;
        let dry_run = self.sync.options.dry_run;
        let order = self.order();
        let total = order.len().max(1);
        let manager = TransactionManager::new(ctx.tracker.as_ref(), &ctx.retry);
        let mut stopped: Option<SyncError> = None;

        for (n, idx) in order.into_iter().enumerate() {
            if stopped.is_some() {
                break;
            }
            let plan = &mut self.plans[idx];
            if !plan.is_open() {
                continue;
            }
            if let Err(err) = self.sync.control.check(self.epic_key) {
                tracing::info!(%err, "stopping before the next transaction");
                stopped = Some(err);
                break;
            }

            if dry_run {
                self.planned.extend(plan.tx.operations().iter().cloned());
                plan.applied = plan.tx.len();
                plan.committed = true;
            } else if plan.tx.is_empty() {
                plan.committed = true;
            } else {
                let store = ctx.store.as_ref();
                let outcome = manager.execute(&mut plan.tx, &mut self.created, &mut |op| {
                    if let Err(err) = guard.record(store, &op.hash) {
                        tracing::warn!(op = %op.kind, %err, "failed to append to replay log");
                    }
                });
                // Undone operations must apply again if this run is resumed.
                for op in plan.tx.operations().iter().filter(|op| !op.applied && op.inverse.is_some()) {
                    if let Err(err) = guard.revoke(store, &op.hash) {
                        tracing::warn!(op = %op.kind, %err, "failed to revoke replay log entry");
                    }
                }
                if outcome.is_committed() {
                    plan.committed = true;
                    plan.applied = outcome.applied;
                } else {
                    plan.applied = outcome.applied;
                    let message = outcome
                        .failed
                        .as_ref()
                        .map_or_else(|| "transaction failed".to_string(), |f| format!("{}: {}", f.code, f.error));
                    if let Some(failed) = outcome.failed.clone() {
                        self.failed_operations.push(failed);
                    }
                    plan.fail(message);
                    if let Some(err) = outcome.error.filter(AdapterError::is_fatal) {
                        tracing::error!(%err, "fatal tracker error, aborting epic");
                        stopped = Some(err.into());
                    }
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let fraction = SyncPhase::Transacting.fraction() + 0.2 * (n + 1) as f64 / total as f64;
            self.sync
                .progress
                .report(self.epic_key, EpicStatus::Running, SyncPhase::Transacting, fraction);
        }
        stopped
    }

    // -- Persisting ---------------------------------------------------------

    fn persist(&mut self) {
        if self.sync.options.dry_run {
            return;
        }
        let ctx = self.sync.ctx;

        for plan in self.plans.iter_mut().filter(|p| p.is_open() && p.committed) {
            let Some(key) = self.created.get(&plan.id) else {
                continue;
            };
            plan.key = Some(key.clone());
            if plan.local.as_ref().is_some_and(|e| e.remote_key.as_ref() != Some(key)) {
                plan.local_changes.push(LocalChange::AssignRemoteKey {
                    entity_id: plan.id.clone(),
                    remote_key: key.clone(),
                });
            }
        }

        let changes: Vec<LocalChange> = self
            .plans
            .iter()
            .filter(|p| p.is_open() && p.committed)
            .flat_map(|p| p.local_changes.iter().cloned())
            .collect();
        if !changes.is_empty() {
            if let Err(err) = ctx.document.apply_local_changes(self.epic_key, &changes) {
                tracing::error!(%err, changes = changes.len(), "local write-back failed");
                for plan in self
                    .plans
                    .iter_mut()
                    .filter(|p| p.is_open() && p.committed && !p.local_changes.is_empty())
                {
                    plan.fail(format!("{}: local write-back failed: {err}", err.code()));
                }
            }
        }

        let synced_at = Utc::now();
        for plan in self.plans.iter_mut().filter(|p| p.is_open() && p.committed) {
            if plan.unconfirmed && plan.base_update == BaseUpdate::Save {
                plan.note = Some("replayed operations not visible on the tracker; base kept".to_string());
                continue;
            }
            let result = match plan.base_update {
                BaseUpdate::Keep => Ok(()),
                BaseUpdate::Forget => ctx.store.delete_base_snapshot(&plan.id),
                BaseUpdate::Save => {
                    let fields = plan.merged.clone().unwrap_or_default();
                    let modified_at = latest(
                        plan.local.as_ref().and_then(|e| e.modified_at),
                        plan.remote.as_ref().and_then(|r| r.updated_at),
                    );
                    let base = BaseSnapshot {
                        epic_key: self.epic_key.to_string(),
                        snapshot: EntitySnapshot::capture(plan.id.clone(), plan.key.clone(), &fields, modified_at),
                        synced_at,
                        run_id: self.sync.run_id.clone(),
                    };
                    ctx.store.save_base_snapshot(&base)
                }
            };
            if let Err(err) = result {
                plan.fail(format!("{}: {err}", err.code()));
            }
        }
    }

    // -- Result -------------------------------------------------------------

    fn finish(self, stopped: Result<(), SyncError>) -> EpicResult {
        let stop_message = stopped.as_ref().err().map(ToString::to_string);
        let dry_run = self.sync.options.dry_run;
        let mut counts = SyncCounts::default();
        let mut entities = Vec::with_capacity(self.plans.len());
        let mut unresolved = Vec::new();

        for plan in self.plans {
            let outcome = plan.outcome.clone().unwrap_or_else(|| {
                if !plan.committed {
                    let message = stop_message.clone().unwrap_or_else(|| "not synced".to_string());
                    return plan.conclude(EntityDisposition::Skipped, Some(message));
                }
                let disposition = if plan.creates() && plan.applied > 0 {
                    EntityDisposition::Created
                } else if plan.applied > 0 || !plan.local_changes.is_empty() {
                    EntityDisposition::Updated
                } else {
                    EntityDisposition::Skipped
                };
                let note = if dry_run {
                    Some("dry run".to_string())
                } else {
                    plan.note.clone()
                };
                plan.conclude(disposition, note)
            });
            counts.record(outcome.disposition);
            if plan.matched {
                counts.matched += 1;
            }
            unresolved.extend(plan.unresolved);
            entities.push(outcome);
        }

        let error = stopped
            .err()
            .map(|err| EpicError::new(err.code(), err.to_string()).fatal(err.is_fatal()));
        let status = if error.is_none() && counts.failed == 0 {
            EpicStatus::Completed
        } else {
            EpicStatus::Failed
        };
        EpicResult {
            epic_key: self.epic_key.to_string(),
            status,
            phase: self.phase,
            started_at: self.started_at,
            finished_at: Utc::now(),
            counts,
            entities,
            remote_only: self.remote_only,
            unresolved,
            failed_operations: self.failed_operations,
            planned: self.planned,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Turns one entity's conflict report into a transaction and local changes.
struct Planner<'p> {
    ctx: &'p SyncContext,
    options: &'p SyncOptions,
    guard: &'p IdempotencyGuard,
    epic_key: &'p str,
    /// Local id → remote key, for issues that exist remotely.
    keys: &'p HashMap<EntityId, String>,
    ids: &'p HashMap<String, EntityId>,
}

impl Planner<'_> {
    fn plan(&self, plan: &mut Plan) -> Result<(), SyncError> {
        let Some(mut report) = plan.report.take() else {
            return Ok(());
        };
        match (plan.local.is_some(), plan.remote.is_some(), plan.base.is_some()) {
            (true, false, false) => self.plan_create(plan),
            (true, true, _) => self.plan_update(plan, &mut report),
            (true, false, true) | (false, true, true) => self.plan_deletion(plan, &mut report),
            (false, false, _) => {
                plan.note = Some("deleted on both sides".to_string());
                plan.base_update = BaseUpdate::Forget;
                Ok(())
            }
            (false, true, false) => Ok(()),
        }
    }

    fn merger(&self) -> ThreeWayMerger<'_> {
        ThreeWayMerger::new(&self.ctx.merge).with_resolutions(&self.options.resolutions)
    }

    fn run_merge(&self, plan: &mut Plan, report: &mut ConflictReport) -> MergeResult {
        let snaps = &plan.snapshots;
        let ctx = MergeContext {
            base_synced_at: plan.base.as_ref().map(|b| b.synced_at),
        };
        let result = self.merger().merge(
            report,
            snaps.base.as_ref(),
            snaps.local.as_ref(),
            snaps.remote.as_ref(),
            ctx,
        );
        plan.conflicts.clone_from(&report.conflicts);
        result
    }

    fn pause(plan: &mut Plan, result: MergeResult) {
        tracing::info!(entity = %plan.id, unresolved = result.unresolved.len(), "conflict left for an operator");
        let message = result
            .unresolved
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        plan.unresolved = result.unresolved;
        plan.outcome = Some(plan.conclude(
            EntityDisposition::Conflicted,
            Some(format!("{}: {message}", ErrorCode::ConflictUnresolved)),
        ));
    }

    fn push(&self, plan: &mut Plan, op: Operation) -> Result<(), SyncError> {
        if self.guard.check_operation(&op.hash) == IdempotencyStatus::AlreadyApplied {
            // Operations other than comments are only planned when the tracker
            // lacks their effect.
            if op.kind == OperationKind::Comment {
                tracing::debug!(entity = %plan.id, op = %op.kind, "already applied in this run, skipping");
            } else {
                tracing::warn!(entity = %plan.id, op = %op.kind, "logged operation not visible on the tracker, keeping base");
                plan.unconfirmed = true;
            }
            plan.replayed += 1;
            return Ok(());
        }
        plan.tx.push(op)?;
        Ok(())
    }

    fn plan_create(&self, plan: &mut Plan) -> Result<(), SyncError> {
        let Some(entity) = plan.local.clone() else {
            return Ok(());
        };
        let initial_status = EntityFields::default().status;
        let mut fields = entity.fields.clone();
        let wanted_status = std::mem::replace(&mut fields.status, initial_status.clone());

        let (target, forward) = if entity.kind == EntityKind::Subtask {
            let parent = entity
                .parent
                .clone()
                .ok_or_else(|| AdapterError::Document(format!("subtask '{}' has no parent", entity.id)))?;
            let target = self
                .keys
                .get(&parent)
                .map_or_else(|| OperationTarget::Pending(parent), |key| OperationTarget::Key(key.clone()));
            (target, ForwardPayload::CreateSubtask { fields })
        } else {
            (OperationTarget::Key(self.epic_key.to_string()), ForwardPayload::Create { fields })
        };
        self.push(plan, Operation::new(entity.id.clone(), target, forward)?)?;

        let initial = fingerprint::hash_value(Field::Status, &FieldValue::text(initial_status));
        let wanted = fingerprint::hash_value(Field::Status, &FieldValue::text(wanted_status.clone()));
        if initial != wanted && !wanted_status.trim().is_empty() {
            self.push(
                plan,
                Operation::new(
                    entity.id.clone(),
                    OperationTarget::Pending(entity.id.clone()),
                    ForwardPayload::Transition { status: wanted_status },
                )?,
            )?;
        }

        plan.key = None;
        plan.merged = Some(entity.fields);
        plan.base_update = BaseUpdate::Save;
        Ok(())
    }

    fn plan_update(&self, plan: &mut Plan, report: &mut ConflictReport) -> Result<(), SyncError> {
        let result = self.run_merge(plan, report);
        if !result.is_resolved() {
            Self::pause(plan, result);
            return Ok(());
        }
        let (Some(entity), Some(key)) = (plan.local.clone(), plan.key.clone()) else {
            return Ok(());
        };
        let merged = merged_fields(&entity.fields, &result.fields)?;

        // Remote: fields whose merged value differs from the remote one.
        let mut changes = BTreeMap::new();
        let mut status = None;
        if let Some(remote) = &plan.snapshots.remote {
            for (field, value) in &result.fields {
                if Some(fingerprint::hash_value(*field, value).as_str()) == remote.field_hash(*field) {
                    continue;
                }
                if *field == Field::Status {
                    // A tracker issue always has a status; an empty one is left alone.
                    status = value.as_text().filter(|s| !s.trim().is_empty()).map(str::to_string);
                } else {
                    changes.insert(*field, value.clone());
                }
            }
        }
        if !changes.is_empty() {
            self.push(
                plan,
                Operation::new(entity.id.clone(), OperationTarget::Key(key.clone()), ForwardPayload::Update { changes })?,
            )?;
        }
        if let Some(status) = status {
            self.push(
                plan,
                Operation::new(entity.id.clone(), OperationTarget::Key(key.clone()), ForwardPayload::Transition { status })?,
            )?;
        }

        if !result.review_recommended.is_empty() {
            plan.review.clone_from(&result.review_recommended);
            if self.ctx.merge.comment_on_review {
                let fields = result
                    .review_recommended
                    .iter()
                    .map(|f| f.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let body = format!("storysync: edits on both sides could not be combined; manual review recommended for {fields}.");
                self.push(
                    plan,
                    Operation::new(entity.id.clone(), OperationTarget::Key(key.clone()), ForwardPayload::Comment { body })?,
                )?;
            }
        }

        // Local: write back when any merged value differs from the document.
        let local_differs = plan.snapshots.local.as_ref().is_some_and(|local| {
            result
                .fields
                .iter()
                .any(|(field, value)| Some(fingerprint::hash_value(*field, value).as_str()) != local.field_hash(*field))
        });
        if local_differs {
            plan.local_changes.push(LocalChange::Update {
                entity_id: entity.id.clone(),
                fields: merged.clone(),
                modified_at: entity.modified_at,
            });
        }
        if entity.remote_key.as_deref() != Some(key.as_str()) {
            plan.local_changes.push(LocalChange::AssignRemoteKey {
                entity_id: entity.id.clone(),
                remote_key: key,
            });
        }

        plan.merged = Some(merged);
        plan.base_update = BaseUpdate::Save;
        Ok(())
    }

    fn plan_deletion(&self, plan: &mut Plan, report: &mut ConflictReport) -> Result<(), SyncError> {
        let result = self.run_merge(plan, report);
        let Some(decision) = result.deletion else {
            Self::pause(plan, result);
            return Ok(());
        };
        tracing::info!(entity = %plan.id, ?decision, "resolving deletion");
        match decision {
            DeletionDecision::Recreate => {
                self.plan_create(plan)?;
                plan.note = Some("re-created after remote deletion".to_string());
            }
            DeletionDecision::RemoveLocal => {
                plan.local_changes.push(LocalChange::Remove {
                    entity_id: plan.id.clone(),
                });
                plan.base_update = BaseUpdate::Forget;
                plan.note = Some("removed locally after remote deletion".to_string());
            }
            DeletionDecision::RestoreLocal => {
                let Some(remote) = plan.remote.clone() else {
                    return Ok(());
                };
                let parent = remote.parent_key.as_ref().and_then(|k| self.ids.get(k)).cloned();
                let entity = Entity {
                    id: plan.id.clone(),
                    kind: remote.kind,
                    remote_key: Some(remote.key.clone()),
                    parent,
                    fields: remote.fields.clone(),
                    modified_at: remote.updated_at,
                };
                plan.local_changes.push(LocalChange::Restore { entity });
                plan.merged = Some(remote.fields);
                plan.base_update = BaseUpdate::Save;
                plan.note = Some("restored locally after local deletion".to_string());
            }
            DeletionDecision::Forget => {
                if let Some(key) = plan.key.clone() {
                    let body = "storysync: removed from the local document; this issue is no longer synced.".to_string();
                    self.push(
                        plan,
                        Operation::new(plan.id.clone(), OperationTarget::Key(key), ForwardPayload::Comment { body })?,
                    )?;
                }
                plan.base_update = BaseUpdate::Forget;
                plan.note = Some("no longer tracked after local deletion".to_string());
            }
        }
        Ok(())
    }
}

/// Apply merged values onto a copy of `fields`.
fn merged_fields(fields: &EntityFields, merged: &BTreeMap<Field, FieldValue>) -> Result<EntityFields, SyncError> {
    let mut out = fields.clone();
    for (field, value) in merged {
        out.set(*field, value.clone())
            .map_err(|err| AdapterError::Rejected(err.to_string()))?;
    }
    Ok(out)
}

const fn same_kind(local: EntityKind, remote: EntityKind) -> bool {
    matches!(
        (local, remote),
        (EntityKind::Subtask, EntityKind::Subtask) | (EntityKind::Story | EntityKind::Epic, EntityKind::Story)
    )
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
