//! Campaign runner.
//!
//! Each seed builds a scenario, syncs it under injected faults, applies
//! drift on both sides, syncs again, then heals (faults off) and verifies.
//! The oracles in [`crate::oracle`] judge every round.

use std::ops::Range;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use storysync_core::adapter::{InMemoryDocument, InMemoryTracker, RetryPolicy};
use storysync_core::model::Epic;
use storysync_core::store::MemoryStateStore;
use storysync_core::sync::{MergeConfig, MergeStrategy, SyncCounts};
use storysync_core::{ParallelSyncConfig, ParallelSyncOrchestrator, SyncContext, SyncOptions, SyncResult};

use crate::oracle::{self, Violation};
use crate::rng::DeterministicRng;
use crate::scenario::{DriftPlan, Scenario, ScenarioConfig};
use crate::tracker::{FaultConfig, FaultStats, FaultyTracker};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Seeds to execute, e.g. `0..100`.
    pub seed_range: Range<u64>,
    pub scenario: ScenarioConfig,
    pub faults: FaultConfig,
    /// Strategy for true conflicts. `manual` is rejected: paused conflicts
    /// never converge.
    pub strategy: MergeStrategy,
    /// Parallel workers. Only a single worker replays deterministically,
    /// since workers race for the shared fault RNG.
    pub workers: usize,
    /// Attempts per tracker call, including the first.
    pub retry_attempts: u32,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..50,
            scenario: ScenarioConfig::default(),
            faults: FaultConfig::default(),
            strategy: MergeStrategy::PreferNewest,
            workers: 1,
            retry_attempts: 6,
        }
    }
}

impl CampaignConfig {
    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.scenario.epics == 0 {
            bail!("scenario.epics must be > 0");
        }
        if self.scenario.max_stories == 0 {
            bail!("scenario.max_stories must be > 0");
        }
        if self.workers == 0 {
            bail!("workers must be > 0");
        }
        if self.retry_attempts == 0 {
            bail!("retry_attempts must be > 0");
        }
        if self.strategy == MergeStrategy::Manual {
            bail!("manual strategy leaves conflicts open and cannot converge");
        }
        Ok(())
    }

    fn parallel(&self) -> ParallelSyncConfig {
        if self.workers == 1 {
            return ParallelSyncConfig::sequential();
        }
        ParallelSyncConfig {
            max_workers: self.workers,
            ..ParallelSyncConfig::default()
        }
    }
}

/// Counters for one sync round of a seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub name: String,
    pub counts: SyncCounts,
    pub epics_failed: usize,
    pub operations: usize,
}

impl RoundSummary {
    fn of(name: &str, result: &SyncResult) -> Self {
        Self {
            name: name.to_string(),
            counts: result.counts,
            epics_failed: result.epic_results.iter().filter(|e| !e.is_success()).count(),
            operations: result.operations_applied(),
        }
    }
}

/// Everything one seed did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedOutcome {
    pub seed: u64,
    pub entities: usize,
    pub drift_edits: usize,
    pub rounds: Vec<RoundSummary>,
    pub faults: FaultStats,
    pub broken_keys: Vec<String>,
    pub violations: Vec<Violation>,
}

impl SeedOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First failing seed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    pub faults_injected: u64,
    pub entities_synced: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every seed in the config.
///
/// # Errors
///
/// Returns an error if the config is invalid.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        faults_injected: 0,
        entities_synced: 0,
    };

    for seed in config.seed_range.clone() {
        let outcome = run_seed(seed, config);
        report.seeds_run += 1;
        report.faults_injected += outcome.faults.injected();
        report.entities_synced += outcome.entities;
        if outcome.passed() {
            report.seeds_passed += 1;
            continue;
        }
        tracing::warn!(seed, violations = outcome.violations.len(), "seed failed");
        if report.first_failure.is_none() {
            report.first_failure = Some(seed);
        }
        report.failures.push(SeedFailure {
            seed,
            violations: outcome.violations.iter().map(format_violation).collect(),
        });
    }

    tracing::info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        faults = report.faults_injected,
        "campaign finished"
    );
    Ok(report)
}

/// Run one seed. `Ok(())` on pass, the violations otherwise.
///
/// # Errors
///
/// Returns an error if the config is invalid.
pub fn run_single_seed(seed: u64, config: &CampaignConfig) -> Result<Result<(), Vec<Violation>>> {
    config.validate()?;
    let outcome = run_seed(seed, config);
    if outcome.passed() {
        Ok(Ok(()))
    } else {
        Ok(Err(outcome.violations))
    }
}

/// Replay one seed and return every round's detail.
///
/// # Errors
///
/// Returns an error if the config is invalid.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SeedOutcome> {
    config.validate()?;
    Ok(run_seed(seed, config))
}

#[must_use]
pub fn format_violation(violation: &Violation) -> String {
    violation.to_string()
}

struct Harness<'a> {
    epics: &'a [Epic],
    tracker: Arc<InMemoryTracker>,
    document: Arc<InMemoryDocument>,
    orchestrator: ParallelSyncOrchestrator,
    rounds: Vec<RoundSummary>,
    violations: Vec<Violation>,
}

impl Harness<'_> {
    fn round(&mut self, name: &str) -> SyncResult {
        let before = oracle::capture(&self.document, self.epics);
        let result = self.orchestrator.sync(self.epics, &SyncOptions::default());
        tracing::debug!(round = name, counts = ?result.counts, "round finished");
        self.violations.extend(oracle::check_accounting(name, &before, &result));
        self.rounds.push(RoundSummary::of(name, &result));
        result
    }
}

fn run_seed(seed: u64, config: &CampaignConfig) -> SeedOutcome {
    let _span = tracing::debug_span!("seed", seed).entered();
    let scenario = Scenario::generate(seed, &config.scenario);
    let drift = DriftPlan::generate(&scenario, &config.scenario);
    let (tracker, document) = scenario.materialize();
    let tracker = Arc::new(tracker);
    let document = Arc::new(document);

    let faulty = Arc::new(FaultyTracker::new(
        tracker.clone(),
        config.faults.clone(),
        DeterministicRng::derive(seed, 3),
    ));
    let ctx = SyncContext::new(faulty.clone(), document.clone(), Arc::new(MemoryStateStore::new()))
        .with_merge_config(MergeConfig::with_strategy(config.strategy))
        .with_retry(RetryPolicy::immediate(config.retry_attempts));

    let mut harness = Harness {
        epics: &scenario.epics,
        tracker: tracker.clone(),
        document: document.clone(),
        orchestrator: ParallelSyncOrchestrator::new(ctx, config.parallel()),
        rounds: Vec::new(),
        violations: Vec::new(),
    };

    harness.round("initial");

    for key in drift.apply(&tracker, &document, Utc::now()) {
        faulty.maybe_break(&key);
    }
    harness.round("drift");

    faulty.set_enabled(false);
    let healed = harness.round("heal");
    let convergence = oracle::check_convergence(&harness.document, &harness.tracker, &scenario.epics, &healed);
    harness.violations.extend(convergence);

    harness.tracker.reset_calls();
    harness.round("verify");
    let idempotence = oracle::check_idempotence(&harness.tracker);
    harness.violations.extend(idempotence);

    SeedOutcome {
        seed,
        entities: scenario.entity_count(),
        drift_edits: drift.edits.len(),
        rounds: harness.rounds,
        faults: faulty.stats(),
        broken_keys: faulty.broken_keys().into_iter().collect(),
        violations: harness.violations,
    }
}
