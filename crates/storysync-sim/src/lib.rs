//! storysync-sim library.
//!
//! Seeded fault-injection campaigns against the storysync engine. A seed
//! fixes the generated epics, the drift applied between syncs and every
//! injected tracker fault, so a failing seed replays exactly.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod scenario;
pub mod tracker;

pub use campaign::{CampaignConfig, CampaignReport, SeedOutcome, replay_seed, run_campaign, run_single_seed};
pub use oracle::Violation;
pub use rng::DeterministicRng;
pub use scenario::{DriftPlan, Scenario, ScenarioConfig};
pub use tracker::{FaultConfig, FaultyTracker};
