#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use storysync_core::sync::MergeStrategy;
use storysync_sim::{CampaignConfig, FaultConfig, ScenarioConfig, replay_seed, run_campaign};

#[derive(Parser, Debug)]
#[command(name = "storysync-sim", version, about = "Seeded fault-injection campaigns for storysync")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a range of seeds and print a JSON report.
    Campaign {
        /// Number of seeds to run.
        #[arg(long, default_value_t = 100)]
        seeds: u64,
        /// First seed.
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[command(flatten)]
        params: Params,
    },
    /// Run one seed and print every round.
    Replay {
        #[arg(long)]
        seed: u64,
        #[command(flatten)]
        params: Params,
    },
}

#[derive(Args, Debug)]
struct Params {
    #[arg(long, default_value_t = 3)]
    epics: usize,
    /// Upper bound on stories per epic.
    #[arg(long, default_value_t = 4)]
    stories: usize,
    #[arg(long, default_value_t = 10)]
    transient_percent: u8,
    #[arg(long, default_value_t = 5)]
    rate_limit_percent: u8,
    #[arg(long, default_value_t = 5)]
    broken_percent: u8,
    /// More than one worker gives up exact replay.
    #[arg(long, default_value_t = 1)]
    workers: usize,
    #[arg(long, value_enum, default_value_t = StrategyArg::PreferNewest)]
    strategy: StrategyArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    PreferLocal,
    PreferRemote,
    PreferNewest,
    MergeText,
}

impl From<StrategyArg> for MergeStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::PreferLocal => Self::PreferLocal,
            StrategyArg::PreferRemote => Self::PreferRemote,
            StrategyArg::PreferNewest => Self::PreferNewest,
            StrategyArg::MergeText => Self::MergeText,
        }
    }
}

impl Params {
    fn to_config(&self, seed_range: std::ops::Range<u64>) -> CampaignConfig {
        CampaignConfig {
            seed_range,
            scenario: ScenarioConfig {
                epics: self.epics,
                max_stories: self.stories,
                ..ScenarioConfig::default()
            },
            faults: FaultConfig {
                transient_percent: self.transient_percent,
                rate_limit_percent: self.rate_limit_percent,
                broken_key_percent: self.broken_percent,
            },
            strategy: self.strategy.into(),
            workers: self.workers,
            ..CampaignConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Campaign { seeds, start, params } => {
            let end = start.saturating_add(seeds);
            let report = run_campaign(&params.to_config(start..end))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_passed() {
                bail!(
                    "{} of {} seeds failed; replay with --seed {}",
                    report.failures.len(),
                    report.seeds_run,
                    report.first_failure.unwrap_or(start)
                );
            }
        }
        Command::Replay { seed, params } => {
            let outcome = replay_seed(seed, &params.to_config(seed..seed.saturating_add(1)))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.passed() {
                bail!("seed {seed} violated {} invariants", outcome.violations.len());
            }
        }
    }
    Ok(())
}
