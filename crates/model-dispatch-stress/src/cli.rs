//! `dispatch-stress` command surface.
//!
//! Every command prints one pretty JSON report to stdout; [`run_cli`] returns
//! whether the report is `ok` so the binary can pick its exit status.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use model_dispatch_domain::Strategy;
use serde::Serialize;

use crate::scenarios::{golden, probe, ProbeCase};
use crate::{default_adapters, load_adapters, run_stress, StressConfig};

#[derive(Debug, Parser)]
#[command(name = "dispatch-stress")]
#[command(about = "Deterministic dispatch pipeline stress and adversarial harness")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Repeat plan, envelope and execution across a worker pool.
    Stress(StressArgs),
    /// Execute the fixed single-node plan and require one trace digest.
    Golden(GoldenArgs),
    /// Feed a malformed input and require a typed rejection.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct StressArgs {
    #[arg(long, default_value_t = 1000)]
    runs: usize,
    #[arg(long, default_value_t = 8)]
    workers: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value = "stress test")]
    prompt: String,
    #[arg(long, value_enum, default_value_t = StrategyArg::Single)]
    strategy: StrategyArg,
    #[arg(long)]
    fanout: Option<u32>,
    #[arg(long)]
    quorum: Option<u32>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// YAML or JSON adapter registry; defaults to adapters a0..a4.
    #[arg(long)]
    adapters: Option<PathBuf>,
    /// Cap the workload at 50 runs on 4 workers.
    #[arg(long, default_value_t = false)]
    smoke: bool,
    #[arg(long, default_value_t = false)]
    tolerate_failures: bool,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct GoldenArgs {
    #[arg(long, default_value_t = 10)]
    repeat: usize,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    #[arg(long, value_enum, default_value_t = ProbeCase::MissingSteps)]
    case: ProbeCase,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    /// Let the planner's rule table choose.
    Auto,
    Single,
    Fanout,
    Verify,
    Quorum,
}

impl StrategyArg {
    fn into_strategy(self) -> Option<Strategy> {
        match self {
            Self::Auto => None,
            Self::Single => Some(Strategy::Single),
            Self::Fanout => Some(Strategy::Fanout),
            Self::Verify => Some(Strategy::Verify),
            Self::Quorum => Some(Strategy::Quorum),
        }
    }
}

/// Execute a parsed command, returning whether its report is `ok`.
///
/// # Errors
/// Returns an error when the adapter registry cannot be loaded, the worker
/// pool cannot start, the golden pipeline fails, or the report cannot be
/// written.
pub fn run_cli(cli: Cli) -> Result<bool> {
    match cli.command {
        Command::Stress(args) => run_stress_command(args),
        Command::Golden(args) => {
            let report = golden(args.repeat).context("golden scenario failed")?;
            emit(&report, args.output.as_deref())?;
            Ok(report.ok)
        }
        Command::Probe(args) => {
            let report = probe(args.case);
            emit(&report, args.output.as_deref())?;
            Ok(report.ok)
        }
    }
}

fn run_stress_command(args: StressArgs) -> Result<bool> {
    let adapters = match &args.adapters {
        Some(path) => load_adapters(path)?,
        None => default_adapters(),
    };

    let mut config = StressConfig {
        runs: args.runs,
        workers: args.workers,
        seed: args.seed,
        prompt: args.prompt,
        strategy: args.strategy.into_strategy(),
        fanout: args.fanout,
        quorum: args.quorum,
        timeout_ms: args.timeout_ms,
        tolerate_failures: args.tolerate_failures,
    };
    if args.smoke {
        config = config.smoke();
    }

    let summary = run_stress(&config, &adapters)?;
    emit(&summary, args.output.as_deref())?;
    Ok(summary.ok)
}

fn emit<T: Serialize>(report: &T, output: Option<&Path>) -> Result<()> {
    let serialized = serde_json::to_string_pretty(report)?;
    if let Some(path) = output {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating directory {}", parent.display()))?;
        }
        std::fs::write(path, &serialized)
            .with_context(|| format!("failed writing report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "report written");
    }
    println!("{serialized}");
    Ok(())
}
