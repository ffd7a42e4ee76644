//! Stress and adversarial harness for the plan → envelope → execute pipeline.
//!
//! Embedders drive the harness through:
//! - [`run_stress`] for repeated concurrent pipeline runs summarised as a
//!   [`StressSummary`].
//! - [`scenarios::golden`] and [`scenarios::probe`] for the fixed
//!   determinism and rejection scenarios.
//! - [`cli::run_cli`] for the parsed `dispatch-stress` command surface.

#![forbid(unsafe_code)]

pub mod cli;
pub mod memory;
pub mod scenarios;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use model_dispatch_domain::{AdapterDescriptor, DispatchError, ExecutionTrace, Strategy};
use model_dispatch_executor::Executor;
use model_dispatch_orchestrator::build_envelope;
use model_dispatch_planner::{PlanRequest, Planner};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// At most this many distinct trace digests are echoed in a summary.
pub const MAX_REPORTED_HASHES: usize = 10;

const SMOKE_MAX_RUNS: usize = 50;
const SMOKE_MAX_WORKERS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid stress configuration: {0}")]
    Config(String),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to load adapter registry {path}: {reason}")]
    Registry { path: PathBuf, reason: String },
    #[error("stress invariants violated: {}", reasons.join("; "))]
    Violation { reasons: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StressConfig {
    pub runs: usize,
    pub workers: usize,
    pub seed: u64,
    pub prompt: String,
    /// `None` lets the planner's rule table choose.
    pub strategy: Option<Strategy>,
    pub fanout: Option<u32>,
    pub quorum: Option<u32>,
    pub timeout_ms: Option<u64>,
    /// Count failed runs without letting them fail the summary.
    pub tolerate_failures: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            runs: 1000,
            workers: 8,
            seed: 0,
            prompt: "stress test".to_string(),
            strategy: Some(Strategy::Single),
            fanout: None,
            quorum: None,
            timeout_ms: None,
            tolerate_failures: false,
        }
    }
}

impl StressConfig {
    /// Cap the workload to a quick smoke run.
    #[must_use]
    pub fn smoke(mut self) -> Self {
        self.runs = self.runs.min(SMOKE_MAX_RUNS);
        self.workers = self.workers.min(SMOKE_MAX_WORKERS);
        self
    }

    #[must_use]
    pub fn plan_request(&self) -> PlanRequest {
        PlanRequest {
            strategy: self.strategy,
            fanout: self.fanout,
            quorum: self.quorum,
            seed: Some(self.seed),
            timeout_ms: self.timeout_ms,
        }
    }

    fn validate(&self) -> Result<(), HarnessError> {
        if self.runs == 0 {
            return Err(HarnessError::Config("runs must be >= 1".to_string()));
        }
        if self.workers == 0 {
            return Err(HarnessError::Config("workers must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StressSummary {
    pub runs: usize,
    pub workers: usize,
    pub seed: u64,
    pub ok: bool,
    pub reasons: Vec<String>,
    pub unique_trace_hashes: Vec<String>,
    pub failure_count: usize,
    pub wall_time_sec: f64,
    pub start_rss: u64,
    pub peak_rss: u64,
}

impl StressSummary {
    /// Turn a failed summary into an error.
    ///
    /// # Errors
    /// Returns [`HarnessError::Violation`] carrying the summary's reasons when
    /// `ok` is false.
    pub fn ensure_ok(self) -> Result<Self, HarnessError> {
        if self.ok {
            Ok(self)
        } else {
            Err(HarnessError::Violation {
                reasons: self.reasons,
            })
        }
    }
}

/// Five capability-free adapters `a0`..`a4`.
#[must_use]
pub fn default_adapters() -> Vec<AdapterDescriptor> {
    (0..5)
        .map(|index| AdapterDescriptor::new(format!("a{index}")))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AdapterRegistryFile {
    List(Vec<AdapterDescriptor>),
    Wrapped { adapters: Vec<AdapterDescriptor> },
}

/// Load adapter descriptors from a YAML or JSON registry file holding either a
/// list of descriptors or an object with an `adapters` list.
///
/// # Errors
/// Returns [`HarnessError::Registry`] when the file cannot be read or parsed.
pub fn load_adapters(path: &Path) -> Result<Vec<AdapterDescriptor>, HarnessError> {
    let registry_error = |reason: String| HarnessError::Registry {
        path: path.to_path_buf(),
        reason,
    };
    let content = fs::read_to_string(path).map_err(|err| registry_error(err.to_string()))?;
    let registry: AdapterRegistryFile =
        serde_yaml::from_str(&content).map_err(|err| registry_error(err.to_string()))?;
    Ok(match registry {
        AdapterRegistryFile::List(adapters) | AdapterRegistryFile::Wrapped { adapters } => {
            adapters
        }
    })
}

/// One full plan → envelope → execute pass.
///
/// # Errors
/// Propagates the first stage error unchanged.
pub fn run_pipeline(
    planner: &Planner,
    executor: &Executor,
    prompt: &Value,
    adapters: &[AdapterDescriptor],
    request: &PlanRequest,
) -> Result<ExecutionTrace, DispatchError> {
    let plan = planner.build_plan(prompt, adapters, request)?;
    let envelope = build_envelope(&plan, adapters)?;
    executor.execute(&envelope)
}

/// Run the pipeline `config.runs` times across `config.workers` threads and
/// summarise the trace digests.
///
/// A summary with `ok == false` is still returned; see
/// [`StressSummary::ensure_ok`].
///
/// # Errors
/// Returns [`HarnessError::Config`] for zero runs or workers and
/// [`HarnessError::Pool`] when the worker pool cannot be created.
pub fn run_stress(
    config: &StressConfig,
    adapters: &[AdapterDescriptor],
) -> Result<StressSummary, HarnessError> {
    config.validate()?;

    let start_rss = memory::current_rss_kib();
    let started = Instant::now();

    let pool = ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|index| format!("dispatch-stress-{index}"))
        .build()?;
    let planner = Planner::default();
    let executor = Executor::default();
    let prompt = Value::String(config.prompt.clone());
    let request = config.plan_request();

    info!(
        runs = config.runs,
        workers = config.workers,
        seed = config.seed,
        strategy = ?config.strategy,
        "stress run starting"
    );

    let outcomes: Vec<Result<String, DispatchError>> = pool.install(|| {
        (0..config.runs)
            .into_par_iter()
            .map(|run| {
                let outcome = run_pipeline(&planner, &executor, &prompt, adapters, &request)
                    .and_then(|trace| trace.digest());
                if let Err(err) = &outcome {
                    warn!(run, code = err.code(), error = %err, "stress run failed");
                }
                outcome
            })
            .collect()
    });

    let wall_time_sec = started.elapsed().as_secs_f64();
    let peak_rss = memory::peak_rss_kib();
    let summary = summarize(config, &outcomes, wall_time_sec, start_rss, peak_rss);

    info!(
        ok = summary.ok,
        failure_count = summary.failure_count,
        unique_trace_hashes = summary.unique_trace_hashes.len(),
        wall_time_sec,
        "stress run finished"
    );
    Ok(summary)
}

fn summarize(
    config: &StressConfig,
    outcomes: &[Result<String, DispatchError>],
    wall_time_sec: f64,
    start_rss: u64,
    peak_rss: u64,
) -> StressSummary {
    let failure_count = outcomes.iter().filter(|outcome| outcome.is_err()).count();
    let unique: BTreeSet<&str> = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_deref().ok())
        .collect();

    let mut reasons = Vec::new();
    if failure_count > 0 && !config.tolerate_failures {
        reasons.push(format!("{failure_count} runs failed with errors"));
    } else {
        if unique.len() > 1 {
            reasons.push("trace hashes diverged".to_string());
        }
        let failure_modes: BTreeSet<String> = outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().err())
            .map(ToString::to_string)
            .collect();
        if failure_modes.len() > 1 {
            reasons.push("failure modes diverged".to_string());
        }
    }

    StressSummary {
        runs: config.runs,
        workers: config.workers,
        seed: config.seed,
        ok: reasons.is_empty(),
        reasons,
        unique_trace_hashes: unique
            .into_iter()
            .take(MAX_REPORTED_HASHES)
            .map(str::to_string)
            .collect(),
        failure_count,
        wall_time_sec: wall_time_sec.max(0.0),
        start_rss,
        peak_rss,
    }
}
