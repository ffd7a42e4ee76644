//! Fixed scenarios: the golden determinism check and rejection probes.

use std::collections::BTreeSet;

use clap::ValueEnum;
use model_dispatch_domain::{
    AdapterDescriptor, DispatchError, ExecutionLimits, ExecutionPlan, ExecutionTrace, Strategy,
};
use model_dispatch_executor::{execute, execute_value};
use model_dispatch_orchestrator::build_envelope;
use model_dispatch_planner::{build_plan, PlanRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::default_adapters;

pub const GOLDEN_ADAPTER: &str = "a1";
pub const GOLDEN_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoldenReport {
    pub repeat: usize,
    pub envelope_id: Option<String>,
    pub trace_hashes: Vec<String>,
    pub ok: bool,
}

/// Build and execute the fixed single-node plan `repeat` times; every run
/// must produce the same trace digest.
///
/// # Errors
/// Propagates any pipeline error; the fixed plan is expected never to fail.
pub fn golden(repeat: usize) -> Result<GoldenReport, DispatchError> {
    let adapters = vec![AdapterDescriptor::new(GOLDEN_ADAPTER)];
    let plan = ExecutionPlan::new(Strategy::Single, vec![GOLDEN_ADAPTER.to_string()])
        .with_timeout_ms(GOLDEN_TIMEOUT_MS);

    let mut envelope_id = None;
    let mut trace_hashes = Vec::with_capacity(repeat);
    for run in 0..repeat {
        let envelope = build_envelope(&plan, &adapters)?;
        let trace_hash = execute(&envelope)?.digest()?;
        debug!(
            run,
            envelope_id = %envelope.envelope_id,
            trace_hash = %trace_hash,
            "golden run"
        );
        envelope_id.get_or_insert(envelope.envelope_id);
        trace_hashes.push(trace_hash);
    }

    let unique: BTreeSet<&String> = trace_hashes.iter().collect();
    let ok = unique.len() == 1;
    if ok {
        info!(repeat, "golden scenario deterministic across runs");
    } else {
        warn!(repeat, unique = unique.len(), "golden scenario produced divergent traces");
    }

    Ok(GoldenReport {
        repeat,
        envelope_id,
        trace_hashes,
        ok,
    })
}

/// Malformed inputs the pipeline must refuse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeCase {
    MissingSteps,
    EmptyNodes,
    UnknownNode,
    TamperedEnvelope,
    BadDuration,
    DeepPayload,
}

impl ProbeCase {
    pub const ALL: [ProbeCase; 6] = [
        ProbeCase::MissingSteps,
        ProbeCase::EmptyNodes,
        ProbeCase::UnknownNode,
        ProbeCase::TamperedEnvelope,
        ProbeCase::BadDuration,
        ProbeCase::DeepPayload,
    ];

    /// Error code the rejection must carry.
    #[must_use]
    pub fn expected_code(self) -> &'static str {
        match self {
            Self::MissingSteps => "missing_field",
            Self::EmptyNodes | Self::BadDuration => "shape_error",
            Self::UnknownNode => "unknown_reference",
            Self::TamperedEnvelope => "integrity_error",
            Self::DeepPayload => "resource_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeReport {
    pub case: ProbeCase,
    pub rejected: bool,
    pub expected_code: String,
    pub code: Option<String>,
    pub message: Option<String>,
    pub ok: bool,
}

/// Feed one malformed input through the pipeline and record how it was
/// refused.
#[must_use]
pub fn probe(case: ProbeCase) -> ProbeReport {
    let expected_code = case.expected_code();
    let report = match run_probe(case) {
        Ok(_) => ProbeReport {
            case,
            rejected: false,
            expected_code: expected_code.to_string(),
            code: None,
            message: None,
            ok: false,
        },
        Err(err) => ProbeReport {
            case,
            rejected: true,
            expected_code: expected_code.to_string(),
            code: Some(err.code().to_string()),
            message: Some(err.to_string()),
            ok: err.code() == expected_code,
        },
    };
    if report.ok {
        info!(case = ?case, code = ?report.code, "probe rejected as expected");
    } else {
        warn!(case = ?case, code = ?report.code, expected_code, "probe not rejected as expected");
    }
    report
}

fn run_probe(case: ProbeCase) -> Result<ExecutionTrace, DispatchError> {
    let single = [AdapterDescriptor::new(GOLDEN_ADAPTER)];
    match case {
        ProbeCase::MissingSteps => execute_value(&json!({"envelope_id": "eX", "plan_id": "pX"})),
        ProbeCase::EmptyNodes => {
            let plan = ExecutionPlan::new(Strategy::Fanout, Vec::new())
                .with_timeout_ms(GOLDEN_TIMEOUT_MS);
            execute(&build_envelope(&plan, &single)?)
        }
        ProbeCase::UnknownNode => {
            let plan = ExecutionPlan::new(
                Strategy::Fanout,
                vec![GOLDEN_ADAPTER.to_string(), "ghost".to_string()],
            );
            execute(&build_envelope(&plan, &single)?)
        }
        ProbeCase::TamperedEnvelope => {
            let adapters = default_adapters();
            let plan = build_plan(
                &json!("probe"),
                &adapters,
                &PlanRequest::strategy(Strategy::Fanout).with_fanout(3),
            )?;
            let mut envelope = build_envelope(&plan, &adapters)?;
            envelope.steps.reverse();
            execute(&envelope)
        }
        ProbeCase::BadDuration => execute_value(&json!({
            "envelope_id": "eX",
            "steps": [{"id": "s1", "simulate_duration_ms": "not-an-int"}]
        })),
        ProbeCase::DeepPayload => {
            let mut payload = Value::Null;
            for _ in 0..=ExecutionLimits::default().max_payload_depth {
                payload = json!({ "k": payload });
            }
            execute_value(&json!({
                "envelope_id": "eX",
                "steps": [{"id": "s1", "payload": payload}]
            }))
        }
    }
}
