#![forbid(unsafe_code)]

mod canonical;
mod error;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use canonical::{
    canonical_bytes, canonical_bytes_bounded, canonical_number, digest, digest_serialize,
    hash_bytes, is_digest_shaped, DIGEST_HEX_LEN, MAX_CANONICAL_DEPTH,
};
pub use error::DispatchError;

/// Marker carried by every envelope step; nothing is ever really invoked.
pub const DRY_RUN_MODE: &str = "dry-run";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Single,
    Fanout,
    Verify,
    Quorum,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Fanout => "fanout",
            Self::Verify => "verify",
            Self::Quorum => "quorum",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single" => Some(Self::Single),
            "fanout" => Some(Self::Fanout),
            "verify" => Some(Self::Verify),
            "quorum" => Some(Self::Quorum),
            _ => None,
        }
    }

    #[must_use]
    pub fn merge_policy(self) -> MergePolicy {
        match self {
            Self::Single | Self::Verify => MergePolicy::FirstSuccess,
            Self::Fanout => MergePolicy::Rank,
            Self::Quorum => MergePolicy::Vote,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    FirstSuccess,
    Rank,
    Vote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdapterCapabilities {
    #[serde(default)]
    pub supported_strategies: Vec<String>,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdapterLimits {
    #[serde(default)]
    pub timeout_ms_max: Option<u64>,
    #[serde(default)]
    pub memory_mb_max: Option<u64>,
}

/// Static capability record supplied by the adapter registry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdapterDescriptor {
    pub adapter_id: String,
    #[serde(default)]
    pub capabilities: AdapterCapabilities,
    #[serde(default)]
    pub limits: AdapterLimits,
}

impl AdapterDescriptor {
    #[must_use]
    pub fn new(adapter_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            capabilities: AdapterCapabilities::default(),
            limits: AdapterLimits::default(),
        }
    }

    /// An adapter that declares no strategies is treated as supporting all.
    #[must_use]
    pub fn supports(&self, strategy: Strategy) -> bool {
        self.capabilities.supported_strategies.is_empty()
            || self
                .capabilities
                .supported_strategies
                .iter()
                .any(|declared| declared == strategy.as_str())
    }

    #[must_use]
    pub fn declares(&self, strategy: Strategy) -> bool {
        self.capabilities
            .supported_strategies
            .iter()
            .any(|declared| declared == strategy.as_str())
    }

    /// Check whether this adapter would accept being assigned a node of `plan`.
    ///
    /// # Errors
    /// Returns a `Bounds` error for an unsupported strategy or a plan timeout
    /// above `limits.timeout_ms_max`.
    pub fn check_plan_acceptance(&self, plan: &ExecutionPlan) -> Result<(), DispatchError> {
        if !self.supports(plan.strategy) {
            return Err(DispatchError::bounds(
                "supported_strategies",
                format!(
                    "adapter {} does not support strategy {}",
                    self.adapter_id, plan.strategy
                ),
            ));
        }
        if let (Some(timeout_ms), Some(max)) = (plan.timeout_ms, self.limits.timeout_ms_max) {
            if timeout_ms > max {
                return Err(DispatchError::bounds(
                    "timeout_ms_max",
                    format!(
                        "timeout_ms {timeout_ms} exceeds adapter {} limit {max}",
                        self.adapter_id
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanExplain {
    pub request_hash: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecutionPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub strategy: Strategy,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_policy: Option<MergePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<PlanExplain>,
}

impl ExecutionPlan {
    /// A bare plan, as a caller would hand-write it.
    #[must_use]
    pub fn new(strategy: Strategy, nodes: Vec<String>) -> Self {
        Self {
            plan_id: None,
            strategy,
            nodes,
            seed: 0,
            quorum: None,
            timeout_ms: None,
            merge_policy: None,
            explain: None,
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Step {
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn simulate_duration_ms(mut self, duration_ms: u64) -> Self {
        self.simulate_duration_ms = Some(duration_ms);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEnvelope {
    #[serde(default)]
    pub plan_id: Option<String>,
    pub envelope_id: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepResult {
    pub id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub result: Option<String>,
    pub payload_hash: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecutionTrace {
    pub envelope_id: String,
    pub plan_id: Option<String>,
    pub steps: Vec<StepResult>,
    pub quorum: BTreeMap<String, bool>,
}

impl ExecutionTrace {
    /// Canonical digest of the whole trace.
    ///
    /// # Errors
    /// Returns an error if the trace cannot be canonicalized.
    pub fn digest(&self) -> Result<String, DispatchError> {
        digest_serialize(self)
    }
}

/// Bounds the executor enforces before producing any step result.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExecutionLimits {
    pub max_steps: usize,
    pub max_payload_depth: usize,
    pub max_payload_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            max_payload_depth: 256,
            max_payload_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Envelope identifier over the plan id and the ordered step ids.
///
/// # Errors
/// Returns an error if the identity value cannot be canonicalized.
pub fn compute_envelope_id(
    plan_id: Option<&str>,
    step_ids: &[Option<&str>],
) -> Result<String, DispatchError> {
    digest(&json!({
        "plan_id": plan_id,
        "steps": step_ids,
    }))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns a `Shape` error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), DispatchError> {
    if value.trim().is_empty() {
        return Err(DispatchError::shape(field_name, "must be non-empty"));
    }
    Ok(())
}
