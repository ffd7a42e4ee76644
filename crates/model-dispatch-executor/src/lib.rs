#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use model_dispatch_domain::{
    canonical_bytes_bounded, compute_envelope_id, digest_serialize, hash_bytes, is_digest_shaped,
    DispatchError, ExecutionEnvelope, ExecutionLimits, ExecutionTrace, Step, StepResult,
    StepStatus,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct Executor {
    limits: ExecutionLimits,
}

/// A step with its payload already copied out of the envelope as canonical
/// bytes. Simulation only reads snapshots.
#[derive(Debug, Clone)]
struct StepSnapshot {
    id: String,
    payload_bytes: Vec<u8>,
    duration_ms: u64,
    timeout_ms: Option<u64>,
    group: Option<String>,
}

impl Executor {
    #[must_use]
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Execute a raw JSON envelope.
    ///
    /// # Errors
    /// Returns `MissingField`/`Shape` errors naming the malformed field, plus
    /// every error of [`Executor::execute`].
    pub fn execute_value(&self, raw: &Value) -> Result<ExecutionTrace, DispatchError> {
        let envelope = parse_envelope(raw)?;
        self.execute(&envelope)
    }

    /// Deterministically simulate every step of an envelope.
    ///
    /// # Errors
    /// Returns a `Shape` error for an empty step list, a `Resource` error when
    /// a configured limit is exceeded, and an `Integrity` error when a
    /// digest-shaped `envelope_id` does not match its recomputation.
    pub fn execute(&self, envelope: &ExecutionEnvelope) -> Result<ExecutionTrace, DispatchError> {
        if envelope.steps.is_empty() {
            return Err(DispatchError::shape("steps", "must not be empty"));
        }
        if envelope.steps.len() > self.limits.max_steps {
            return Err(DispatchError::resource(
                "max_steps",
                format!(
                    "{} steps exceed limit {}",
                    envelope.steps.len(),
                    self.limits.max_steps
                ),
            ));
        }

        verify_integrity(envelope)?;

        let snapshots = envelope
            .steps
            .iter()
            .map(|step| self.snapshot(step))
            .collect::<Result<Vec<_>, _>>()?;

        let steps = snapshots
            .into_iter()
            .map(|snapshot| simulate(&snapshot))
            .collect::<Vec<_>>();
        let quorum = compute_quorum(&steps);

        debug!(
            envelope_id = %envelope.envelope_id,
            steps = steps.len(),
            groups = quorum.len(),
            "envelope executed"
        );

        Ok(ExecutionTrace {
            envelope_id: envelope.envelope_id.clone(),
            plan_id: envelope.plan_id.clone(),
            steps,
            quorum,
        })
    }

    fn snapshot(&self, step: &Step) -> Result<StepSnapshot, DispatchError> {
        // An empty id is treated as absent.
        let id = match step.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => digest_serialize(step)?,
        };
        let payload_bytes = canonical_bytes_bounded(
            step.payload.as_ref().unwrap_or(&Value::Null),
            self.limits.max_payload_depth,
            self.limits.max_payload_bytes,
        )?;
        Ok(StepSnapshot {
            id,
            payload_bytes,
            duration_ms: step.simulate_duration_ms.unwrap_or(0),
            timeout_ms: step.timeout_ms,
            group: step.group.clone(),
        })
    }
}

/// Execute a typed envelope with default limits.
///
/// # Errors
/// See [`Executor::execute`].
pub fn execute(envelope: &ExecutionEnvelope) -> Result<ExecutionTrace, DispatchError> {
    Executor::default().execute(envelope)
}

/// Execute a raw JSON envelope with default limits.
///
/// # Errors
/// See [`Executor::execute_value`].
pub fn execute_value(raw: &Value) -> Result<ExecutionTrace, DispatchError> {
    Executor::default().execute_value(raw)
}

fn verify_integrity(envelope: &ExecutionEnvelope) -> Result<(), DispatchError> {
    // Short synthetic ids cannot be digests and are accepted as-is.
    if !is_digest_shaped(&envelope.envelope_id) {
        return Ok(());
    }
    let step_ids: Vec<Option<&str>> = envelope
        .steps
        .iter()
        .map(|step| step.id.as_deref())
        .collect();
    let expected = compute_envelope_id(envelope.plan_id.as_deref(), &step_ids)?;
    if expected != envelope.envelope_id {
        warn!(
            envelope_id = %envelope.envelope_id,
            expected = %expected,
            "envelope integrity check failed"
        );
        return Err(DispatchError::Integrity {
            expected,
            actual: envelope.envelope_id.clone(),
        });
    }
    Ok(())
}

fn simulate(snapshot: &StepSnapshot) -> StepResult {
    let timed_out = snapshot
        .timeout_ms
        .is_some_and(|timeout_ms| snapshot.duration_ms > timeout_ms);
    let (status, result, payload_hash) = if timed_out {
        (StepStatus::TimedOut, None, None)
    } else {
        (
            StepStatus::Ok,
            Some(hash_bytes(&id_payload_bytes(&snapshot.id, &snapshot.payload_bytes))),
            Some(hash_bytes(&snapshot.payload_bytes)),
        )
    };
    StepResult {
        id: snapshot.id.clone(),
        status,
        duration_ms: snapshot.duration_ms,
        result,
        payload_hash,
        group: snapshot.group.clone(),
    }
}

/// Canonical bytes of `{"id": id, "payload": payload}` from an already
/// canonical payload.
fn id_payload_bytes(id: &str, payload_bytes: &[u8]) -> Vec<u8> {
    let id_json = Value::String(id.to_string()).to_string();
    let mut out = Vec::with_capacity(id_json.len() + payload_bytes.len() + 18);
    out.extend_from_slice(b"{\"id\":");
    out.extend_from_slice(id_json.as_bytes());
    out.extend_from_slice(b",\"payload\":");
    out.extend_from_slice(payload_bytes);
    out.push(b'}');
    out
}

/// Per-group strict-majority agreement on `payload_hash`.
///
/// Timed-out members have no hash and vote together as their own bucket.
/// Steps without a (non-empty) group are ignored.
#[must_use]
pub fn compute_quorum(results: &[StepResult]) -> BTreeMap<String, bool> {
    let mut groups: BTreeMap<&str, Vec<&StepResult>> = BTreeMap::new();
    for result in results {
        if let Some(group) = result.group.as_deref().filter(|group| !group.is_empty()) {
            groups.entry(group).or_default().push(result);
        }
    }

    groups
        .into_iter()
        .map(|(group, members)| {
            let mut votes: BTreeMap<Option<&str>, usize> = BTreeMap::new();
            for member in &members {
                *votes.entry(member.payload_hash.as_deref()).or_default() += 1;
            }
            let majority = votes.values().any(|count| count * 2 > members.len());
            (group.to_string(), majority)
        })
        .collect()
}

/// Parse a raw JSON envelope, naming the offending field on failure.
///
/// # Errors
/// Returns `MissingField` for absent `envelope_id`/`steps` and `Shape` for
/// any field of the wrong type.
pub fn parse_envelope(raw: &Value) -> Result<ExecutionEnvelope, DispatchError> {
    let Value::Object(map) = raw else {
        return Err(DispatchError::shape("envelope", "must be an object"));
    };
    let envelope_id = match map.get("envelope_id") {
        None => return Err(DispatchError::missing("envelope_id")),
        Some(Value::String(envelope_id)) => envelope_id.clone(),
        Some(_) => return Err(DispatchError::shape("envelope_id", "must be a string")),
    };
    let items = match map.get("steps") {
        None => return Err(DispatchError::missing("steps")),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(DispatchError::shape("steps", "must be a list")),
    };
    let plan_id = optional_string(map, "plan_id", "plan_id")?;

    let steps = items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_step(index, item))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ExecutionEnvelope {
        plan_id,
        envelope_id,
        steps,
    })
}

fn parse_step(index: usize, item: &Value) -> Result<Step, DispatchError> {
    let Value::Object(map) = item else {
        return Err(DispatchError::shape(
            format!("steps[{index}]"),
            "must be an object",
        ));
    };
    let field = |name: &str| format!("steps[{index}].{name}");

    let mut step = Step {
        id: optional_string(map, "id", &field("id"))?,
        node: optional_string(map, "node", &field("node"))?,
        adapter: optional_string(map, "adapter", &field("adapter"))?,
        mode: optional_string(map, "mode", &field("mode"))?,
        payload: map.get("payload").cloned(),
        timeout_ms: optional_millis(map, "timeout_ms", &field("timeout_ms"))?,
        simulate_duration_ms: optional_millis(
            map,
            "simulate_duration_ms",
            &field("simulate_duration_ms"),
        )?,
        group: optional_string(map, "group", &field("group"))?,
        ..Step::default()
    };
    for (key, value) in map {
        if !matches!(
            key.as_str(),
            "id" | "node"
                | "adapter"
                | "mode"
                | "payload"
                | "timeout_ms"
                | "simulate_duration_ms"
                | "group"
        ) {
            step.extra.insert(key.clone(), value.clone());
        }
    }
    Ok(step)
}

fn optional_string(
    map: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<Option<String>, DispatchError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(DispatchError::shape(field, "must be a string")),
    }
}

/// Millisecond fields accept a non-negative integer or its decimal text form.
fn optional_millis(
    map: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<Option<u64>, DispatchError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number.as_u64().map(Some).ok_or_else(|| {
            DispatchError::shape(field, format!("must be a non-negative integer, got {number}"))
        }),
        Some(Value::String(text)) => text.trim().parse::<u64>().map(Some).map_err(|_| {
            DispatchError::shape(field, format!("must be a non-negative integer, got {text:?}"))
        }),
        Some(_) => Err(DispatchError::shape(
            field,
            "must be a non-negative integer",
        )),
    }
}
