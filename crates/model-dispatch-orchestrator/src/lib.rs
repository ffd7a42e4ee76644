#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use model_dispatch_domain::{
    compute_envelope_id, digest_serialize, AdapterDescriptor, DispatchError, ExecutionEnvelope,
    ExecutionPlan, Step, DRY_RUN_MODE,
};
use tracing::debug;

/// Expand a plan into a tamper-evident dry-run envelope.
///
/// Steps are emitted in sorted node order so that plans naming the same node
/// set in a different order produce the same envelope. Each step's `id` is its
/// node id, which makes the envelope id recomputable from the steps alone.
///
/// # Errors
/// Returns a `Shape` error for empty or duplicated nodes, an
/// `UnknownReference` error naming every node without an adapter, and a
/// `Bounds` error when a resolved adapter refuses the plan.
pub fn build_envelope(
    plan: &ExecutionPlan,
    adapters: &[AdapterDescriptor],
) -> Result<ExecutionEnvelope, DispatchError> {
    if plan.nodes.is_empty() {
        return Err(DispatchError::shape("plan.nodes", "must not be empty"));
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for node in &plan.nodes {
        if !seen.insert(node.as_str()) {
            duplicates.insert(node.as_str());
        }
    }
    if !duplicates.is_empty() {
        return Err(DispatchError::shape(
            "plan.nodes",
            format!(
                "duplicate node ids: {}",
                duplicates.into_iter().collect::<Vec<_>>().join(", ")
            ),
        ));
    }

    let adapter_map: BTreeMap<&str, &AdapterDescriptor> = adapters
        .iter()
        .map(|adapter| (adapter.adapter_id.as_str(), adapter))
        .collect();

    let unknown: Vec<String> = plan
        .nodes
        .iter()
        .filter(|node| !adapter_map.contains_key(node.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(DispatchError::UnknownReference { ids: unknown });
    }

    let mut steps = Vec::with_capacity(seen.len());
    for node in seen {
        let Some(adapter) = adapter_map.get(node) else {
            return Err(DispatchError::UnknownReference {
                ids: vec![node.to_string()],
            });
        };
        adapter.check_plan_acceptance(plan)?;
        steps.push(Step {
            id: Some(node.to_string()),
            node: Some(node.to_string()),
            adapter: Some(adapter.adapter_id.clone()),
            mode: Some(DRY_RUN_MODE.to_string()),
            timeout_ms: plan.timeout_ms,
            ..Step::default()
        });
    }

    let plan_id = match &plan.plan_id {
        Some(plan_id) => plan_id.clone(),
        None => digest_serialize(plan)?,
    };
    let step_ids: Vec<Option<&str>> = steps.iter().map(|step| step.id.as_deref()).collect();
    let envelope_id = compute_envelope_id(Some(&plan_id), &step_ids)?;

    debug!(
        plan_id = %plan_id,
        envelope_id = %envelope_id,
        steps = steps.len(),
        "execution envelope built"
    );

    Ok(ExecutionEnvelope {
        plan_id: Some(plan_id),
        envelope_id,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::build_envelope;
    use model_dispatch_domain::{
        compute_envelope_id, is_digest_shaped, AdapterDescriptor, DispatchError,
        ExecutionEnvelope, ExecutionPlan, Strategy, DRY_RUN_MODE,
    };
    use model_dispatch_planner::{build_plan, PlanRequest};
    use serde_json::json;

    fn adapters(ids: &[&str]) -> Vec<AdapterDescriptor> {
        ids.iter().map(|id| AdapterDescriptor::new(*id)).collect()
    }

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| (*id).to_string()).collect()
    }

    fn must(result: Result<ExecutionEnvelope, DispatchError>) -> ExecutionEnvelope {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn single_node_plan_yields_one_dry_run_step() {
        let plan = ExecutionPlan::new(Strategy::Single, nodes(&["a1"])).with_timeout_ms(1000);
        let envelope = must(build_envelope(&plan, &adapters(&["a1"])));

        assert_eq!(envelope.steps.len(), 1);
        let step = &envelope.steps[0];
        assert_eq!(step.id.as_deref(), Some("a1"));
        assert_eq!(step.node.as_deref(), Some("a1"));
        assert_eq!(step.adapter.as_deref(), Some("a1"));
        assert_eq!(step.mode.as_deref(), Some(DRY_RUN_MODE));
        assert_eq!(step.timeout_ms, Some(1000));
        assert!(is_digest_shaped(&envelope.envelope_id));
    }

    #[test]
    fn steps_are_sorted_and_plan_order_does_not_matter() {
        let pool = adapters(&["a1", "a2", "a3"]);
        let mut forward = ExecutionPlan::new(Strategy::Fanout, nodes(&["a3", "a1", "a2"]));
        forward.plan_id = Some("p".to_string());
        let mut backward = ExecutionPlan::new(Strategy::Fanout, nodes(&["a2", "a3", "a1"]));
        backward.plan_id = Some("p".to_string());

        let first = must(build_envelope(&forward, &pool));
        let second = must(build_envelope(&backward, &pool));
        assert_eq!(first, second);
        let order: Vec<Option<&str>> = first.steps.iter().map(|s| s.node.as_deref()).collect();
        assert_eq!(order, vec![Some("a1"), Some("a2"), Some("a3")]);
    }

    #[test]
    fn envelope_id_is_recomputable_from_steps() {
        let pool = adapters(&["a0", "a1", "a2", "a3", "a4"]);
        let plan = build_plan(
            &json!("stress test"),
            &pool,
            &PlanRequest::strategy(Strategy::Fanout).with_fanout(3).with_seed(9),
        )
        .unwrap_or_else(|err| panic!("plan failed: {err}"));
        let envelope = must(build_envelope(&plan, &pool));

        let ids: Vec<Option<&str>> = envelope.steps.iter().map(|s| s.id.as_deref()).collect();
        let recomputed = compute_envelope_id(envelope.plan_id.as_deref(), &ids)
            .unwrap_or_else(|err| panic!("recompute failed: {err}"));
        assert_eq!(recomputed, envelope.envelope_id);
        assert_eq!(envelope.plan_id, plan.plan_id);
    }

    #[test]
    fn empty_nodes_are_rejected() {
        let plan = ExecutionPlan::new(Strategy::Fanout, Vec::new()).with_timeout_ms(1000);
        assert!(matches!(
            build_envelope(&plan, &adapters(&["a1"])),
            Err(DispatchError::Shape { ref field, .. }) if field == "plan.nodes"
        ));
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let plan = ExecutionPlan::new(Strategy::Fanout, nodes(&["a1", "a1"]));
        match build_envelope(&plan, &adapters(&["a1", "a2"])) {
            Err(DispatchError::Shape { reason, .. }) => assert!(reason.contains("a1")),
            other => panic!("expected shape error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_nodes_are_named() {
        let plan = ExecutionPlan::new(Strategy::Fanout, nodes(&["a1", "ghost", "phantom"]));
        match build_envelope(&plan, &adapters(&["a1"])) {
            Err(DispatchError::UnknownReference { ids }) => {
                assert_eq!(ids, nodes(&["ghost", "phantom"]));
            }
            other => panic!("expected unknown reference, got {other:?}"),
        }
    }

    #[test]
    fn missing_plan_id_is_derived_from_plan_content() {
        let plan = ExecutionPlan::new(Strategy::Single, nodes(&["a1"]));
        let first = must(build_envelope(&plan, &adapters(&["a1"])));
        let second = must(build_envelope(
            &plan.clone().with_timeout_ms(5),
            &adapters(&["a1"]),
        ));
        let plan_id = first.plan_id.unwrap_or_default();
        assert!(is_digest_shaped(&plan_id));
        assert_ne!(Some(plan_id), second.plan_id);
    }

    #[test]
    fn adapter_refusing_strategy_blocks_envelope() {
        let mut pool = adapters(&["a1", "a2"]);
        pool[1].capabilities.supported_strategies = vec!["single".to_string()];
        let plan = ExecutionPlan::new(Strategy::Fanout, nodes(&["a1", "a2"]));
        assert!(matches!(
            build_envelope(&plan, &pool),
            Err(DispatchError::Bounds { ref bound, .. }) if bound == "supported_strategies"
        ));
    }
}
