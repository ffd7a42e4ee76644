#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use model_dispatch_domain::{
    digest, ensure_non_empty, AdapterDescriptor, DispatchError, ExecutionPlan, PlanExplain,
    Strategy,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

pub const MAX_FANOUT: u32 = 1000;

/// Condition tested against the adapter pool when no strategy is requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum StrategyPredicate {
    AdapterCountAtMost(usize),
    AdapterCountAtLeast(usize),
    AnyAdapterDeclares(Strategy),
    Always,
}

impl StrategyPredicate {
    fn matches(self, adapters: &[AdapterDescriptor]) -> bool {
        match self {
            Self::AdapterCountAtMost(limit) => adapters.len() <= limit,
            Self::AdapterCountAtLeast(limit) => adapters.len() >= limit,
            Self::AnyAdapterDeclares(strategy) => {
                adapters.iter().any(|adapter| adapter.declares(strategy))
            }
            Self::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StrategyRule {
    pub when: StrategyPredicate,
    pub choose: Strategy,
}

/// Ordered first-match-wins rules; the last rule must be [`StrategyPredicate::Always`].
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct StrategyRuleTable {
    rules: Vec<StrategyRule>,
}

impl StrategyRuleTable {
    /// Build a rule table.
    ///
    /// # Errors
    /// Returns a `Shape` error when the table is empty or does not end with a
    /// catch-all rule.
    pub fn new(rules: Vec<StrategyRule>) -> Result<Self, DispatchError> {
        match rules.last() {
            Some(rule) if rule.when == StrategyPredicate::Always => Ok(Self { rules }),
            Some(_) => Err(DispatchError::shape(
                "rules",
                "last rule must be an unconditional catch-all",
            )),
            None => Err(DispatchError::shape("rules", "must not be empty")),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[StrategyRule] {
        &self.rules
    }

    /// Returns the chosen strategy and the index of the rule that matched.
    #[must_use]
    pub fn select(&self, adapters: &[AdapterDescriptor]) -> (Strategy, usize) {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.when.matches(adapters) {
                return (rule.choose, index);
            }
        }
        // `new` guarantees a trailing catch-all.
        let last = self.rules.len().saturating_sub(1);
        (self.rules[last].choose, last)
    }
}

impl Default for StrategyRuleTable {
    fn default() -> Self {
        Self {
            rules: vec![
                StrategyRule {
                    when: StrategyPredicate::AdapterCountAtMost(1),
                    choose: Strategy::Single,
                },
                StrategyRule {
                    when: StrategyPredicate::AnyAdapterDeclares(Strategy::Verify),
                    choose: Strategy::Verify,
                },
                StrategyRule {
                    when: StrategyPredicate::AdapterCountAtLeast(3),
                    choose: Strategy::Quorum,
                },
                StrategyRule {
                    when: StrategyPredicate::Always,
                    choose: Strategy::Fanout,
                },
            ],
        }
    }
}

impl<'de> Deserialize<'de> for StrategyRuleTable {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            rules: Vec<StrategyRule>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Self::new(raw.rules).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlannerConfig {
    pub max_fanout: u32,
    pub rules: StrategyRuleTable,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_fanout: MAX_FANOUT,
            rules: StrategyRuleTable::default(),
        }
    }
}

/// Caller-supplied planning parameters; everything is optional.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanRequest {
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub fanout: Option<u32>,
    #[serde(default)]
    pub quorum: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PlanRequest {
    #[must_use]
    pub fn strategy(strategy: Strategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_fanout(mut self, fanout: u32) -> Self {
        self.fanout = Some(fanout);
        self
    }

    #[must_use]
    pub fn with_quorum(mut self, quorum: u32) -> Self {
        self.quorum = Some(quorum);
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    #[must_use]
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Build a deterministic execution plan.
    ///
    /// # Errors
    /// Returns `Shape` errors for a malformed adapter pool, `Bounds` errors for
    /// out-of-range or conflicting parameters, and `MissingField` when verify
    /// is requested explicitly without a quorum.
    pub fn build_plan(
        &self,
        prompt: &Value,
        adapters: &[AdapterDescriptor],
        request: &PlanRequest,
    ) -> Result<ExecutionPlan, DispatchError> {
        let pool = validate_pool(adapters)?;
        let seed = request.seed.unwrap_or(0);
        self.validate_fanout(request.fanout)?;
        validate_quorum(request.quorum, pool.len())?;
        if request.timeout_ms == Some(0) {
            return Err(DispatchError::bounds("timeout_ms", "must be >= 1"));
        }

        let (strategy, reason) = match request.strategy {
            Some(strategy) => (strategy, format!("requested strategy {strategy}")),
            None => {
                let (strategy, rule) = self.config.rules.select(adapters);
                (
                    strategy,
                    format!("selected strategy {strategy} deterministically (rule {rule})"),
                )
            }
        };
        let rule_selected = request.strategy.is_none();
        reject_conflicts(strategy, request)?;

        let nodes = match strategy {
            Strategy::Single => vec![pool[position(seed, pool.len())].to_string()],
            Strategy::Fanout => {
                let count = match request.fanout {
                    Some(fanout) => usize::try_from(fanout).unwrap_or(usize::MAX),
                    None => pool.len(),
                };
                if count > pool.len() {
                    return Err(DispatchError::bounds(
                        "fanout_pool",
                        format!("{count} exceeds adapter count {}", pool.len()),
                    ));
                }
                seeded_draw(&pool, seed, count)
            }
            Strategy::Verify => {
                // A rule-selected verify pairs a primary with one verifier.
                let quorum = match request.quorum {
                    Some(quorum) => quorum,
                    None if rule_selected => 2,
                    None => return Err(DispatchError::missing("quorum")),
                };
                if quorum < 2 {
                    return Err(DispatchError::bounds(
                        "quorum",
                        "verify requires at least 2 nodes",
                    ));
                }
                let count = usize::try_from(quorum).unwrap_or(usize::MAX);
                (0..count)
                    .map(|index| pool[index % pool.len()].to_string())
                    .collect()
            }
            Strategy::Quorum => {
                let size = match request.quorum {
                    Some(size) => usize::try_from(size).unwrap_or(usize::MAX),
                    None if pool.len() >= 3 => 3,
                    None => 1,
                };
                if size % 2 == 0 {
                    return Err(DispatchError::bounds("quorum", "quorum size must be odd"));
                }
                if size > pool.len() {
                    return Err(DispatchError::bounds(
                        "quorum",
                        format!("size {size} larger than available adapters {}", pool.len()),
                    ));
                }
                let mut sorted = pool.clone();
                sorted.sort_unstable();
                sorted.into_iter().take(size).map(str::to_string).collect()
            }
        };

        if let Some(timeout_ms) = request.timeout_ms {
            enforce_timeout_limits(timeout_ms, &nodes, adapters)?;
        }

        let plan_id = digest(&json!({
            "prompt": prompt,
            "strategy": strategy.as_str(),
            "seed": seed,
        }))?;
        let request_hash = digest(prompt)?;

        debug!(
            plan_id = %plan_id,
            strategy = %strategy,
            nodes = nodes.len(),
            seed,
            "execution plan built"
        );

        Ok(ExecutionPlan {
            plan_id: Some(plan_id),
            strategy,
            nodes,
            seed,
            quorum: request.quorum,
            timeout_ms: request.timeout_ms,
            merge_policy: Some(strategy.merge_policy()),
            explain: Some(PlanExplain {
                request_hash,
                reason,
            }),
        })
    }

    fn validate_fanout(&self, fanout: Option<u32>) -> Result<(), DispatchError> {
        match fanout {
            Some(0) => Err(DispatchError::bounds("fanout", "must be an integer >= 1")),
            Some(value) if value > self.config.max_fanout => Err(DispatchError::bounds(
                "max_fanout",
                format!("fanout {value} exceeds maximum {}", self.config.max_fanout),
            )),
            _ => Ok(()),
        }
    }
}

/// Build a plan with the default planner configuration.
///
/// # Errors
/// See [`Planner::build_plan`].
pub fn build_plan(
    prompt: &Value,
    adapters: &[AdapterDescriptor],
    request: &PlanRequest,
) -> Result<ExecutionPlan, DispatchError> {
    Planner::default().build_plan(prompt, adapters, request)
}

/// One-line human rationale for a plan.
#[must_use]
pub fn plan_rationale(plan: &ExecutionPlan) -> String {
    let reason = plan
        .explain
        .as_ref()
        .map_or("", |explain| explain.reason.as_str());
    format!(
        "Strategy={}; nodes=[{}]; reason={}",
        plan.strategy,
        plan.nodes.join(", "),
        reason
    )
}

fn validate_pool(adapters: &[AdapterDescriptor]) -> Result<Vec<&str>, DispatchError> {
    if adapters.is_empty() {
        return Err(DispatchError::shape("adapters", "must be a non-empty list"));
    }
    let mut seen = BTreeSet::new();
    let mut pool = Vec::with_capacity(adapters.len());
    for adapter in adapters {
        ensure_non_empty("adapter_id", &adapter.adapter_id)?;
        if !seen.insert(adapter.adapter_id.as_str()) {
            return Err(DispatchError::shape(
                "adapters",
                format!("duplicate adapter_id: {}", adapter.adapter_id),
            ));
        }
        pool.push(adapter.adapter_id.as_str());
    }
    Ok(pool)
}

fn validate_quorum(quorum: Option<u32>, adapter_count: usize) -> Result<(), DispatchError> {
    let Some(quorum) = quorum else {
        return Ok(());
    };
    if quorum == 0 {
        return Err(DispatchError::bounds("quorum", "must be a positive integer"));
    }
    if usize::try_from(quorum).unwrap_or(usize::MAX) > adapter_count {
        return Err(DispatchError::bounds(
            "quorum",
            format!("{quorum} cannot exceed number of adapters {adapter_count}"),
        ));
    }
    Ok(())
}

fn reject_conflicts(strategy: Strategy, request: &PlanRequest) -> Result<(), DispatchError> {
    match strategy {
        Strategy::Single | Strategy::Fanout if request.quorum.is_some() => {
            Err(DispatchError::bounds(
                "quorum",
                format!("quorum provided for {strategy} strategy is invalid"),
            ))
        }
        Strategy::Single if request.fanout.is_some_and(|fanout| fanout != 1) => {
            Err(DispatchError::bounds(
                "fanout",
                "single strategy only admits fanout 1",
            ))
        }
        Strategy::Verify | Strategy::Quorum if request.fanout.is_some() => {
            Err(DispatchError::bounds(
                "fanout",
                format!("fanout provided for {strategy} strategy is invalid"),
            ))
        }
        _ => Ok(()),
    }
}

fn enforce_timeout_limits(
    timeout_ms: u64,
    nodes: &[String],
    adapters: &[AdapterDescriptor],
) -> Result<(), DispatchError> {
    for node in nodes {
        let limit = adapters
            .iter()
            .find(|adapter| &adapter.adapter_id == node)
            .and_then(|adapter| adapter.limits.timeout_ms_max);
        if let Some(max) = limit {
            if timeout_ms > max {
                return Err(DispatchError::bounds(
                    "timeout_ms_max",
                    format!("timeout_ms {timeout_ms} exceeds adapter {node} limit {max}"),
                ));
            }
        }
    }
    Ok(())
}

fn position(value: u64, len: usize) -> usize {
    let len = u64::try_from(len).unwrap_or(u64::MAX);
    usize::try_from(value % len).unwrap_or(0)
}

fn draw_value(seed: u64, draw: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"fanout-draw");
    hasher.update(seed.to_be_bytes());
    hasher.update(draw.to_be_bytes());
    let digest = hasher.finalize();
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Seeded draw with replacement; a repeated pick probes forward in pool order
/// so the resulting node list never contains duplicates. `count <= pool.len()`.
fn seeded_draw(pool: &[&str], seed: u64, count: usize) -> Vec<String> {
    let mut taken = vec![false; pool.len()];
    let mut nodes = Vec::with_capacity(count);
    for draw in 0..count {
        let draw = u64::try_from(draw).unwrap_or(u64::MAX);
        let mut index = position(draw_value(seed, draw), pool.len());
        while taken[index] {
            index = (index + 1) % pool.len();
        }
        taken[index] = true;
        nodes.push(pool[index].to_string());
    }
    debug!(seed, count, "fanout draw complete");
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_dispatch_domain::Strategy;
    use proptest::prelude::*;

    fn adapters(count: usize) -> Vec<AdapterDescriptor> {
        (0..count)
            .map(|index| AdapterDescriptor::new(format!("a{index}")))
            .collect()
    }

    fn must<T>(result: Result<T, DispatchError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn bound_of(result: Result<ExecutionPlan, DispatchError>) -> String {
        match result {
            Err(DispatchError::Bounds { bound, .. }) => bound,
            other => panic!("expected bounds error, got {other:?}"),
        }
    }

    fn prompt() -> Value {
        json!("hi")
    }

    #[test]
    fn single_uses_seed_modulo_caller_order() {
        let pool = vec![
            AdapterDescriptor::new("zeta"),
            AdapterDescriptor::new("alpha"),
            AdapterDescriptor::new("mid"),
        ];
        let first = must(build_plan(&prompt(), &pool, &PlanRequest::strategy(Strategy::Single)));
        assert_eq!(first.nodes, vec!["zeta".to_string()]);

        let fourth = must(build_plan(
            &prompt(),
            &pool,
            &PlanRequest::strategy(Strategy::Single).with_seed(4),
        ));
        assert_eq!(fourth.nodes, vec!["alpha".to_string()]);
        assert_eq!(fourth.seed, 4);
    }

    #[test]
    fn identical_inputs_give_identical_plans() {
        let request = PlanRequest::strategy(Strategy::Fanout)
            .with_fanout(3)
            .with_seed(7);
        let first = must(build_plan(&prompt(), &adapters(5), &request));
        let second = must(build_plan(&prompt(), &adapters(5), &request));
        assert_eq!(first, second);
        let first_bytes = serde_json::to_vec(&first).unwrap_or_default();
        let second_bytes = serde_json::to_vec(&second).unwrap_or_default();
        assert!(!first_bytes.is_empty());
        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn fanout_zero_is_rejected() {
        let request = PlanRequest::strategy(Strategy::Fanout).with_fanout(0);
        assert_eq!(bound_of(build_plan(&prompt(), &adapters(3), &request)), "fanout");
    }

    #[test]
    fn fanout_above_maximum_is_rejected() {
        let request = PlanRequest::strategy(Strategy::Fanout).with_fanout(1_000_000);
        assert_eq!(
            bound_of(build_plan(&prompt(), &adapters(3), &request)),
            "max_fanout"
        );
    }

    #[test]
    fn fanout_above_pool_size_is_rejected() {
        let request = PlanRequest::strategy(Strategy::Fanout).with_fanout(4);
        assert_eq!(
            bound_of(build_plan(&prompt(), &adapters(3), &request)),
            "fanout_pool"
        );
    }

    #[test]
    fn fanout_one_degenerates_to_single_node() {
        let request = PlanRequest::strategy(Strategy::Fanout)
            .with_fanout(1)
            .with_seed(1);
        let plan = must(build_plan(&prompt(), &adapters(3), &request));
        assert_eq!(plan.nodes.len(), 1);
    }

    #[test]
    fn fanout_without_count_selects_every_adapter_once() {
        let plan = must(build_plan(
            &prompt(),
            &adapters(6),
            &PlanRequest::strategy(Strategy::Fanout).with_seed(11),
        ));
        let unique: BTreeSet<&String> = plan.nodes.iter().collect();
        assert_eq!(plan.nodes.len(), 6);
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn seed_edge_cases_are_stable() {
        let base = PlanRequest::strategy(Strategy::Fanout).with_fanout(3);
        let p0 = must(build_plan(&prompt(), &adapters(5), &base.with_seed(0)));
        let p1 = must(build_plan(&prompt(), &adapters(5), &base.with_seed(u64::from(u32::MAX))));
        let p2 = must(build_plan(&prompt(), &adapters(5), &base.with_seed(0)));
        assert_eq!(p0.nodes, p2.nodes);
        assert_ne!(p0, p1);
        assert_ne!(p0.plan_id, p1.plan_id);
    }

    #[test]
    fn quorum_with_fanout_strategy_is_a_conflict() {
        let request = PlanRequest::strategy(Strategy::Fanout)
            .with_fanout(2)
            .with_quorum(3);
        assert_eq!(bound_of(build_plan(&prompt(), &adapters(3), &request)), "quorum");

        let single = PlanRequest::strategy(Strategy::Single).with_quorum(1);
        assert_eq!(bound_of(build_plan(&prompt(), &adapters(3), &single)), "quorum");
    }

    #[test]
    fn impossible_quorum_is_rejected() {
        let request = PlanRequest::strategy(Strategy::Verify).with_quorum(3);
        assert_eq!(bound_of(build_plan(&prompt(), &adapters(2), &request)), "quorum");
    }

    #[test]
    fn verify_requires_quorum() {
        let result = build_plan(&prompt(), &adapters(3), &PlanRequest::strategy(Strategy::Verify));
        assert!(matches!(
            result,
            Err(DispatchError::MissingField { ref field }) if field == "quorum"
        ));

        let one = PlanRequest::strategy(Strategy::Verify).with_quorum(1);
        assert_eq!(bound_of(build_plan(&prompt(), &adapters(3), &one)), "quorum");
    }

    #[test]
    fn verify_selects_by_position() {
        let request = PlanRequest::strategy(Strategy::Verify).with_quorum(2);
        let plan = must(build_plan(&prompt(), &adapters(3), &request));
        assert_eq!(plan.nodes, vec!["a0".to_string(), "a1".to_string()]);
        assert_eq!(plan.quorum, Some(2));
    }

    #[test]
    fn quorum_strategy_takes_sorted_prefix_of_odd_size() {
        let pool = vec![
            AdapterDescriptor::new("c"),
            AdapterDescriptor::new("a"),
            AdapterDescriptor::new("d"),
            AdapterDescriptor::new("b"),
        ];
        let plan = must(build_plan(&prompt(), &pool, &PlanRequest::strategy(Strategy::Quorum)));
        assert_eq!(plan.nodes, vec!["a", "b", "c"]);

        let even = PlanRequest::strategy(Strategy::Quorum).with_quorum(2);
        assert_eq!(bound_of(build_plan(&prompt(), &pool, &even)), "quorum");

        let small = must(build_plan(
            &prompt(),
            &adapters(2),
            &PlanRequest::strategy(Strategy::Quorum),
        ));
        assert_eq!(small.nodes.len(), 1);
    }

    #[test]
    fn rule_table_selects_strategy_when_none_requested() {
        let single = must(build_plan(&prompt(), &adapters(1), &PlanRequest::default()));
        assert_eq!(single.strategy, Strategy::Single);

        let quorum = must(build_plan(&prompt(), &adapters(4), &PlanRequest::default()));
        assert_eq!(quorum.strategy, Strategy::Quorum);

        let fanout = must(build_plan(&prompt(), &adapters(2), &PlanRequest::default()));
        assert_eq!(fanout.strategy, Strategy::Fanout);

        let mut pool = adapters(3);
        pool[2].capabilities.supported_strategies = vec!["verify".to_string()];
        let verify = must(build_plan(
            &prompt(),
            &pool,
            &PlanRequest::default().with_quorum(2),
        ));
        assert_eq!(verify.strategy, Strategy::Verify);
        assert!(plan_rationale(&verify).starts_with("Strategy=verify; nodes=[a0, a1]; reason="));
    }

    #[test]
    fn rule_selected_verify_defaults_to_primary_and_one_verifier() {
        let mut pool = adapters(3);
        pool[0].capabilities.supported_strategies =
            vec!["verify".to_string(), "single".to_string()];
        let plan = must(build_plan(&prompt(), &pool, &PlanRequest::default()));
        assert_eq!(plan.strategy, Strategy::Verify);
        assert_eq!(plan.nodes, vec!["a0".to_string(), "a1".to_string()]);
        assert_eq!(plan.quorum, None);

        let explicit = build_plan(&prompt(), &pool, &PlanRequest::strategy(Strategy::Verify));
        assert!(matches!(
            explicit,
            Err(DispatchError::MissingField { ref field }) if field == "quorum"
        ));
    }

    #[test]
    fn custom_rule_table_must_end_with_catch_all() {
        let missing = StrategyRuleTable::new(vec![StrategyRule {
            when: StrategyPredicate::AdapterCountAtLeast(2),
            choose: Strategy::Fanout,
        }]);
        assert!(matches!(missing, Err(DispatchError::Shape { .. })));
        assert!(StrategyRuleTable::new(Vec::new()).is_err());

        let table = must(StrategyRuleTable::new(vec![StrategyRule {
            when: StrategyPredicate::Always,
            choose: Strategy::Single,
        }]));
        let planner = Planner::new(PlannerConfig {
            max_fanout: MAX_FANOUT,
            rules: table,
        });
        let plan = must(planner.build_plan(&prompt(), &adapters(5), &PlanRequest::default()));
        assert_eq!(plan.strategy, Strategy::Single);
    }

    #[test]
    fn rule_table_rejects_missing_catch_all_when_deserialized() {
        let raw = json!({"rules": [{"when": {"kind": "adapter_count_at_most", "value": 1}, "choose": "single"}]});
        assert!(serde_json::from_value::<StrategyRuleTable>(raw).is_err());
        let raw = json!({"rules": [{"when": {"kind": "always"}, "choose": "fanout"}]});
        assert!(serde_json::from_value::<StrategyRuleTable>(raw).is_ok());
    }

    #[test]
    fn timeout_is_bounded_by_selected_adapters() {
        let mut pool = adapters(2);
        pool[0].limits.timeout_ms_max = Some(500);
        let ok = PlanRequest::strategy(Strategy::Single).with_timeout_ms(500);
        assert_eq!(must(build_plan(&prompt(), &pool, &ok)).timeout_ms, Some(500));

        let slow = PlanRequest::strategy(Strategy::Single).with_timeout_ms(501);
        assert_eq!(bound_of(build_plan(&prompt(), &pool, &slow)), "timeout_ms_max");

        let zero = PlanRequest::strategy(Strategy::Single).with_timeout_ms(0);
        assert_eq!(bound_of(build_plan(&prompt(), &pool, &zero)), "timeout_ms");
    }

    #[test]
    fn empty_or_duplicate_pools_are_rejected() {
        let empty = build_plan(&prompt(), &[], &PlanRequest::default());
        assert!(matches!(empty, Err(DispatchError::Shape { .. })));

        let duplicated = vec![AdapterDescriptor::new("a"), AdapterDescriptor::new("a")];
        let result = build_plan(&prompt(), &duplicated, &PlanRequest::default());
        assert!(matches!(result, Err(DispatchError::Shape { .. })));
    }

    #[test]
    fn plan_carries_merge_policy_and_request_hash() {
        let plan = must(build_plan(
            &json!({"text": "hi", "constraints": {}}),
            &adapters(3),
            &PlanRequest::strategy(Strategy::Quorum),
        ));
        assert_eq!(plan.merge_policy, Some(model_dispatch_domain::MergePolicy::Vote));
        let explain = plan.explain.unwrap_or_else(|| panic!("explain missing"));
        assert_eq!(
            explain.request_hash,
            must(digest(&json!({"constraints": {}, "text": "hi"})))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_fanout_plans_are_deterministic_and_duplicate_free(
            pool_size in 1usize..12,
            fanout_seed in 0u32..1000,
            seed in any::<u64>(),
        ) {
            let pool = adapters(pool_size);
            let fanout = fanout_seed % u32::try_from(pool_size).unwrap_or(1) + 1;
            let request = PlanRequest::strategy(Strategy::Fanout).with_fanout(fanout).with_seed(seed);
            let first = must(build_plan(&prompt(), &pool, &request));
            let second = must(build_plan(&prompt(), &pool, &request));
            prop_assert_eq!(&first, &second);
            let unique: BTreeSet<&String> = first.nodes.iter().collect();
            prop_assert_eq!(unique.len(), first.nodes.len());
            prop_assert_eq!(first.nodes.len(), usize::try_from(fanout).unwrap_or(0));
        }
    }
}
