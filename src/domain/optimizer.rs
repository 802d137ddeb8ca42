use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::call_pattern::extract_call_relations;
use crate::domain::clock::SharedClock;
use crate::domain::collaborators::CostEstimator;
use crate::domain::communication::{
    CommunicationConfig, CommunicationEstimator, CommunicationPolicy, SimulatedCommunicationEstimator, optimize_communication,
};
use crate::domain::fusion::{Fusion, FusionGroup, group_of, setup_string};
use crate::domain::grouper::{build_fusion_groups, topological_order};
use crate::domain::planner::{ExecutionPlan, PlannerConfig, build_plan, simulate_completion_ms};
use crate::domain::resource::{DEFAULT_MEMORY_CATALOGUE, ResourceWeights, optimize_memory};
use crate::domain::trace::ExecutionTrace;
use crate::domain::unit::{Unit, WorkloadClass};
use crate::error::{Error, Result};

/// Cached results expire after this long (reference behavior: 300 s).
pub const DEFAULT_CACHE_TTL_MS: i64 = 300_000;

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub cache_ttl_ms: i64,
    pub memory_catalogue: Vec<i64>,
    pub weights: ResourceWeights,
    pub planner: PlannerConfig,
    pub communication: CommunicationPolicy,

    /// The communication phase is advisory and can be switched off.
    pub enable_communication: bool,

    /// Baseline handler time assumed when a unit has no observed history.
    pub base_time_ms: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            memory_catalogue: DEFAULT_MEMORY_CATALOGUE.to_vec(),
            weights: ResourceWeights::default(),
            planner: PlannerConfig::default(),
            communication: CommunicationPolicy::default(),
            enable_communication: true,
            base_time_ms: 120.0,
        }
    }
}

/// Score components that selected the winning configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreComponents {
    pub estimated_latency_ms: f64,
    pub estimated_cost: f64,
}

/// Timestamped bundle produced by one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub fusion_id: String,
    pub created_at_ms: i64,
    pub groups: Vec<FusionGroup>,

    /// Selected memory size per group key.
    pub memory_by_group: HashMap<String, i64>,
    pub communication: Vec<CommunicationConfig>,
    pub plan: ExecutionPlan,
    pub score: ScoreComponents,

    /// Deterministic setup key: group keys joined by `,`, members sorted.
    pub setup_key: String,
    pub cycle_present: bool,

    /// Set when the run had no history to work from and fell back to the
    /// declared chain.
    pub is_noop: bool,
}

impl OptimizationResult {
    pub fn memory_of(&self, groups: &[FusionGroup], unit_id: &str) -> Option<i64> {
        group_of(groups, unit_id).and_then(|g| self.memory_by_group.get(&g.key()).copied())
    }
}

/// Per-fusion result cache with a fixed TTL. Concurrent read/replace; an
/// expired entry reads as absent.
#[derive(Debug)]
pub struct OptimizationCache {
    entries: RwLock<HashMap<String, OptimizationResult>>,
    ttl_ms: i64,
    clock: SharedClock,
}

impl OptimizationCache {
    pub fn new(clock: SharedClock, ttl_ms: i64) -> OptimizationCache {
        OptimizationCache { entries: RwLock::new(HashMap::new()), ttl_ms, clock }
    }

    pub fn get(&self, fusion_id: &str) -> Option<OptimizationResult> {
        let now = self.clock.now_ms();
        let entries = self.entries.read().expect("optimization cache lock poisoned");
        entries.get(fusion_id).filter(|r| now - r.created_at_ms <= self.ttl_ms).cloned()
    }

    pub fn put(&self, result: OptimizationResult) {
        let mut entries = self.entries.write().expect("optimization cache lock poisoned");
        entries.insert(result.fusion_id.clone(), result);
    }

    pub fn invalidate(&self, fusion_id: &str) {
        let mut entries = self.entries.write().expect("optimization cache lock poisoned");
        entries.remove(fusion_id);
    }
}

/// Multi-phase optimizer: path grouping, memory search, async planning and
/// the advisory communication phase.
///
/// Works entirely on snapshots (traces, unit clones) handed in by the
/// caller; it never touches a registry lock, so estimator calls are free to
/// block.
#[derive(Debug)]
pub struct Optimizer {
    config: OptimizerConfig,
    clock: SharedClock,
    estimator: Option<Arc<dyn CostEstimator>>,
    communication_estimator: Arc<dyn CommunicationEstimator>,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, clock: SharedClock, estimator: Option<Arc<dyn CostEstimator>>) -> Optimizer {
        Optimizer { config, clock, estimator, communication_estimator: Arc::new(SimulatedCommunicationEstimator::default()) }
    }

    pub fn with_communication_estimator(mut self, estimator: Arc<dyn CommunicationEstimator>) -> Optimizer {
        self.communication_estimator = estimator;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Runs all phases. Missing history degrades to a no-op result rather
    /// than failing the caller.
    pub fn optimize(&self, fusion: &Fusion, traces: &[ExecutionTrace], units: &[Unit]) -> OptimizationResult {
        match self.run_phases(fusion, traces, units) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Optimization for fusion '{}' unavailable ({}); keeping declared configuration", fusion.id, e);
                self.noop_result(fusion, units)
            }
        }
    }

    fn run_phases(&self, fusion: &Fusion, traces: &[ExecutionTrace], units: &[Unit]) -> Result<OptimizationResult> {
        let relations = extract_call_relations(traces);
        if relations.is_empty() {
            return Err(Error::OptimizationUnavailable(format!("no call history for fusion '{}'", fusion.id)));
        }

        let unit_by_id: HashMap<&str, &Unit> = units.iter().map(|u| (u.id.as_str(), u)).collect();
        let workload_of = |unit_id: &str| unit_by_id.get(unit_id).map(|u| u.workload_class).unwrap_or(WorkloadClass::Cpu);
        let region_of = |unit_id: &str| unit_by_id.get(unit_id).map(|u| u.region.clone());

        // Phase 1: path optimization
        let groups = build_fusion_groups(&fusion.chain, &relations);
        let topo = topological_order(&fusion.chain, &relations);
        if topo.cycle_present {
            log::warn!("Fusion '{}' shows a cyclic call pattern; chain order kept for the cycle members", fusion.id);
        }

        // Phase 2: infrastructure (memory) optimization
        let selections = optimize_memory(
            &groups,
            &self.config.memory_catalogue,
            self.config.weights,
            self.estimator.as_deref(),
            self.config.base_time_ms,
            workload_of,
        );
        let memory_by_group: HashMap<String, i64> = selections.iter().map(|s| (s.group_key.clone(), s.memory_mb)).collect();
        let estimated_cost: f64 = selections.iter().map(|s| s.estimated_cost).sum();

        // Phase 3: async execution planning, costed with observed per-unit
        // durations re-estimated at the selected memory sizes
        let observed = observed_mean_durations(traces);
        let step_costs = self.step_costs(fusion, &groups, &memory_by_group, &observed, &unit_by_id);
        let plan = build_plan(fusion, &relations, &self.config.planner, &step_costs);

        let communication = if self.config.enable_communication {
            optimize_communication(&groups, &relations, &self.config.communication, Some(self.communication_estimator.as_ref()), region_of)
        } else {
            Vec::new()
        };

        let estimated_latency_ms = simulate_completion_ms(&plan.steps, &step_costs, self.config.planner.default_step_cost_ms);
        let setup_key = setup_string(&groups);
        log::info!(
            "Optimized fusion '{}': {} group(s) [{}], estimated latency {:.1} ms",
            fusion.id,
            groups.len(),
            setup_key,
            estimated_latency_ms
        );

        Ok(OptimizationResult {
            fusion_id: fusion.id.clone(),
            created_at_ms: self.clock.now_ms(),
            groups,
            memory_by_group,
            communication,
            plan,
            score: ScoreComponents { estimated_latency_ms, estimated_cost },
            setup_key,
            cycle_present: topo.cycle_present,
            is_noop: false,
        })
    }

    /// Per-unit simulated step costs at the selected memory sizes.
    fn step_costs(
        &self,
        fusion: &Fusion,
        groups: &[FusionGroup],
        memory_by_group: &HashMap<String, i64>,
        observed: &HashMap<String, f64>,
        unit_by_id: &HashMap<&str, &Unit>,
    ) -> HashMap<String, f64> {
        let mut costs = HashMap::with_capacity(fusion.chain.len());
        for unit_id in &fusion.chain {
            let base = observed.get(unit_id).copied().unwrap_or(self.config.base_time_ms);
            let cost = match (&self.estimator, unit_by_id.get(unit_id.as_str())) {
                (Some(estimator), Some(unit)) => {
                    let memory_mb = group_of(groups, unit_id)
                        .and_then(|g| memory_by_group.get(&g.key()).copied())
                        .unwrap_or(unit.memory_mb);
                    estimator.estimate_duration_ms(base, memory_mb, false, false, 0.0, unit.workload_class)
                }
                _ => base,
            };
            costs.insert(unit_id.clone(), cost);
        }
        costs
    }

    /// Declared-chain fallback used when no history or estimator exists.
    fn noop_result(&self, fusion: &Fusion, units: &[Unit]) -> OptimizationResult {
        let unit_by_id: HashMap<&str, &Unit> = units.iter().map(|u| (u.id.as_str(), u)).collect();
        let groups: Vec<FusionGroup> = fusion.chain.iter().map(FusionGroup::singleton).collect();
        let memory_by_group = groups
            .iter()
            .map(|g| {
                let current = g.members.first().and_then(|m| unit_by_id.get(m.as_str())).map(|u| u.memory_mb).unwrap_or(1024);
                (g.key(), current)
            })
            .collect();
        let setup_key = setup_string(&groups);

        OptimizationResult {
            fusion_id: fusion.id.clone(),
            created_at_ms: self.clock.now_ms(),
            groups,
            memory_by_group,
            communication: Vec::new(),
            plan: ExecutionPlan::from_declared_chain(fusion),
            score: ScoreComponents { estimated_latency_ms: 0.0, estimated_cost: 0.0 },
            setup_key,
            cycle_present: false,
            is_noop: true,
        }
    }
}

/// Mean observed node duration per unit across a trace batch.
fn observed_mean_durations(traces: &[ExecutionTrace]) -> HashMap<String, f64> {
    let mut totals: HashMap<String, (f64, u64)> = HashMap::new();
    for trace in traces {
        for node in &trace.nodes {
            if node.is_terminal() {
                let entry = totals.entry(node.unit_id.clone()).or_insert((0.0, 0));
                entry.0 += node.duration_ms as f64;
                entry.1 += 1;
            }
        }
    }
    totals.into_iter().map(|(unit, (sum, count))| (unit, sum / count.max(1) as f64)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::collaborators::SimulatedCostEstimator;
    use crate::domain::fusion::CallMode;
    use crate::domain::trace::{ExecutionTraceNode, Strategy};
    use std::sync::Arc;

    fn sample_trace(fusion_id: &str) -> ExecutionTrace {
        let mut trace = ExecutionTrace::new(fusion_id, 0);
        let chain = [("a", None, CallMode::Sync), ("b", Some("a"), CallMode::Sync), ("c", Some("b"), CallMode::Async)];
        let mut t = 0;
        for (unit, parent, mode) in chain {
            let mut node = ExecutionTraceNode::new(unit, parent.map(str::to_string), Strategy::Local, mode);
            node.start(t);
            t += 100;
            node.complete(t, serde_json::json!({}));
            trace.push_node(node);
        }
        trace.complete(t);
        trace
    }

    fn units() -> Vec<Unit> {
        vec![
            Unit::new("a", 256, 3_000, "eu-central-1", WorkloadClass::Cpu),
            Unit::new("b", 256, 3_000, "eu-central-1", WorkloadClass::Cpu),
            Unit::new("c", 256, 3_000, "eu-central-1", WorkloadClass::Io),
        ]
    }

    fn optimizer() -> Optimizer {
        let (clock, _) = ManualClock::shared(1_000);
        let config = OptimizerConfig { planner: PlannerConfig { seed: Some(11), ..PlannerConfig::default() }, ..OptimizerConfig::default() };
        Optimizer::new(config, clock, Some(Arc::new(SimulatedCostEstimator::default())))
    }

    #[test]
    fn optimize_produces_partition_and_setup_key() {
        let fusion = Fusion::new("f", vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let traces = vec![sample_trace("f"), sample_trace("f")];

        let result = optimizer().optimize(&fusion, &traces, &units());

        assert!(!result.is_noop);
        // a-b sync-dominant merge, c async-dominant stays alone.
        assert_eq!(result.setup_key, "a.b,c");
        assert_eq!(result.groups.len(), 2);
        assert!(result.memory_by_group.contains_key("a.b"));
        assert!(result.memory_by_group.contains_key("c"));
        assert!(result.score.estimated_latency_ms > 0.0);
    }

    #[test]
    fn no_history_yields_noop_result() {
        let fusion = Fusion::new("f", vec!["a".to_string(), "b".to_string()]);
        let result = optimizer().optimize(&fusion, &[], &units());

        assert!(result.is_noop);
        assert_eq!(result.setup_key, "a,b");
        assert_eq!(result.plan.steps.len(), 2);
    }

    #[test]
    fn cache_expires_entries_after_ttl() {
        let (shared, handle) = ManualClock::shared(0);
        let cache = OptimizationCache::new(shared.clone(), 300_000);

        let fusion = Fusion::new("f", vec!["a".to_string()]);
        let optimizer = Optimizer::new(OptimizerConfig::default(), shared, None);
        let result = optimizer.optimize(&fusion, &[], &units());
        cache.put(result);

        assert!(cache.get("f").is_some());
        handle.advance(300_001);
        assert!(cache.get("f").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let (shared, _) = ManualClock::shared(0);
        let cache = OptimizationCache::new(shared, 300_000);
        let optimizer = optimizer();
        let fusion = Fusion::new("f", vec!["a".to_string()]);
        cache.put(optimizer.optimize(&fusion, &[], &units()));

        cache.invalidate("f");
        assert!(cache.get("f").is_none());
    }
}
