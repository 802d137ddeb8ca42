use std::collections::{HashMap, HashSet};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::domain::call_pattern::CallRelation;
use crate::domain::fusion::{CallMode, Fusion};

/// One step of an execution plan.
///
/// `wait_for` names the units whose results this step consumes; every
/// member is guaranteed to appear strictly earlier in the final order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub unit_id: String,
    pub kind: CallMode,
    pub wait_for: Vec<String>,
}

/// Join deadline for one async step: the latest plan position by which its
/// result must have been collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionPoint {
    pub needed_at: usize,
    pub collect_before: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    pub collection: HashMap<String, CollectionPoint>,
}

impl ExecutionPlan {
    /// Unoptimized fallback: walk the declared chain in order with its
    /// declared edge modes, joining every async side call at the end.
    pub fn from_declared_chain(fusion: &Fusion) -> ExecutionPlan {
        let mut steps = Vec::with_capacity(fusion.chain.len());
        for (index, unit_id) in fusion.chain.iter().enumerate() {
            let kind = if index == 0 { CallMode::Sync } else { fusion.mode_of(unit_id) };
            let wait_for = if index == 0 { Vec::new() } else { vec![fusion.chain[index - 1].clone()] };
            steps.push(PlanStep { unit_id: unit_id.clone(), kind, wait_for });
        }
        let collection = build_collection_map(&steps);
        ExecutionPlan { steps, collection }
    }

    /// Units whose output some other step consumes. A failing async unit
    /// aborts the trace only when it is in this set.
    pub fn critical_units(&self) -> HashSet<String> {
        self.steps.iter().flat_map(|s| s.wait_for.iter().cloned()).collect()
    }

    pub fn position_of(&self, unit_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.unit_id == unit_id)
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Number of randomized reordering trials. Tunable, not a contract.
    pub trials: usize,

    /// Per-step cost assumed when no estimate is available for a unit.
    pub default_step_cost_ms: f64,

    /// Fixed RNG seed for reproducible planning runs.
    pub seed: Option<u64>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig { trials: 3, default_step_cost_ms: 100.0, seed: None }
    }
}

/// **Async execution planning phase.**
///
/// Classifies each chain unit as critical (some later unit consumes its
/// output) or as a candidate for async placement, builds the initial plan,
/// then runs a bounded randomized local search over the relative order of
/// the async steps, keeping the ordering with the lowest simulated
/// completion time.
pub fn build_plan(fusion: &Fusion, relations: &[CallRelation], config: &PlannerConfig, step_costs: &HashMap<String, f64>) -> ExecutionPlan {
    let dependents = dependency_edges(fusion, relations);

    let initial = build_initial_steps(&fusion.chain, &dependents);
    let steps = optimize_step_order(initial, config, step_costs);
    let collection = build_collection_map(&steps);

    ExecutionPlan { steps, collection }
}

/// Simulated total completion time of a plan under the given per-unit
/// costs. Sync steps advance the controller; async steps run beside it and
/// only pull the controller forward at their collection point.
pub fn simulate_completion_ms(steps: &[PlanStep], step_costs: &HashMap<String, f64>, default_cost_ms: f64) -> f64 {
    let collection = build_collection_map(steps);
    let cost = |unit: &str| step_costs.get(unit).copied().unwrap_or(default_cost_ms);

    let mut finish: HashMap<&str, f64> = HashMap::with_capacity(steps.len());
    let mut current_time = 0.0f64;

    for (index, step) in steps.iter().enumerate() {
        // Join async results whose deadline is this position.
        for (unit_id, point) in &collection {
            if point.collect_before == index {
                if let Some(&async_finish) = finish.get(unit_id.as_str()) {
                    current_time = current_time.max(async_finish);
                }
            }
        }

        let ready = step.wait_for.iter().filter_map(|dep| finish.get(dep.as_str())).fold(0.0f64, |acc, &t| acc.max(t));

        match step.kind {
            CallMode::Sync => {
                let start = current_time.max(ready);
                current_time = start + cost(&step.unit_id);
                finish.insert(step.unit_id.as_str(), current_time);
            }
            CallMode::Async => {
                let start = current_time.max(ready);
                finish.insert(step.unit_id.as_str(), start + cost(&step.unit_id));
            }
        }
    }

    for (unit_id, point) in &collection {
        if point.collect_before >= steps.len() {
            if let Some(&async_finish) = finish.get(unit_id.as_str()) {
                current_time = current_time.max(async_finish);
            }
        }
    }

    current_time
}

/// Dependency edges caller -> dependents, restricted to chain units.
///
/// Observed relations take precedence; without history the declared chain
/// edges stand in (a sync edge into a callee makes it depend on its
/// caller).
fn dependency_edges(fusion: &Fusion, relations: &[CallRelation]) -> HashMap<String, Vec<String>> {
    let chain_units: HashSet<&str> = fusion.chain.iter().map(String::as_str).collect();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    let mut insert_edge = |caller: &str, callee: &str| {
        let edges = dependents.entry(caller.to_string()).or_default();
        if !edges.iter().any(|e| e == callee) {
            edges.push(callee.to_string());
        }
    };

    let mut observed = false;
    for relation in relations {
        if chain_units.contains(relation.caller.as_str()) && chain_units.contains(relation.callee.as_str()) {
            insert_edge(&relation.caller, &relation.callee);
            observed = true;
        }
    }

    if !observed {
        for pair in fusion.chain.windows(2) {
            if fusion.mode_of(&pair[1]) == CallMode::Sync {
                insert_edge(&pair[0], &pair[1]);
            }
        }
    }

    dependents
}

/// Builds the initial plan: chain order, critical units as sync steps,
/// the rest as async steps deferred until their dependencies are placed.
fn build_initial_steps(chain: &[String], dependents: &HashMap<String, Vec<String>>) -> Vec<PlanStep> {
    let position: HashMap<&str, usize> = chain.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    let is_critical = |unit: &str| -> bool {
        let Some(own_pos) = position.get(unit) else { return false };
        dependents
            .get(unit)
            .map(|deps| deps.iter().any(|d| position.get(d.as_str()).is_some_and(|p| p > own_pos)))
            .unwrap_or(false)
    };

    // Inverse view: which earlier units does each unit wait for.
    let mut waits: HashMap<&str, Vec<String>> = HashMap::new();
    for (caller, dependent_list) in dependents {
        for dependent in dependent_list {
            waits.entry(dependent.as_str()).or_default().push(caller.clone());
        }
    }

    let mut steps: Vec<PlanStep> = Vec::with_capacity(chain.len());
    let mut placed: HashSet<String> = HashSet::with_capacity(chain.len());
    let mut deferred: Vec<PlanStep> = Vec::new();

    fn place(step: PlanStep, steps: &mut Vec<PlanStep>, placed: &mut HashSet<String>, deferred: &mut Vec<PlanStep>) {
        placed.insert(step.unit_id.clone());
        steps.push(step);

        // Flush deferred steps whose dependencies are now satisfied.
        let mut index = 0;
        while index < deferred.len() {
            if deferred[index].wait_for.iter().all(|d| placed.contains(d)) {
                let ready_step = deferred.remove(index);
                placed.insert(ready_step.unit_id.clone());
                steps.push(ready_step);
                index = 0;
            } else {
                index += 1;
            }
        }
    }

    for unit_id in chain {
        let own_pos = position[unit_id.as_str()];
        // Only strictly earlier chain units count as dependencies; a
        // backward edge (observed cycle) must not stall the plan.
        let wait_for: Vec<String> = waits
            .get(unit_id.as_str())
            .map(|deps| deps.iter().filter(|d| position.get(d.as_str()).is_some_and(|p| *p < own_pos)).cloned().collect())
            .unwrap_or_default();

        if is_critical(unit_id) {
            place(PlanStep { unit_id: unit_id.clone(), kind: CallMode::Sync, wait_for }, &mut steps, &mut placed, &mut deferred);
        } else {
            let step = PlanStep { unit_id: unit_id.clone(), kind: CallMode::Async, wait_for };
            if step.wait_for.iter().all(|d| placed.contains(d)) {
                place(step, &mut steps, &mut placed, &mut deferred);
            } else {
                deferred.push(step);
            }
        }
    }

    // Anything still deferred waits on units that never appear; place it
    // at the end rather than dropping it.
    for step in deferred {
        log::warn!("Plan step '{}' waits on units that were never placed; appending at the end", step.unit_id);
        steps.push(step);
    }

    steps
}

/// Bounded randomized local search over the async step order.
///
/// Sync steps keep their relative order; each trial shuffles the async
/// steps, reinserts them at the earliest legal position after their
/// dependencies and keeps the candidate only when its simulated completion
/// time is strictly lower than the incumbent's.
fn optimize_step_order(initial: Vec<PlanStep>, config: &PlannerConfig, step_costs: &HashMap<String, f64>) -> Vec<PlanStep> {
    let async_count = initial.iter().filter(|s| s.kind == CallMode::Async).count();
    if async_count < 2 || config.trials == 0 {
        return initial;
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut best_time = simulate_completion_ms(&initial, step_costs, config.default_step_cost_ms);
    let mut best = initial.clone();

    let sync_steps: Vec<PlanStep> = initial.iter().filter(|s| s.kind == CallMode::Sync).cloned().collect();
    let async_steps: Vec<PlanStep> = initial.iter().filter(|s| s.kind == CallMode::Async).cloned().collect();

    for trial in 0..config.trials {
        let mut shuffled = async_steps.clone();
        shuffled.shuffle(&mut rng);

        let candidate = reinsert_async_steps(&sync_steps, shuffled);
        let candidate_time = simulate_completion_ms(&candidate, step_costs, config.default_step_cost_ms);

        log::trace!("Planner trial {}: simulated completion {:.1} ms (incumbent {:.1} ms)", trial, candidate_time, best_time);
        if candidate_time < best_time {
            best_time = candidate_time;
            best = candidate;
        }
    }

    best
}

/// Rebuilds a full step order from the fixed sync sequence and a proposed
/// async ordering, inserting each async step at the earliest position where
/// all of its `wait_for` dependencies are already present.
fn reinsert_async_steps(sync_steps: &[PlanStep], mut pending: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut steps: Vec<PlanStep> = sync_steps.to_vec();

    while !pending.is_empty() {
        let mut progressed = false;

        let mut index = 0;
        while index < pending.len() {
            let present: HashSet<&str> = steps.iter().map(|s| s.unit_id.as_str()).collect();
            if pending[index].wait_for.iter().all(|d| present.contains(d.as_str())) {
                let step = pending.remove(index);
                let insert_at = step
                    .wait_for
                    .iter()
                    .filter_map(|d| steps.iter().position(|s| &s.unit_id == d))
                    .max()
                    .map(|p| p + 1)
                    .unwrap_or(0);
                steps.insert(insert_at, step);
                progressed = true;
            } else {
                index += 1;
            }
        }

        if !progressed {
            // Mutual waits between async steps; fall back to appending in
            // the proposed order.
            for step in pending.drain(..) {
                steps.push(step);
            }
        }
    }

    steps
}

/// For every async step, the position of the next step depending on it, or
/// the plan length when nothing later consumes its result.
fn build_collection_map(steps: &[PlanStep]) -> HashMap<String, CollectionPoint> {
    let mut collection = HashMap::new();

    for (index, step) in steps.iter().enumerate() {
        if step.kind != CallMode::Async {
            continue;
        }
        let deadline = steps
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, later)| later.wait_for.iter().any(|d| d == &step.unit_id))
            .map(|(position, _)| position)
            .unwrap_or(steps.len());
        collection.insert(step.unit_id.clone(), CollectionPoint { needed_at: deadline, collect_before: deadline });
    }

    collection
}
