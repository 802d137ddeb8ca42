use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::domain::clock::SharedClock;
use crate::domain::collaborators::{InvocationRequest, UnitInvoker};
use crate::domain::fusion::{CallMode, Fusion, FusionGroup, FusionRegistry, group_of};
use crate::domain::optimizer::OptimizationCache;
use crate::domain::planner::ExecutionPlan;
use crate::domain::trace::{ExecutionTrace, ExecutionTraceNode, Strategy, TraceRegistry, TraceStatus};
use crate::domain::unit::UnitRegistry;
use crate::error::{Error, Result};

/// Outcome of one fusion invocation: final status, the merged result
/// context, non-fatal errors from async side calls and the failing unit
/// when the trace aborted.
#[derive(Debug, Clone)]
pub struct FusionResponse {
    pub trace_id: String,
    pub status: TraceStatus,
    pub result: Value,
    pub errors: Vec<String>,
    pub failed_unit: Option<String>,
    pub duration_ms: i64,
}

/// Interprets an execution plan (or the raw declared chain when no
/// optimization is cached) against the live unit set.
///
/// Async invocations are spawned as tasks and tracked in an explicit
/// in-flight map; joins happen exactly where the plan's collection map
/// dictates, so observable completion order in the trace follows the plan,
/// not real completion time.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    units: Arc<UnitRegistry>,
    fusions: Arc<FusionRegistry>,
    traces: Arc<TraceRegistry>,
    cache: Arc<OptimizationCache>,
    invoker: Arc<dyn UnitInvoker>,
    clock: SharedClock,

    /// Payload size assumed for every hop in this simulation.
    pub payload_size_kb: f64,
}

impl ExecutionEngine {
    pub fn new(
        units: Arc<UnitRegistry>,
        fusions: Arc<FusionRegistry>,
        traces: Arc<TraceRegistry>,
        cache: Arc<OptimizationCache>,
        invoker: Arc<dyn UnitInvoker>,
        clock: SharedClock,
    ) -> ExecutionEngine {
        ExecutionEngine { units, fusions, traces, cache, invoker, clock, payload_size_kb: 16.0 }
    }

    /// Executes one invocation of a registered fusion.
    ///
    /// Fails with `UnknownFusion` (and creates no trace) when the id is not
    /// registered. All unit-level failures are reported through the
    /// response and its trace instead.
    pub async fn execute(&self, fusion_id: &str, input: Value) -> Result<FusionResponse> {
        let fusion = self.fusions.get(fusion_id)?;

        let (plan, groups) = match self.cache.get(fusion_id) {
            Some(result) => (result.plan, result.groups),
            None => {
                let plan = ExecutionPlan::from_declared_chain(&fusion);
                let groups = fusion.chain.iter().map(FusionGroup::singleton).collect();
                (plan, groups)
            }
        };

        self.run_plan(&fusion, &plan, &groups, input).await
    }

    async fn run_plan(&self, fusion: &Fusion, plan: &ExecutionPlan, groups: &[FusionGroup], input: Value) -> Result<FusionResponse> {
        let mut trace = ExecutionTrace::new(&fusion.id, self.clock.now_ms());
        self.traces.upsert(trace.clone());
        log::debug!("Trace {} started for fusion '{}' ({} step(s))", trace.trace_id, fusion.id, plan.steps.len());

        let critical = plan.critical_units();
        let mut context = initial_context(input);
        let mut in_flight: HashMap<String, JoinHandle<Result<Value>>> = HashMap::new();
        let mut failed_unit: Option<String> = None;

        'steps: for (index, step) in plan.steps.iter().enumerate() {
            // Join every async result whose deadline is this position.
            let mut due: Vec<String> = plan.collection.iter().filter(|(_, p)| p.collect_before == index).map(|(u, _)| u.clone()).collect();
            due.sort();
            for unit_id in due {
                if let Some(handle) = in_flight.remove(&unit_id) {
                    if self.join_async(&mut trace, &mut context, &unit_id, handle, &critical).await {
                        failed_unit = Some(unit_id);
                        self.cancel_outstanding(&mut trace, &mut in_flight);
                        break 'steps;
                    }
                }
            }

            let parent_id = if index == 0 { None } else { Some(plan.steps[index - 1].unit_id.clone()) };
            let unit = match self.units.get(&step.unit_id) {
                Ok(unit) => unit,
                Err(e) => {
                    // A fusion referencing an unregistered unit is fatal to
                    // this invocation.
                    log::error!("Fusion '{}' references unregistered unit '{}'", fusion.id, step.unit_id);
                    let mut node = ExecutionTraceNode::new(&step.unit_id, parent_id, Strategy::Local, step.kind);
                    node.start(self.clock.now_ms());
                    node.fail(self.clock.now_ms(), e.to_string(), e.kind());
                    trace.push_node(node);
                    failed_unit = Some(step.unit_id.clone());
                    self.cancel_outstanding(&mut trace, &mut in_flight);
                    break 'steps;
                }
            };

            let is_cold_start = self.units.mark_invoked(&unit.id)?;
            let strategy = call_strategy(groups, parent_id.as_deref(), &unit.id);
            let source_region = parent_id.as_deref().and_then(|p| self.units.region_of(p)).unwrap_or_else(|| unit.region.clone());

            let request = InvocationRequest {
                unit: unit.clone(),
                input: Value::Object(context.clone()),
                source_region,
                is_remote: strategy == Strategy::Remote,
                is_cold_start,
                payload_size_kb: self.payload_size_kb,
            };

            let mut node = ExecutionTraceNode::new(&unit.id, parent_id, strategy, step.kind);
            node.start(self.clock.now_ms());
            trace.push_node(node);

            match step.kind {
                CallMode::Sync => {
                    let timeout = Duration::from_millis(unit.timeout_ms.max(0) as u64);
                    let outcome = tokio::time::timeout(timeout, self.invoker.invoke(request)).await;
                    let now = self.clock.now_ms();
                    let node = trace.node_mut(&unit.id).expect("node was just pushed");
                    match outcome {
                        Ok(Ok(value)) => {
                            node.complete(now, value.clone());
                            context.insert(unit.id.clone(), value);
                        }
                        Ok(Err(e)) => {
                            log::warn!("Sync unit '{}' failed: {}", unit.id, e);
                            node.fail(now, e.to_string(), e.kind());
                            failed_unit = Some(unit.id.clone());
                            self.cancel_outstanding(&mut trace, &mut in_flight);
                            break 'steps;
                        }
                        Err(_) => {
                            let e = Error::Timeout { unit_id: unit.id.clone(), timeout_ms: unit.timeout_ms };
                            log::warn!("{}", e);
                            node.fail(now, e.to_string(), e.kind());
                            failed_unit = Some(unit.id.clone());
                            self.cancel_outstanding(&mut trace, &mut in_flight);
                            break 'steps;
                        }
                    }
                }
                CallMode::Async => {
                    let invoker = Arc::clone(&self.invoker);
                    let unit_id = unit.id.clone();
                    let timeout_ms = unit.timeout_ms;
                    let handle = tokio::spawn(async move {
                        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
                        match tokio::time::timeout(timeout, invoker.invoke(request)).await {
                            Ok(result) => result,
                            Err(_) => Err(Error::Timeout { unit_id, timeout_ms }),
                        }
                    });
                    in_flight.insert(unit.id.clone(), handle);
                }
            }
        }

        // Join whatever is still outstanding at plan end.
        if failed_unit.is_none() {
            let mut remaining: Vec<String> = in_flight.keys().cloned().collect();
            remaining.sort();
            for unit_id in remaining {
                if let Some(handle) = in_flight.remove(&unit_id) {
                    if self.join_async(&mut trace, &mut context, &unit_id, handle, &critical).await {
                        failed_unit = Some(unit_id);
                        self.cancel_outstanding(&mut trace, &mut in_flight);
                        break;
                    }
                }
            }
        }

        let now = self.clock.now_ms();
        if failed_unit.is_some() {
            trace.fail(now);
        } else {
            trace.complete(now);
        }

        let response = FusionResponse {
            trace_id: trace.trace_id.clone(),
            status: trace.status,
            result: Value::Object(context),
            errors: trace.errors.clone(),
            failed_unit,
            duration_ms: trace.duration_ms,
        };
        self.traces.upsert(trace);
        Ok(response)
    }

    /// Joins one in-flight async invocation. Returns `true` when the
    /// failure is fatal to the whole trace (the unit sits on the declared
    /// synchronous critical path).
    async fn join_async(
        &self,
        trace: &mut ExecutionTrace,
        context: &mut Map<String, Value>,
        unit_id: &str,
        handle: JoinHandle<Result<Value>>,
        critical: &HashSet<String>,
    ) -> bool {
        let joined = handle.await;
        let now = self.clock.now_ms();
        let Some(node) = trace.node_mut(unit_id) else {
            log::error!("In-flight unit '{}' has no trace node", unit_id);
            return false;
        };

        let error = match joined {
            Ok(Ok(value)) => {
                node.complete(now, value.clone());
                context.insert(unit_id.to_string(), value);
                return false;
            }
            Ok(Err(e)) => e,
            Err(join_error) => Error::ExecutionError { unit_id: unit_id.to_string(), cause: join_error.to_string() },
        };

        node.fail(now, error.to_string(), error.kind());
        if critical.contains(unit_id) {
            log::warn!("Async unit '{}' on the critical path failed: {}", unit_id, error);
            true
        } else {
            log::debug!("Async unit '{}' failed off the critical path: {}", unit_id, error);
            trace.errors.push(error.to_string());
            false
        }
    }

    /// Best-effort cancellation of every outstanding async handle; failures
    /// to cancel are logged, never propagated.
    fn cancel_outstanding(&self, trace: &mut ExecutionTrace, in_flight: &mut HashMap<String, JoinHandle<Result<Value>>>) {
        let now = self.clock.now_ms();
        for (unit_id, handle) in in_flight.drain() {
            handle.abort();
            log::warn!("Cancelled outstanding async invocation of unit '{}'", unit_id);
            if let Some(node) = trace.node_mut(&unit_id) {
                node.fail(now, "cancelled after trace abort".to_string(), "execution_error");
            }
        }
    }
}

/// The running input context: JSON objects are merged key by key, anything
/// else starts the context under an `input` key.
fn initial_context(input: Value) -> Map<String, Value> {
    match input {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

/// A call is local when caller and callee share a fusion group. Entry steps
/// have no caller and always run locally.
fn call_strategy(groups: &[FusionGroup], parent_id: Option<&str>, unit_id: &str) -> Strategy {
    let Some(parent_id) = parent_id else {
        return Strategy::Local;
    };
    match group_of(groups, unit_id) {
        Some(group) if group.contains(parent_id) => Strategy::Local,
        Some(_) => Strategy::Remote,
        None => Strategy::Remote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_is_local_within_a_group() {
        let groups = vec![FusionGroup::new(vec!["a".to_string(), "b".to_string()]), FusionGroup::singleton("c")];
        assert_eq!(call_strategy(&groups, None, "a"), Strategy::Local);
        assert_eq!(call_strategy(&groups, Some("a"), "b"), Strategy::Local);
        assert_eq!(call_strategy(&groups, Some("b"), "c"), Strategy::Remote);
    }

    #[test]
    fn non_object_input_is_wrapped() {
        let context = initial_context(serde_json::json!(42));
        assert_eq!(context.get("input"), Some(&serde_json::json!(42)));
    }

    #[test]
    fn declared_chain_plan_drives_default_execution() {
        let fusion = Fusion::new("f", vec!["a".to_string(), "b".to_string()]).with_edge_mode("b", CallMode::Async);
        let plan = ExecutionPlan::from_declared_chain(&fusion);
        assert_eq!(plan.steps[0].kind, CallMode::Sync);
        assert_eq!(plan.steps[1].kind, CallMode::Async);
    }
}
