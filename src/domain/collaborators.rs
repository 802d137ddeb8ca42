use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::domain::unit::{Unit, WorkloadClass};
use crate::error::{Error, Result};

/// Everything the invocation collaborator needs to run one unit once.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub unit: Unit,
    pub input: Value,
    pub source_region: String,
    pub is_remote: bool,
    pub is_cold_start: bool,
    pub payload_size_kb: f64,
}

/// Invocation collaborator. Unit bodies are opaque external code; the core
/// never inspects them beyond this capability.
#[async_trait]
pub trait UnitInvoker: std::fmt::Debug + Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value>;
}

/// Cost/performance estimator collaborator.
///
/// Treated as potentially slow; callers must not hold a registry lock
/// across these calls.
pub trait CostEstimator: std::fmt::Debug + Send + Sync {
    fn estimate_duration_ms(
        &self,
        base_time_ms: f64,
        memory_mb: i64,
        is_remote: bool,
        is_cold_start: bool,
        payload_size_kb: f64,
        workload_class: WorkloadClass,
    ) -> f64;

    fn estimate_cost(&self, memory_mb: i64, duration_ms: f64, is_billable: bool) -> f64;
}

/// Network estimator collaborator for cross-region hops.
pub trait NetworkEstimator: std::fmt::Debug + Send + Sync {
    fn estimate_latency_ms(&self, source_region: &str, target_region: &str, payload_size_kb: f64) -> f64;

    fn should_fail(&self, source_region: &str, target_region: &str) -> bool;
}

/// Memory scaling reference point: estimators treat 1024 MB as the neutral
/// allocation.
const REFERENCE_MEMORY_MB: f64 = 1024.0;

/// Default simulated cost model.
///
/// Duration shrinks with allocated memory (bounded so tiny allocations do
/// not explode), grows with payload size and remote/cold-start overheads.
#[derive(Debug, Clone)]
pub struct SimulatedCostEstimator {
    pub cold_start_penalty_ms: f64,
    pub remote_overhead_ms: f64,
    pub transfer_ms_per_kb: f64,
    pub price_per_gb_second: f64,
}

impl Default for SimulatedCostEstimator {
    fn default() -> Self {
        SimulatedCostEstimator {
            cold_start_penalty_ms: 400.0,
            remote_overhead_ms: 25.0,
            transfer_ms_per_kb: 0.05,
            price_per_gb_second: 0.000_016_666_7,
        }
    }
}

impl CostEstimator for SimulatedCostEstimator {
    fn estimate_duration_ms(
        &self,
        base_time_ms: f64,
        memory_mb: i64,
        is_remote: bool,
        is_cold_start: bool,
        payload_size_kb: f64,
        workload_class: WorkloadClass,
    ) -> f64 {
        let memory_factor = (REFERENCE_MEMORY_MB / memory_mb.max(1) as f64).clamp(0.25, 8.0);

        // Memory-bound work profits most from larger allocations, io-bound
        // work barely at all.
        let scaling_share = match workload_class {
            WorkloadClass::Cpu => 0.7,
            WorkloadClass::Memory => 0.9,
            WorkloadClass::Io => 0.2,
        };
        let scaled = base_time_ms * (1.0 - scaling_share) + base_time_ms * scaling_share * memory_factor;

        let mut duration = scaled + payload_size_kb * self.transfer_ms_per_kb;
        if is_remote {
            duration += self.remote_overhead_ms;
        }
        if is_cold_start {
            duration += self.cold_start_penalty_ms;
        }
        duration
    }

    fn estimate_cost(&self, memory_mb: i64, duration_ms: f64, is_billable: bool) -> f64 {
        if !is_billable {
            return 0.0;
        }
        let gb = memory_mb.max(1) as f64 / 1024.0;
        gb * (duration_ms / 1000.0) * self.price_per_gb_second
    }
}

/// Default simulated network model with a fixed inter-region penalty and an
/// explicit set of failing region pairs (deterministic for tests).
#[derive(Debug, Clone)]
pub struct SimulatedNetworkEstimator {
    pub same_region_latency_ms: f64,
    pub cross_region_latency_ms: f64,
    pub transfer_ms_per_kb: f64,
    failing_pairs: HashSet<(String, String)>,
}

impl Default for SimulatedNetworkEstimator {
    fn default() -> Self {
        SimulatedNetworkEstimator {
            same_region_latency_ms: 2.0,
            cross_region_latency_ms: 80.0,
            transfer_ms_per_kb: 0.08,
            failing_pairs: HashSet::new(),
        }
    }
}

impl SimulatedNetworkEstimator {
    pub fn with_failing_pair(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.failing_pairs.insert((source.into(), target.into()));
        self
    }
}

impl NetworkEstimator for SimulatedNetworkEstimator {
    fn estimate_latency_ms(&self, source_region: &str, target_region: &str, payload_size_kb: f64) -> f64 {
        let base = if source_region == target_region { self.same_region_latency_ms } else { self.cross_region_latency_ms };
        base + payload_size_kb * self.transfer_ms_per_kb
    }

    fn should_fail(&self, source_region: &str, target_region: &str) -> bool {
        self.failing_pairs.contains(&(source_region.to_string(), target_region.to_string()))
    }
}

/// Default invoker: sleeps a scaled-down share of the estimated duration and
/// echoes the unit id in its output payload.
#[derive(Debug, Clone)]
pub struct SimulatedInvoker {
    cost: Arc<dyn CostEstimator>,
    network: Arc<dyn NetworkEstimator>,

    /// Baseline handler time fed into the cost estimator.
    pub base_time_ms: f64,

    /// Fraction of the estimated duration actually slept. Zero disables
    /// sleeping entirely (unit tests).
    pub sleep_scale: f64,
}

impl SimulatedInvoker {
    pub fn new(cost: Arc<dyn CostEstimator>, network: Arc<dyn NetworkEstimator>) -> SimulatedInvoker {
        SimulatedInvoker { cost, network, base_time_ms: 120.0, sleep_scale: 0.01 }
    }

    pub fn with_sleep_scale(mut self, sleep_scale: f64) -> SimulatedInvoker {
        self.sleep_scale = sleep_scale;
        self
    }
}

#[async_trait]
impl UnitInvoker for SimulatedInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value> {
        let unit = &request.unit;

        if request.is_remote && self.network.should_fail(&request.source_region, &unit.region) {
            return Err(Error::NetworkFailure { source_region: request.source_region.clone(), target_region: unit.region.clone() });
        }

        let mut duration_ms = self.cost.estimate_duration_ms(
            self.base_time_ms,
            unit.memory_mb,
            request.is_remote,
            request.is_cold_start,
            request.payload_size_kb,
            unit.workload_class,
        );
        if request.is_remote {
            duration_ms += self.network.estimate_latency_ms(&request.source_region, &unit.region, request.payload_size_kb);
        }
        for io_op in &unit.io_operations {
            duration_ms += io_op.size_kb * 0.1;
        }

        if self.sleep_scale > 0.0 {
            tokio::time::sleep(Duration::from_millis((duration_ms * self.sleep_scale) as u64)).await;
        }

        Ok(json!({
            "unit": unit.id,
            "output": format!("{}-output", unit.id),
            "simulatedDurationMs": duration_ms,
            "coldStart": request.is_cold_start,
        }))
    }
}
