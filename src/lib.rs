pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

use std::sync::Arc;

use serde_json::Value;

use crate::api::scenario_dto::ScenarioDto;
use crate::domain::clock::{SharedClock, SystemClock};
use crate::domain::collaborators::{CostEstimator, SimulatedCostEstimator, SimulatedInvoker, SimulatedNetworkEstimator, UnitInvoker};
use crate::domain::continuous::{ContinuousConfig, ContinuousOptimizer, RunRecord};
use crate::domain::engine::{ExecutionEngine, FusionResponse};
use crate::domain::fusion::{Fusion, FusionRegistry};
use crate::domain::optimizer::{OptimizationCache, OptimizationResult, Optimizer, OptimizerConfig};
use crate::domain::trace::{ExecutionTrace, TraceRegistry};
use crate::domain::unit::{Unit, UnitRegistry};
use crate::error::{Error, Result};

/// Top-level wiring of the simulator: registries, engine, optimizer and the
/// continuous control loop, sharing one clock.
#[derive(Debug)]
pub struct FusionRuntime {
    clock: SharedClock,
    units: Arc<UnitRegistry>,
    fusions: Arc<FusionRegistry>,
    traces: Arc<TraceRegistry>,
    cache: Arc<OptimizationCache>,
    engine: ExecutionEngine,
    continuous: Arc<ContinuousOptimizer>,
}

impl FusionRuntime {
    /// Runtime with the simulated collaborators and the system clock.
    pub fn new(optimizer_config: OptimizerConfig, continuous_config: ContinuousConfig) -> FusionRuntime {
        let cost: Arc<dyn CostEstimator> = Arc::new(SimulatedCostEstimator::default());
        let network = Arc::new(SimulatedNetworkEstimator::default());
        let invoker = Arc::new(SimulatedInvoker::new(cost.clone(), network));
        Self::with_collaborators(optimizer_config, continuous_config, SystemClock::shared(), invoker, Some(cost))
    }

    /// Full wiring for tests and alternative collaborators.
    pub fn with_collaborators(
        optimizer_config: OptimizerConfig,
        continuous_config: ContinuousConfig,
        clock: SharedClock,
        invoker: Arc<dyn UnitInvoker>,
        estimator: Option<Arc<dyn CostEstimator>>,
    ) -> FusionRuntime {
        let units = Arc::new(UnitRegistry::new(clock.clone()));
        let fusions = Arc::new(FusionRegistry::new());
        let traces = Arc::new(TraceRegistry::new());
        let cache = Arc::new(OptimizationCache::new(clock.clone(), optimizer_config.cache_ttl_ms));

        let optimizer = Arc::new(Optimizer::new(optimizer_config, clock.clone(), estimator));
        let engine = ExecutionEngine::new(units.clone(), fusions.clone(), traces.clone(), cache.clone(), invoker, clock.clone());
        let continuous = Arc::new(ContinuousOptimizer::new(
            continuous_config,
            clock.clone(),
            optimizer,
            units.clone(),
            fusions.clone(),
            traces.clone(),
            cache.clone(),
        ));

        FusionRuntime { clock, units, fusions, traces, cache, engine, continuous }
    }

    pub fn units(&self) -> &Arc<UnitRegistry> {
        &self.units
    }

    pub fn fusions(&self) -> &Arc<FusionRegistry> {
        &self.fusions
    }

    pub fn register_unit(&self, unit: Unit) {
        self.units.register(unit);
    }

    /// Registers a fusion after checking every chain member is a known unit.
    pub fn register_fusion(&self, fusion: Fusion) -> Result<()> {
        for unit_id in &fusion.chain {
            if !self.units.contains(unit_id) {
                return Err(Error::UnitNotFound(unit_id.clone()));
            }
        }
        self.fusions.register(fusion);
        Ok(())
    }

    /// Loads a whole scenario: units first, then the fusions referencing them.
    pub fn load_scenario(&self, scenario: ScenarioDto) -> Result<()> {
        for unit in scenario.units {
            self.register_unit(unit.into());
        }
        for fusion in scenario.fusions {
            self.register_fusion(fusion.into())?;
        }
        Ok(())
    }

    /// Invokes a fusion and feeds the observed latency back into the
    /// continuous optimizer's gates.
    pub async fn invoke(&self, fusion_id: &str, input: Value) -> Result<FusionResponse> {
        let response = self.engine.execute(fusion_id, input).await?;
        self.continuous.record_invocation(response.duration_ms as f64);
        Ok(response)
    }

    /// Fire-and-forget invocation running on its own task.
    pub fn invoke_detached(&self, fusion_id: impl Into<String>, input: Value) -> tokio::task::JoinHandle<Result<FusionResponse>> {
        let engine = self.engine.clone();
        let continuous = Arc::clone(&self.continuous);
        let fusion_id = fusion_id.into();
        tokio::spawn(async move {
            let response = engine.execute(&fusion_id, input).await?;
            continuous.record_invocation(response.duration_ms as f64);
            Ok(response)
        })
    }

    pub fn trace(&self, trace_id: &str) -> Option<ExecutionTrace> {
        self.traces.get(trace_id)
    }

    pub fn traces_for(&self, fusion_id: &str) -> Vec<ExecutionTrace> {
        self.traces.for_fusion(fusion_id)
    }

    /// Currently active optimization result, if one is cached and fresh.
    pub fn active_configuration(&self, fusion_id: &str) -> Option<OptimizationResult> {
        self.cache.get(fusion_id)
    }

    /// Runs the optimization phases now, bypassing the trigger gates.
    pub fn optimize_now(&self, fusion_id: &str) -> Option<RunRecord> {
        self.continuous.force(fusion_id)
    }

    pub fn optimization_history(&self) -> Vec<RunRecord> {
        self.continuous.history()
    }

    /// Starts the background control loop. Abort the handle to stop it.
    pub fn start_continuous(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.continuous).spawn()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}
