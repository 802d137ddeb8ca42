use serde_json::json;

use fusion_sim::FusionRuntime;
use fusion_sim::domain::continuous::ContinuousConfig;
use fusion_sim::domain::fusion::{CallMode, Fusion};
use fusion_sim::domain::optimizer::OptimizerConfig;
use fusion_sim::domain::planner::PlannerConfig;
use fusion_sim::domain::trace::TraceStatus;
use fusion_sim::domain::unit::{Unit, WorkloadClass};
use fusion_sim::error::Error;

fn runtime() -> FusionRuntime {
    let config = OptimizerConfig { planner: PlannerConfig { seed: Some(17), ..PlannerConfig::default() }, ..OptimizerConfig::default() };
    FusionRuntime::new(config, ContinuousConfig::default())
}

fn unit(id: &str) -> Unit {
    Unit::new(id, 256, 5_000, "eu-central-1", WorkloadClass::Cpu)
}

async fn replay(runtime: &FusionRuntime, fusion_id: &str, times: usize) {
    for _ in 0..times {
        let response = runtime.invoke(fusion_id, json!({})).await.unwrap();
        assert_eq!(response.status, TraceStatus::Completed);
    }
}

#[tokio::test]
async fn observed_history_drives_group_formation() {
    let runtime = runtime();
    for id in ["extract", "transform", "publish"] {
        runtime.register_unit(unit(id));
    }
    runtime
        .register_fusion(
            Fusion::new("etl", vec!["extract".to_string(), "transform".to_string(), "publish".to_string()])
                .with_edge_mode("publish", CallMode::Async),
        )
        .unwrap();

    replay(&runtime, "etl", 3).await;

    let record = runtime.optimize_now("etl").expect("optimization should run");
    assert!(record.changed);

    // Sync-dominant edge merges extract/transform; the async tail stays
    // a singleton.
    let result = runtime.active_configuration("etl").unwrap();
    assert!(!result.is_noop);
    assert_eq!(result.setup_key, "extract.transform,publish");
    assert_eq!(record.setup_key, result.setup_key);

    // The selected memory sizes were applied to the fleet.
    for id in ["extract", "transform", "publish"] {
        let selected = result.memory_of(&result.groups, id).unwrap();
        assert_eq!(runtime.units().get(id).unwrap().memory_mb, selected);
    }
}

#[tokio::test]
async fn cached_plan_drives_subsequent_invocations() {
    let runtime = runtime();
    for id in ["a", "b", "c"] {
        runtime.register_unit(unit(id));
    }
    runtime
        .register_fusion(Fusion::new("f", vec!["a".to_string(), "b".to_string(), "c".to_string()]).with_edge_mode("c", CallMode::Async))
        .unwrap();

    replay(&runtime, "f", 2).await;
    runtime.optimize_now("f").unwrap();
    let plan = runtime.active_configuration("f").unwrap().plan;
    assert_eq!(plan.steps.len(), 3);

    let response = runtime.invoke("f", json!({})).await.unwrap();
    assert_eq!(response.status, TraceStatus::Completed);
    // The async tail is joined at plan end; its result still lands in the
    // merged output.
    assert!(response.result.as_object().unwrap().contains_key("c"));
    let trace = runtime.trace(&response.trace_id).unwrap();
    assert_eq!(trace.nodes.len(), 3);
}

#[tokio::test]
async fn repeated_optimization_reports_stability() {
    let runtime = runtime();
    for id in ["a", "b"] {
        runtime.register_unit(unit(id));
    }
    runtime.register_fusion(Fusion::new("f", vec!["a".to_string(), "b".to_string()])).unwrap();

    replay(&runtime, "f", 2).await;

    let first = runtime.optimize_now("f").unwrap();
    assert!(first.changed);

    let second = runtime.optimize_now("f").unwrap();
    assert!(!second.changed);
    assert_eq!(second.estimated_savings_ms, 0.0);
    assert_eq!(runtime.optimization_history().len(), 2);
}

#[tokio::test]
async fn fusion_referencing_unknown_unit_is_rejected() {
    let runtime = runtime();
    runtime.register_unit(unit("a"));

    let err = runtime.register_fusion(Fusion::new("f", vec!["a".to_string(), "ghost".to_string()])).unwrap_err();
    assert!(matches!(err, Error::UnitNotFound(id) if id == "ghost"));
    assert!(!runtime.fusions().contains("f"));
}
