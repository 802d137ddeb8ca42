use serde_json::json;

use fusion_sim::FusionRuntime;
use fusion_sim::api::scenario_dto::ScenarioDto;
use fusion_sim::domain::continuous::ContinuousConfig;
use fusion_sim::domain::fusion::CallMode;
use fusion_sim::domain::optimizer::OptimizerConfig;
use fusion_sim::domain::trace::TraceStatus;
use fusion_sim::error::Error;
use fusion_sim::loader::parser::parse_json_file;

fn runtime() -> FusionRuntime {
    FusionRuntime::new(OptimizerConfig::default(), ContinuousConfig::default())
}

#[test]
fn scenario_file_parses_into_dtos() {
    let scenario: ScenarioDto = parse_json_file("src/data/scenario_thumbnail.json").unwrap();

    assert_eq!(scenario.units.len(), 3);
    assert_eq!(scenario.fusions.len(), 1);
    assert_eq!(scenario.fusions[0].chain, vec!["resize", "store", "notify"]);
    assert_eq!(scenario.workload[0].invocations, 5);
}

#[test]
fn missing_file_reports_io_error() {
    let err = parse_json_file::<ScenarioDto>("non_existent_file.json").unwrap_err();
    assert!(matches!(err, Error::IoError(_)));
}

#[tokio::test]
async fn loaded_scenario_is_invocable() {
    let scenario: ScenarioDto = parse_json_file("src/data/scenario_thumbnail.json").unwrap();
    let runtime = runtime();
    runtime.load_scenario(scenario).unwrap();

    assert_eq!(runtime.units().len(), 3);
    assert_eq!(runtime.fusions().get("thumbnail").unwrap().mode_of("notify"), CallMode::Async);

    let response = runtime.invoke("thumbnail", json!({ "image": "cat.png" })).await.unwrap();
    assert_eq!(response.status, TraceStatus::Completed);
}

#[test]
fn scenario_with_unknown_unit_is_rejected() {
    let scenario: ScenarioDto = parse_json_file("src/data/scenario_unknown_unit.json").unwrap();
    let runtime = runtime();

    let err = runtime.load_scenario(scenario).unwrap_err();
    assert!(matches!(err, Error::UnitNotFound(id) if id == "ghost"));
}
