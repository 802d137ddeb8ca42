use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::domain::fusion::{CallMode, Fusion};
use crate::domain::unit::{IoOperation, Unit, WorkloadClass};

/// On-disk scenario: the unit fleet, the declared fusions and a synthetic
/// workload to replay against them.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDto {
    pub units: Vec<UnitDto>,
    pub fusions: Vec<FusionDto>,
    #[serde(default)]
    pub workload: Vec<WorkloadDto>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnitDto {
    pub id: String,
    pub memory_mb: i64,
    pub timeout_ms: i64,
    pub region: String,
    pub workload_class: WorkloadClassDto,
    #[serde(default)]
    pub io_operations: Vec<IoOperationDto>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClassDto {
    Cpu,
    Memory,
    Io,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IoOperationDto {
    pub kind: String,
    pub size_kb: f64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FusionDto {
    pub id: String,
    pub chain: Vec<String>,

    /// Call mode of the edge into the keyed unit; missing edges are sync.
    #[serde(default)]
    pub edges: HashMap<String, CallModeDto>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallModeDto {
    Sync,
    Async,
}

/// One replayed invocation batch of the synthetic workload.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDto {
    pub fusion_id: String,
    pub invocations: u64,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub payload_size_kb: Option<f64>,
}

impl From<WorkloadClassDto> for WorkloadClass {
    fn from(dto: WorkloadClassDto) -> WorkloadClass {
        match dto {
            WorkloadClassDto::Cpu => WorkloadClass::Cpu,
            WorkloadClassDto::Memory => WorkloadClass::Memory,
            WorkloadClassDto::Io => WorkloadClass::Io,
        }
    }
}

impl From<CallModeDto> for CallMode {
    fn from(dto: CallModeDto) -> CallMode {
        match dto {
            CallModeDto::Sync => CallMode::Sync,
            CallModeDto::Async => CallMode::Async,
        }
    }
}

impl From<UnitDto> for Unit {
    fn from(dto: UnitDto) -> Unit {
        Unit {
            id: dto.id,
            memory_mb: dto.memory_mb,
            timeout_ms: dto.timeout_ms,
            region: dto.region,
            workload_class: dto.workload_class.into(),
            io_operations: dto.io_operations.into_iter().map(|io| IoOperation { kind: io.kind, size_kb: io.size_kb }).collect(),
            last_invoked_ms: None,
        }
    }
}

impl From<FusionDto> for Fusion {
    fn from(dto: FusionDto) -> Fusion {
        Fusion {
            id: dto.id,
            chain: dto.chain,
            edge_modes: dto.edges.into_iter().map(|(callee, mode)| (callee, mode.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_deserializes_from_camel_case_json() {
        let raw = r#"{
            "units": [
                {"id": "resize", "memoryMb": 256, "timeoutMs": 3000, "region": "eu-central-1", "workloadClass": "cpu",
                 "ioOperations": [{"kind": "s3-put", "sizeKb": 512.0}]}
            ],
            "fusions": [
                {"id": "thumbnail", "chain": ["resize", "store"], "edges": {"store": "async"}}
            ],
            "workload": [
                {"fusionId": "thumbnail", "invocations": 25, "input": {"image": "cat.png"}}
            ]
        }"#;

        let scenario: ScenarioDto = serde_json::from_str(raw).unwrap();
        assert_eq!(scenario.units.len(), 1);
        assert_eq!(scenario.units[0].workload_class, WorkloadClassDto::Cpu);
        assert_eq!(scenario.units[0].io_operations[0].size_kb, 512.0);
        assert_eq!(scenario.fusions[0].edges.get("store"), Some(&CallModeDto::Async));
        assert_eq!(scenario.workload[0].invocations, 25);
    }

    #[test]
    fn dto_conversion_carries_edge_modes() {
        let dto = FusionDto {
            id: "f".to_string(),
            chain: vec!["a".to_string(), "b".to_string()],
            edges: HashMap::from([("b".to_string(), CallModeDto::Async)]),
        };
        let fusion: Fusion = dto.into();
        assert_eq!(fusion.mode_of("a"), CallMode::Sync);
        assert_eq!(fusion.mode_of("b"), CallMode::Async);
    }
}
