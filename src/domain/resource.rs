use crate::domain::collaborators::CostEstimator;
use crate::domain::fusion::FusionGroup;
use crate::domain::unit::WorkloadClass;

/// Discrete memory catalogue searched per fusion group, in MB.
pub const DEFAULT_MEMORY_CATALOGUE: [i64; 8] = [128, 256, 512, 1024, 2048, 3072, 4096, 6144];

/// Memory size preferred by the estimator-free fallback heuristic.
const FALLBACK_TARGET_MB: i64 = 1024;

/// Relative weighting of speed against cost. Normalized to sum to 1 before
/// use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceWeights {
    pub latency: f64,
    pub cost: f64,
}

impl Default for ResourceWeights {
    fn default() -> Self {
        ResourceWeights { latency: 0.5, cost: 0.5 }
    }
}

impl ResourceWeights {
    pub fn normalized(self) -> ResourceWeights {
        let sum = self.latency + self.cost;
        if sum <= 0.0 {
            log::warn!("Resource weights sum to {}, falling back to 0.5/0.5", sum);
            return ResourceWeights::default();
        }
        ResourceWeights { latency: self.latency / sum, cost: self.cost / sum }
    }
}

/// Chosen memory size for one group, with the score components that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySelection {
    pub group_key: String,
    pub memory_mb: i64,
    pub speed_factor: f64,
    pub cost_factor: f64,
    pub score: f64,
    pub estimated_duration_ms: f64,
    pub estimated_cost: f64,
}

/// **Infrastructure phase:** searches the memory catalogue for one group.
///
/// Every candidate is scored as
/// `latency_weight * speed_factor + cost_weight * cost_factor`, where the
/// speed factor rises with allocated memory relative to the catalogue
/// maximum and the cost factor is inversely proportional to allocated
/// memory relative to the catalogue minimum. Ties go to the smaller size.
/// Without an estimator the search degrades to the heuristic of picking
/// the catalogue entry closest to 1024 MB.
pub fn select_memory(
    group: &FusionGroup,
    catalogue: &[i64],
    weights: ResourceWeights,
    estimator: Option<&dyn CostEstimator>,
    base_time_ms: f64,
    workload_class: WorkloadClass,
) -> Option<MemorySelection> {
    if catalogue.is_empty() || group.is_empty() {
        return None;
    }

    let group_key = group.key();

    let Some(estimator) = estimator else {
        let memory_mb = catalogue.iter().copied().min_by_key(|mb| (mb - FALLBACK_TARGET_MB).abs()).expect("catalogue is non-empty");
        log::debug!("No cost estimator supplied; group '{}' falls back to {} MB", group_key, memory_mb);
        return Some(MemorySelection {
            group_key,
            memory_mb,
            speed_factor: 0.0,
            cost_factor: 0.0,
            score: 0.0,
            estimated_duration_ms: 0.0,
            estimated_cost: 0.0,
        });
    };

    let weights = weights.normalized();
    let max_mb = *catalogue.iter().max().expect("catalogue is non-empty") as f64;
    let min_mb = *catalogue.iter().min().expect("catalogue is non-empty") as f64;

    // Group-level base time scales with the number of co-located units.
    let group_base_time_ms = base_time_ms * group.len() as f64;

    let mut best: Option<MemorySelection> = None;
    for &memory_mb in catalogue {
        let estimated_duration_ms = estimator.estimate_duration_ms(group_base_time_ms, memory_mb, false, false, 0.0, workload_class);
        let estimated_cost = estimator.estimate_cost(memory_mb, estimated_duration_ms, true);

        let speed_factor = memory_mb as f64 / max_mb;
        let cost_factor = min_mb / memory_mb as f64;
        let score = weights.latency * speed_factor + weights.cost * cost_factor;

        let candidate = MemorySelection { group_key: group_key.clone(), memory_mb, speed_factor, cost_factor, score, estimated_duration_ms, estimated_cost };

        let replace = match &best {
            None => true,
            Some(current) => {
                candidate.score > current.score || (candidate.score == current.score && candidate.memory_mb < current.memory_mb)
            }
        };
        if replace {
            best = Some(candidate);
        }
    }

    best
}

/// Runs the memory search across a whole partition.
pub fn optimize_memory(
    groups: &[FusionGroup],
    catalogue: &[i64],
    weights: ResourceWeights,
    estimator: Option<&dyn CostEstimator>,
    base_time_ms: f64,
    workload_of: impl Fn(&str) -> WorkloadClass,
) -> Vec<MemorySelection> {
    groups
        .iter()
        .filter_map(|group| {
            // Dominant workload class across the group's members.
            let class = dominant_workload_class(group, &workload_of);
            select_memory(group, catalogue, weights, estimator, base_time_ms, class)
        })
        .collect()
}

fn dominant_workload_class(group: &FusionGroup, workload_of: &impl Fn(&str) -> WorkloadClass) -> WorkloadClass {
    let mut counts = [0usize; 3];
    for member in &group.members {
        match workload_of(member) {
            WorkloadClass::Cpu => counts[0] += 1,
            WorkloadClass::Memory => counts[1] += 1,
            WorkloadClass::Io => counts[2] += 1,
        }
    }
    if counts[1] > counts[0] && counts[1] >= counts[2] {
        WorkloadClass::Memory
    } else if counts[2] > counts[0] && counts[2] > counts[1] {
        WorkloadClass::Io
    } else {
        WorkloadClass::Cpu
    }
}
