use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::domain::clock::SharedClock;
use crate::error::{Error, Result};

/// Default idle window after which a unit invocation counts as a cold start.
pub const DEFAULT_COLD_START_WINDOW_MS: i64 = 300_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClass {
    Cpu,
    Memory,
    Io,
}

/// Descriptor of a single I/O operation a unit performs per invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IoOperation {
    pub kind: String,
    pub size_kb: f64,
}

/// A registered callable compute unit.
///
/// Mutated only by the registry: `last_invoked_ms` on every invocation
/// (cold-start detection) and `memory_mb` when the resource optimizer
/// adopts a new configuration.
#[derive(Debug, Clone)]
pub struct Unit {
    pub id: String,
    pub memory_mb: i64,
    pub timeout_ms: i64,
    pub region: String,
    pub workload_class: WorkloadClass,
    pub io_operations: Vec<IoOperation>,
    pub last_invoked_ms: Option<i64>,
}

impl Unit {
    pub fn new(id: impl Into<String>, memory_mb: i64, timeout_ms: i64, region: impl Into<String>, workload_class: WorkloadClass) -> Unit {
        Unit {
            id: id.into(),
            memory_mb,
            timeout_ms,
            region: region.into(),
            workload_class,
            io_operations: Vec::new(),
            last_invoked_ms: None,
        }
    }
}

/// Process-scoped unit table with concurrent read access.
///
/// Lock discipline: every accessor clones out of the guard; no estimator or
/// invoker call is ever made while the lock is held.
#[derive(Debug)]
pub struct UnitRegistry {
    units: RwLock<HashMap<String, Unit>>,
    clock: SharedClock,
    cold_start_window_ms: i64,
}

impl UnitRegistry {
    pub fn new(clock: SharedClock) -> UnitRegistry {
        UnitRegistry { units: RwLock::new(HashMap::new()), clock, cold_start_window_ms: DEFAULT_COLD_START_WINDOW_MS }
    }

    pub fn with_cold_start_window(clock: SharedClock, cold_start_window_ms: i64) -> UnitRegistry {
        UnitRegistry { units: RwLock::new(HashMap::new()), clock, cold_start_window_ms }
    }

    pub fn register(&self, unit: Unit) {
        let mut units = self.units.write().expect("unit registry lock poisoned");
        if units.insert(unit.id.clone(), unit).is_some() {
            log::warn!("Unit registered twice, replacing previous definition.");
        }
    }

    pub fn get(&self, unit_id: &str) -> Result<Unit> {
        let units = self.units.read().expect("unit registry lock poisoned");
        units.get(unit_id).cloned().ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        let units = self.units.read().expect("unit registry lock poisoned");
        units.contains_key(unit_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let units = self.units.read().expect("unit registry lock poisoned");
        units.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.units.read().expect("unit registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Region lookup for the communication phase.
    pub fn region_of(&self, unit_id: &str) -> Option<String> {
        let units = self.units.read().expect("unit registry lock poisoned");
        units.get(unit_id).map(|u| u.region.clone())
    }

    /// Applies a memory size selected by the resource optimizer.
    pub fn set_memory(&self, unit_id: &str, memory_mb: i64) -> Result<()> {
        let mut units = self.units.write().expect("unit registry lock poisoned");
        let unit = units.get_mut(unit_id).ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))?;
        if unit.memory_mb != memory_mb {
            log::debug!("Unit '{}' memory updated: {} MB -> {} MB", unit_id, unit.memory_mb, memory_mb);
            unit.memory_mb = memory_mb;
        }
        Ok(())
    }

    /// Stamps the unit as invoked now and reports whether this invocation
    /// is a cold start (first ever, or idle longer than the window).
    pub fn mark_invoked(&self, unit_id: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut units = self.units.write().expect("unit registry lock poisoned");
        let unit = units.get_mut(unit_id).ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))?;
        let is_cold = match unit.last_invoked_ms {
            Some(last) => now - last > self.cold_start_window_ms,
            None => true,
        };
        unit.last_invoked_ms = Some(now);
        Ok(is_cold)
    }
}
