use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whether a caller blocks on the callee's result before proceeding.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Sync,
    Async,
}

/// A declared fusion: an ordered chain of unit ids plus per-edge call modes.
///
/// Edges without a declared mode default to synchronous, which matches the
/// behavior of a plain sequential chain.
#[derive(Debug, Clone)]
pub struct Fusion {
    pub id: String,
    pub chain: Vec<String>,

    /// Call mode of the edge *into* the keyed unit.
    pub edge_modes: HashMap<String, CallMode>,
}

impl Fusion {
    pub fn new(id: impl Into<String>, chain: Vec<String>) -> Fusion {
        Fusion { id: id.into(), chain, edge_modes: HashMap::new() }
    }

    pub fn with_edge_mode(mut self, callee: impl Into<String>, mode: CallMode) -> Fusion {
        self.edge_modes.insert(callee.into(), mode);
        self
    }

    pub fn mode_of(&self, callee: &str) -> CallMode {
        self.edge_modes.get(callee).copied().unwrap_or(CallMode::Sync)
    }
}

/// A non-empty set of units deployed together.
///
/// Calls between members are "local"; calls crossing a group boundary are
/// "remote". The active configuration keeps groups disjoint, so every unit
/// belongs to exactly one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionGroup {
    pub members: Vec<String>,
}

impl FusionGroup {
    pub fn new(members: Vec<String>) -> FusionGroup {
        let mut deduped: Vec<String> = Vec::with_capacity(members.len());
        for member in members {
            if !deduped.contains(&member) {
                deduped.push(member);
            }
        }
        FusionGroup { members: deduped }
    }

    pub fn singleton(member: impl Into<String>) -> FusionGroup {
        FusionGroup { members: vec![member.into()] }
    }

    /// Canonical key: members sorted and joined by `.`.
    pub fn key(&self) -> String {
        let mut sorted = self.members.clone();
        sorted.sort();
        sorted.join(".")
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.members.iter().any(|m| m == unit_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Canonical setup key for a whole partition: group keys joined by `,`.
pub fn setup_string(groups: &[FusionGroup]) -> String {
    groups.iter().map(|g| g.key()).collect::<Vec<_>>().join(",")
}

/// Parses a canonical setup string back into its partition.
pub fn parse_setup_string(setup: &str) -> Result<Vec<FusionGroup>> {
    if setup.is_empty() {
        return Err(Error::ModelConstructionError("Setup string is empty".to_string()));
    }
    let mut groups = Vec::new();
    for group_part in setup.split(',') {
        let members: Vec<String> = group_part.split('.').filter(|m| !m.is_empty()).map(str::to_string).collect();
        if members.is_empty() {
            return Err(Error::ModelConstructionError(format!("Setup string contains an empty group: '{}'", setup)));
        }
        groups.push(FusionGroup::new(members));
    }
    Ok(groups)
}

/// Returns the group a unit belongs to, treating a unit missing from the
/// partition as a singleton group of its own.
pub fn group_of<'a>(groups: &'a [FusionGroup], unit_id: &str) -> Option<&'a FusionGroup> {
    groups.iter().find(|g| g.contains(unit_id))
}

/// Process-scoped fusion table.
#[derive(Debug, Default)]
pub struct FusionRegistry {
    fusions: RwLock<HashMap<String, Fusion>>,
}

impl FusionRegistry {
    pub fn new() -> FusionRegistry {
        FusionRegistry::default()
    }

    pub fn register(&self, fusion: Fusion) {
        let mut fusions = self.fusions.write().expect("fusion registry lock poisoned");
        if fusions.insert(fusion.id.clone(), fusion).is_some() {
            log::warn!("Fusion registered twice, replacing previous definition.");
        }
    }

    pub fn get(&self, fusion_id: &str) -> Result<Fusion> {
        let fusions = self.fusions.read().expect("fusion registry lock poisoned");
        fusions.get(fusion_id).cloned().ok_or_else(|| Error::UnknownFusion(fusion_id.to_string()))
    }

    pub fn contains(&self, fusion_id: &str) -> bool {
        self.fusions.read().expect("fusion registry lock poisoned").contains_key(fusion_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.fusions.read().expect("fusion registry lock poisoned").keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_sorts_members() {
        let group = FusionGroup::new(vec!["c".to_string(), "a".to_string(), "b".to_string()]);
        assert_eq!(group.key(), "a.b.c");
    }

    #[test]
    fn setup_string_round_trip() {
        let canonical = "a.b,c,d.e.f";
        let groups = parse_setup_string(canonical).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(setup_string(&groups), canonical);
    }

    #[test]
    fn parse_rejects_empty_setup() {
        assert!(parse_setup_string("").is_err());
        assert!(parse_setup_string("a.b,,c").is_err());
    }

    #[test]
    fn edge_mode_defaults_to_sync() {
        let fusion = Fusion::new("f", vec!["a".to_string(), "b".to_string()]).with_edge_mode("b", CallMode::Async);
        assert_eq!(fusion.mode_of("a"), CallMode::Sync);
        assert_eq!(fusion.mode_of("b"), CallMode::Async);
    }
}
