use std::collections::HashMap;

use union_find::{QuickUnionUf, UnionBySize, UnionFind};

use crate::domain::call_pattern::CallRelation;
use crate::domain::fusion::{CallMode, FusionGroup};

/// Total ordering of all chain units respecting observed dependencies.
///
/// When a cycle prevents a full topological peel, the unordered remainder
/// keeps its original chain order and `cycle_present` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologicalOrder {
    pub order: Vec<String>,
    pub cycle_present: bool,
}

/// **Path optimization phase:** merges units connected by dominant-sync
/// relations into shared fusion groups.
///
/// Starts with every unit in its own singleton set and unions across each
/// dominant-sync relation via a Disjoint Set Union keyed by unit index.
/// The returned partition covers every input unit exactly once; group order
/// follows the first appearance of each group's representative in
/// `unit_ids`.
pub fn build_fusion_groups(unit_ids: &[String], relations: &[CallRelation]) -> Vec<FusionGroup> {
    if unit_ids.is_empty() {
        return Vec::new();
    }

    // 1. Map String ids to usize indices for the DSU crate
    let mut unit_id_to_index: HashMap<&str, usize> = HashMap::with_capacity(unit_ids.len());
    for (index, id) in unit_ids.iter().enumerate() {
        unit_id_to_index.insert(id.as_str(), index);
    }

    // 2. Initialize the DSU structure and union across dominant-sync edges
    let mut dsu = QuickUnionUf::<UnionBySize>::new(unit_ids.len());
    for relation in relations {
        if relation.dominant_mode() != CallMode::Sync {
            continue;
        }
        if let (Some(&caller_index), Some(&callee_index)) =
            (unit_id_to_index.get(relation.caller.as_str()), unit_id_to_index.get(relation.callee.as_str()))
        {
            dsu.union(caller_index, callee_index);
        } else {
            log::warn!("Relation references unit outside the chain: {} -> {}", relation.caller, relation.callee);
        }
    }

    // 3. Collect members per representative, preserving chain order
    let mut members_by_rep: HashMap<usize, Vec<String>> = HashMap::new();
    let mut rep_order: Vec<usize> = Vec::new();
    for (index, unit_id) in unit_ids.iter().enumerate() {
        let rep = dsu.find(index);
        let members = members_by_rep.entry(rep).or_insert_with(|| {
            rep_order.push(rep);
            Vec::new()
        });
        if !members.contains(unit_id) {
            members.push(unit_id.clone());
        }
    }

    rep_order
        .into_iter()
        .map(|rep| FusionGroup::new(members_by_rep.remove(&rep).expect("representative must have members")))
        .collect()
}

/// Kahn-style in-degree elimination over the dependency edges (callee runs
/// after caller).
///
/// Units with no remaining incoming edges are peeled in discovery order;
/// discovery order is seeded by the original chain order, which doubles as
/// the tie-break for ambiguous orderings. Units stuck in a cycle are
/// appended in their original chain order.
pub fn topological_order(chain: &[String], relations: &[CallRelation]) -> TopologicalOrder {
    let mut in_degree: HashMap<&str, usize> = chain.iter().map(|id| (id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for relation in relations {
        let caller = relation.caller.as_str();
        let callee = relation.callee.as_str();
        if !in_degree.contains_key(caller) || !in_degree.contains_key(callee) {
            log::debug!("Skipping relation outside the chain: {} -> {}", caller, callee);
            continue;
        }
        let edges = successors.entry(caller).or_default();
        if !edges.contains(&callee) {
            edges.push(callee);
            *in_degree.get_mut(callee).expect("callee is in the chain") += 1;
        }
    }

    let mut queue: Vec<&str> = chain.iter().map(String::as_str).filter(|id| in_degree[*id] == 0).collect();
    let mut order: Vec<String> = Vec::with_capacity(chain.len());
    let mut cursor = 0;

    while cursor < queue.len() {
        let next = queue[cursor];
        cursor += 1;
        order.push(next.to_string());

        for &successor in successors.get(next).into_iter().flatten() {
            let degree = in_degree.get_mut(successor).expect("successor is in the chain");
            *degree -= 1;
            if *degree == 0 {
                queue.push(successor);
            }
        }
    }

    let cycle_present = order.len() < chain.len();
    if cycle_present {
        log::warn!("Cycle detected in call pattern; keeping original chain order for {} unordered unit(s)", chain.len() - order.len());
        for unit_id in chain {
            if !order.contains(unit_id) {
                order.push(unit_id.clone());
            }
        }
    }

    TopologicalOrder { order, cycle_present }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(caller: &str, callee: &str, sync: u64, asyn: u64) -> CallRelation {
        CallRelation {
            caller: caller.to_string(),
            callee: callee.to_string(),
            call_count: sync + asyn,
            sync_count: sync,
            async_count: asyn,
        }
    }

    fn chain(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sync_relations_merge_groups() {
        let units = chain(&["a", "b", "c", "d"]);
        let relations = vec![relation("a", "b", 5, 1), relation("b", "c", 1, 5), relation("c", "d", 3, 0)];

        let groups = build_fusion_groups(&units, &relations);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key(), "a.b");
        assert_eq!(groups[1].key(), "c.d");
    }

    #[test]
    fn partition_covers_every_unit_exactly_once() {
        let units = chain(&["a", "b", "c", "d", "e"]);
        let relations = vec![relation("a", "b", 2, 0), relation("d", "e", 4, 0), relation("b", "c", 0, 3)];

        let groups = build_fusion_groups(&units, &relations);
        let mut seen: Vec<&String> = groups.iter().flat_map(|g| g.members.iter()).collect();
        seen.sort();
        assert_eq!(seen, units.iter().collect::<Vec<_>>());
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let units = chain(&["c", "a", "b"]);
        let relations = vec![relation("a", "b", 1, 0), relation("b", "c", 1, 0)];

        let topo = topological_order(&units, &relations);
        assert!(!topo.cycle_present);
        assert_eq!(topo.order, chain(&["a", "b", "c"]));
    }

    #[test]
    fn cycle_keeps_original_relative_order() {
        let units = chain(&["a", "b", "c", "d"]);
        // b <-> c form a cycle; a and d stay orderable.
        let relations = vec![relation("a", "b", 1, 0), relation("b", "c", 1, 0), relation("c", "b", 1, 0), relation("c", "d", 1, 0)];

        let topo = topological_order(&units, &relations);
        assert!(topo.cycle_present);
        assert_eq!(topo.order.len(), units.len());
        assert_eq!(topo.order[0], "a");

        // Members of the cycle retain chain order: b before c.
        let b_pos = topo.order.iter().position(|u| u == "b").unwrap();
        let c_pos = topo.order.iter().position(|u| u == "c").unwrap();
        assert!(b_pos < c_pos);
    }

    #[test]
    fn full_cycle_returns_chain_order() {
        let units = chain(&["x", "y", "z"]);
        let relations = vec![relation("x", "y", 1, 0), relation("y", "z", 1, 0), relation("z", "x", 1, 0)];

        let topo = topological_order(&units, &relations);
        assert!(topo.cycle_present);
        assert_eq!(topo.order, units);
    }
}
