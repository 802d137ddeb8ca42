use std::collections::HashMap;

use crate::domain::fusion::CallMode;
use crate::domain::trace::ExecutionTrace;

/// Aggregated observation for one (caller, callee) pair.
///
/// Built fresh from a batch of traces each optimization cycle; the counts
/// are never carried across cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRelation {
    pub caller: String,
    pub callee: String,
    pub call_count: u64,
    pub sync_count: u64,
    pub async_count: u64,
}

impl CallRelation {
    /// Dominant classification: sync only when the sync observations
    /// strictly outnumber the async ones.
    pub fn dominant_mode(&self) -> CallMode {
        if self.sync_count > self.async_count { CallMode::Sync } else { CallMode::Async }
    }
}

/// Turns raw execution history into the aggregated caller -> callee
/// relation set. Nodes without a parent (chain entry points) contribute no
/// relation.
pub fn extract_call_relations(traces: &[ExecutionTrace]) -> Vec<CallRelation> {
    let mut relations: HashMap<(String, String), CallRelation> = HashMap::new();

    for trace in traces {
        for node in &trace.nodes {
            let Some(parent_id) = &node.parent_id else {
                continue;
            };
            let key = (parent_id.clone(), node.unit_id.clone());
            let relation = relations.entry(key).or_insert_with(|| CallRelation {
                caller: parent_id.clone(),
                callee: node.unit_id.clone(),
                call_count: 0,
                sync_count: 0,
                async_count: 0,
            });
            relation.call_count += 1;
            match node.mode {
                CallMode::Sync => relation.sync_count += 1,
                CallMode::Async => relation.async_count += 1,
            }
        }
    }

    let mut result: Vec<CallRelation> = relations.into_values().collect();
    result.sort_by(|a, b| (a.caller.as_str(), a.callee.as_str()).cmp(&(b.caller.as_str(), b.callee.as_str())));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trace::{ExecutionTraceNode, Strategy};

    fn trace_with_chain(fusion_id: &str, edges: &[(&str, Option<&str>, CallMode)]) -> ExecutionTrace {
        let mut trace = ExecutionTrace::new(fusion_id, 0);
        for (unit, parent, mode) in edges {
            let mut node = ExecutionTraceNode::new(*unit, parent.map(str::to_string), Strategy::Local, *mode);
            node.start(0);
            node.complete(1, serde_json::json!({}));
            trace.push_node(node);
        }
        trace.complete(10);
        trace
    }

    #[test]
    fn relations_are_aggregated_across_traces() {
        let traces = vec![
            trace_with_chain("f", &[("a", None, CallMode::Sync), ("b", Some("a"), CallMode::Sync), ("c", Some("b"), CallMode::Async)]),
            trace_with_chain("f", &[("a", None, CallMode::Sync), ("b", Some("a"), CallMode::Async), ("c", Some("b"), CallMode::Async)]),
            trace_with_chain("f", &[("a", None, CallMode::Sync), ("b", Some("a"), CallMode::Sync), ("c", Some("b"), CallMode::Async)]),
        ];

        let relations = extract_call_relations(&traces);
        assert_eq!(relations.len(), 2);

        let ab = &relations[0];
        assert_eq!((ab.caller.as_str(), ab.callee.as_str()), ("a", "b"));
        assert_eq!(ab.call_count, 3);
        assert_eq!(ab.sync_count, 2);
        assert_eq!(ab.async_count, 1);
        assert_eq!(ab.dominant_mode(), CallMode::Sync);

        let bc = &relations[1];
        assert_eq!(bc.call_count, 3);
        assert_eq!(bc.dominant_mode(), CallMode::Async);
    }

    #[test]
    fn tie_classifies_as_async() {
        let traces = vec![
            trace_with_chain("f", &[("a", None, CallMode::Sync), ("b", Some("a"), CallMode::Sync)]),
            trace_with_chain("f", &[("a", None, CallMode::Sync), ("b", Some("a"), CallMode::Async)]),
        ];
        let relations = extract_call_relations(&traces);
        assert_eq!(relations[0].dominant_mode(), CallMode::Async);
    }
}
