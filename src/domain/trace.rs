use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use uuid::Uuid;

use crate::domain::fusion::CallMode;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
}

/// Deployment strategy observed for one call: inside the caller's group or
/// across a group boundary.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Local,
    Remote,
}

/// One unit's participation in one invocation.
///
/// State machine: `pending -> running -> {completed, failed}`. `running` is
/// entered at most once; the terminal transition sets `duration_ms` exactly
/// once as `ended_at_ms - started_at_ms`. Invalid transitions are logged and
/// ignored rather than panicking.
#[derive(Serialize, Debug, Clone)]
pub struct ExecutionTraceNode {
    pub unit_id: String,
    pub parent_id: Option<String>,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub duration_ms: i64,
    pub status: NodeStatus,
    pub strategy: Strategy,
    pub mode: CallMode,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl ExecutionTraceNode {
    pub fn new(unit_id: impl Into<String>, parent_id: Option<String>, strategy: Strategy, mode: CallMode) -> ExecutionTraceNode {
        ExecutionTraceNode {
            unit_id: unit_id.into(),
            parent_id,
            started_at_ms: 0,
            ended_at_ms: 0,
            duration_ms: 0,
            status: NodeStatus::Pending,
            strategy,
            mode,
            result: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn start(&mut self, now_ms: i64) {
        if self.status != NodeStatus::Pending {
            log::warn!("Ignoring re-entrant start of trace node '{}' in state {:?}", self.unit_id, self.status);
            return;
        }
        self.started_at_ms = now_ms;
        self.status = NodeStatus::Running;
    }

    pub fn complete(&mut self, now_ms: i64, result: serde_json::Value) {
        if self.status != NodeStatus::Running {
            log::warn!("Ignoring completion of trace node '{}' in state {:?}", self.unit_id, self.status);
            return;
        }
        self.ended_at_ms = now_ms;
        self.duration_ms = self.ended_at_ms - self.started_at_ms;
        self.result = Some(result);
        self.status = NodeStatus::Completed;
    }

    pub fn fail(&mut self, now_ms: i64, error: String, error_kind: &'static str) {
        if self.status != NodeStatus::Running {
            log::warn!("Ignoring failure of trace node '{}' in state {:?}", self.unit_id, self.status);
            return;
        }
        self.ended_at_ms = now_ms;
        self.duration_ms = self.ended_at_ms - self.started_at_ms;
        self.error = Some(error);
        self.error_kind = Some(error_kind.to_string());
        self.status = NodeStatus::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, NodeStatus::Completed | NodeStatus::Failed)
    }
}

/// One invocation of one fusion.
///
/// Created when the invocation starts, mutated only by the execution engine
/// and read-only to the optimizers. Nodes are kept in execution order and
/// addressable by unit id.
#[derive(Serialize, Debug, Clone)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub fusion_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub duration_ms: i64,
    pub status: TraceStatus,
    pub nodes: Vec<ExecutionTraceNode>,

    /// Non-fatal errors collected from async nodes.
    pub errors: Vec<String>,
}

impl ExecutionTrace {
    pub fn new(fusion_id: impl Into<String>, now_ms: i64) -> ExecutionTrace {
        ExecutionTrace {
            trace_id: Uuid::new_v4().to_string(),
            fusion_id: fusion_id.into(),
            started_at_ms: now_ms,
            ended_at_ms: 0,
            duration_ms: 0,
            status: TraceStatus::Running,
            nodes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn push_node(&mut self, node: ExecutionTraceNode) {
        self.nodes.push(node);
    }

    pub fn node(&self, unit_id: &str) -> Option<&ExecutionTraceNode> {
        self.nodes.iter().find(|n| n.unit_id == unit_id)
    }

    pub fn node_mut(&mut self, unit_id: &str) -> Option<&mut ExecutionTraceNode> {
        self.nodes.iter_mut().find(|n| n.unit_id == unit_id)
    }

    pub fn complete(&mut self, now_ms: i64) {
        if self.status != TraceStatus::Running {
            log::warn!("Ignoring completion of trace '{}' in state {:?}", self.trace_id, self.status);
            return;
        }
        self.ended_at_ms = now_ms;
        self.duration_ms = self.ended_at_ms - self.started_at_ms;
        self.status = TraceStatus::Completed;
    }

    pub fn fail(&mut self, now_ms: i64) {
        if self.status != TraceStatus::Running {
            log::warn!("Ignoring failure of trace '{}' in state {:?}", self.trace_id, self.status);
            return;
        }
        self.ended_at_ms = now_ms;
        self.duration_ms = self.ended_at_ms - self.started_at_ms;
        self.status = TraceStatus::Failed;
    }
}

/// Concurrent trace store: multiple fusions may execute at the same time,
/// so insertion and reads must not exclude each other longer than the map
/// operation itself.
#[derive(Debug, Default)]
pub struct TraceRegistry {
    traces: RwLock<HashMap<String, ExecutionTrace>>,
}

impl TraceRegistry {
    pub fn new() -> TraceRegistry {
        TraceRegistry::default()
    }

    /// Inserts or replaces the snapshot for a trace id.
    pub fn upsert(&self, trace: ExecutionTrace) {
        let mut traces = self.traces.write().expect("trace registry lock poisoned");
        traces.insert(trace.trace_id.clone(), trace);
    }

    pub fn get(&self, trace_id: &str) -> Option<ExecutionTrace> {
        let traces = self.traces.read().expect("trace registry lock poisoned");
        traces.get(trace_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.traces.read().expect("trace registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all traces for one fusion, most recent last.
    pub fn for_fusion(&self, fusion_id: &str) -> Vec<ExecutionTrace> {
        let traces = self.traces.read().expect("trace registry lock poisoned");
        let mut matching: Vec<ExecutionTrace> = traces.values().filter(|t| t.fusion_id == fusion_id).cloned().collect();
        matching.sort_by_key(|t| t.started_at_ms);
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_duration_is_set_once_on_terminal_transition() {
        let mut node = ExecutionTraceNode::new("a", None, Strategy::Local, CallMode::Sync);
        assert_eq!(node.status, NodeStatus::Pending);

        node.start(100);
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.duration_ms, 0);

        node.complete(340, serde_json::json!({"ok": true}));
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.duration_ms, 240);

        // Terminal states are final; a late failure must not rewrite timing.
        node.fail(900, "late".to_string(), "execution_error");
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.duration_ms, 240);
    }

    #[test]
    fn running_is_entered_only_once() {
        let mut node = ExecutionTraceNode::new("a", None, Strategy::Local, CallMode::Sync);
        node.start(10);
        node.start(99);
        assert_eq!(node.started_at_ms, 10);
    }

    #[test]
    fn failed_node_records_error_kind() {
        let mut node = ExecutionTraceNode::new("b", Some("a".to_string()), Strategy::Remote, CallMode::Async);
        node.start(5);
        node.fail(25, "boom".to_string(), "timeout");
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.duration_ms, 20);
        assert_eq!(node.error_kind.as_deref(), Some("timeout"));
    }

    #[test]
    fn registry_supports_upsert_and_fusion_snapshot() {
        let registry = TraceRegistry::new();
        let mut t1 = ExecutionTrace::new("f", 10);
        let t2 = ExecutionTrace::new("f", 20);
        let other = ExecutionTrace::new("g", 15);

        registry.upsert(t1.clone());
        registry.upsert(t2.clone());
        registry.upsert(other);

        t1.complete(50);
        registry.upsert(t1.clone());

        assert_eq!(registry.len(), 3);
        let snapshot = registry.for_fusion("f");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].trace_id, t1.trace_id);
        assert_eq!(snapshot[0].status, TraceStatus::Completed);
    }
}
