//! Graph compilation and Kahn's-order execution.
//!
//! Generalizes a round-based multi-participant drive loop (fixed round
//! order, per-turn event emission) from a flat sequence into an arbitrary
//! DAG with a real topological sort and branch-aware skip propagation.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::zerg::domain::{Edge, Node, NodeExecutionState, NodeId, NodePhase, NodeType, OutputEnvelope, Run, RunStatus, Workflow};
use crate::zerg::error::ZergError;
use crate::zerg::event::{Event, EventBus};
use crate::zerg::store::Store;
use crate::zerg::workflow::nodes::{execute_node, NodeExecCtx, NodeOutcome};
use crate::zerg::workflow::state::WorkflowState;

/// A [`Workflow`] after validation, indexed for execution.
pub struct CompiledWorkflow {
    nodes: HashMap<NodeId, Node>,
    outgoing: HashMap<NodeId, Vec<Edge>>,
    incoming: HashMap<NodeId, Vec<Edge>>,
    topo_order: Vec<NodeId>,
}

/// Validate `workflow` and compute its execution order.
///
/// Checks performed: no duplicate node ids, every edge endpoint exists,
/// trigger nodes have no incoming edges, every conditional node has exactly
/// two outgoing edges labeled `true`/`false`, the graph is acyclic, and every
/// node is reachable from some trigger node.
pub fn compile(workflow: &Workflow) -> Result<CompiledWorkflow, ZergError> {
    let mut nodes = HashMap::new();
    for node in &workflow.nodes {
        if nodes.insert(node.id.clone(), node.clone()).is_some() {
            return Err(ZergError::validation(format!("duplicate node id: {}", node.id)));
        }
    }

    let mut outgoing: HashMap<NodeId, Vec<Edge>> = HashMap::new();
    let mut incoming: HashMap<NodeId, Vec<Edge>> = HashMap::new();
    for edge in &workflow.edges {
        if !nodes.contains_key(&edge.from) {
            return Err(ZergError::validation(format!("edge references unknown node: {}", edge.from)));
        }
        if !nodes.contains_key(&edge.to) {
            return Err(ZergError::validation(format!("edge references unknown node: {}", edge.to)));
        }
        outgoing.entry(edge.from.clone()).or_default().push(edge.clone());
        incoming.entry(edge.to.clone()).or_default().push(edge.clone());
    }

    for node in nodes.values() {
        if node.node_type == NodeType::Trigger && incoming.contains_key(&node.id) {
            return Err(ZergError::validation(format!("trigger node {} has incoming edges", node.id)));
        }
        if node.node_type == NodeType::Conditional {
            let out = outgoing.get(&node.id).cloned().unwrap_or_default();
            let mut branches: HashSet<&str> = HashSet::new();
            for edge in &out {
                match edge.branch.as_deref() {
                    Some("true") | Some("false") => {
                        branches.insert(edge.branch.as_deref().unwrap());
                    }
                    _ => {
                        return Err(ZergError::validation(format!(
                            "conditional node {} has an edge without a true/false branch label",
                            node.id
                        )))
                    }
                }
            }
            if out.len() != 2 || branches.len() != 2 {
                return Err(ZergError::validation(format!(
                    "conditional node {} must have exactly two outgoing edges labeled true/false",
                    node.id
                )));
            }
        }
    }

    let topo_order = topological_sort(&nodes, &incoming, &outgoing)?;

    let trigger_ids: Vec<NodeId> =
        nodes.values().filter(|n| n.node_type == NodeType::Trigger).map(|n| n.id.clone()).collect();
    if trigger_ids.is_empty() {
        return Err(ZergError::validation("workflow has no trigger node"));
    }
    let reachable = reachable_from(&trigger_ids, &outgoing);
    for node_id in nodes.keys() {
        if !reachable.contains(node_id) {
            return Err(ZergError::validation(format!("node {node_id} is unreachable from any trigger")));
        }
    }

    Ok(CompiledWorkflow { nodes, outgoing, incoming, topo_order })
}

fn topological_sort(
    nodes: &HashMap<NodeId, Node>,
    incoming: &HashMap<NodeId, Vec<Edge>>,
    outgoing: &HashMap<NodeId, Vec<Edge>>,
) -> Result<Vec<NodeId>, ZergError> {
    let mut indegree: HashMap<NodeId, usize> =
        nodes.keys().map(|id| (id.clone(), incoming.get(id).map(|v| v.len()).unwrap_or(0))).collect();

    let mut queue: VecDeque<NodeId> =
        indegree.iter().filter(|(_, &deg)| deg == 0).map(|(id, _)| id.clone()).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node_id) = queue.pop_front() {
        order.push(node_id.clone());
        for edge in outgoing.get(&node_id).map(|v| v.as_slice()).unwrap_or(&[]) {
            let deg = indegree.get_mut(&edge.to).expect("edge target must exist");
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(edge.to.clone());
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(ZergError::validation("workflow graph contains a cycle"));
    }
    Ok(order)
}

fn reachable_from(roots: &[NodeId], outgoing: &HashMap<NodeId, Vec<Edge>>) -> HashSet<NodeId> {
    let mut seen: HashSet<NodeId> = roots.iter().cloned().collect();
    let mut queue: VecDeque<NodeId> = roots.iter().cloned().collect();
    while let Some(node_id) = queue.pop_front() {
        for edge in outgoing.get(&node_id).map(|v| v.as_slice()).unwrap_or(&[]) {
            if seen.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }
    seen
}

/// Dependencies an execution pass needs beyond the compiled graph itself.
pub struct ExecutionDeps<'a> {
    pub store: &'a (dyn Store),
    pub event_bus: &'a EventBus,
    pub node_ctx_factory: &'a (dyn Fn() -> NodeExecCtx<'a> + Sync),
}

/// Result of driving a compiled workflow to completion (or cancellation).
pub struct ExecutionResult {
    pub status: RunStatus,
    pub state: WorkflowState,
}

/// Execute `compiled` for `run`, publishing `node_state` after each node and
/// persisting its [`NodeExecutionState`]. `cancel` is polled cooperatively
/// between nodes, never interrupting a node already in flight.
pub async fn execute(
    compiled: &CompiledWorkflow,
    run: &Run,
    deps: &ExecutionDeps<'_>,
    cancel: &AtomicBool,
) -> Result<ExecutionResult, ZergError> {
    let mut state = WorkflowState::new();
    let mut phases: HashMap<NodeId, NodePhase> = compiled.nodes.keys().map(|id| (id.clone(), NodePhase::Pending)).collect();
    let mut selected_branch: HashMap<NodeId, bool> = HashMap::new();
    let mut any_failed = false;

    for node_id in &compiled.topo_order {
        let node = &compiled.nodes[node_id];

        if cancel.load(Ordering::SeqCst) {
            mark_skipped(&mut phases, &mut state, deps, run, node_id, "user").await?;
            continue;
        }

        let incoming = compiled.incoming.get(node_id).cloned().unwrap_or_default();
        if is_node_skipped(&incoming, &phases, &selected_branch) {
            mark_skipped(&mut phases, &mut state, deps, run, node_id, "predecessor_skipped").await?;
            continue;
        }

        phases.insert(node_id.clone(), NodePhase::Running);
        emit_node_state(deps, run, node_id, NodePhase::Running, None, None).await?;

        let ctx = (deps.node_ctx_factory)();
        let outcome = execute_node(&node.config, &state, &ctx).await;

        match outcome {
            NodeOutcome::Succeeded(envelope) => {
                if node.node_type == NodeType::Conditional {
                    selected_branch.insert(node_id.clone(), envelope.value.as_bool().unwrap_or(false));
                }
                phases.insert(node_id.clone(), NodePhase::Succeeded);
                emit_node_state(deps, run, node_id, NodePhase::Succeeded, Some(envelope.clone()), None).await?;
                state.record(node_id.clone(), envelope);
            }
            NodeOutcome::Failed(message) => {
                any_failed = true;
                if state.error.is_none() {
                    state.error = Some(message.clone());
                }
                phases.insert(node_id.clone(), NodePhase::Failed);
                emit_node_state(deps, run, node_id, NodePhase::Failed, None, Some(message)).await?;
            }
        }
    }

    let status = if any_failed { RunStatus::Failed } else { RunStatus::Success };
    Ok(ExecutionResult { status, state })
}

fn is_node_skipped(
    incoming: &[Edge],
    phases: &HashMap<NodeId, NodePhase>,
    selected_branch: &HashMap<NodeId, bool>,
) -> bool {
    if incoming.is_empty() {
        return false;
    }
    incoming.iter().all(|edge| {
        let source_phase = phases.get(&edge.from).copied().unwrap_or(NodePhase::Pending);
        let source_active = match source_phase {
            NodePhase::Succeeded => match &edge.branch {
                Some(branch) => {
                    let selected = selected_branch.get(&edge.from).copied().unwrap_or(true);
                    (branch == "true") == selected
                }
                None => true,
            },
            _ => false,
        };
        !source_active
    })
}

async fn mark_skipped(
    phases: &mut HashMap<NodeId, NodePhase>,
    state: &mut WorkflowState,
    deps: &ExecutionDeps<'_>,
    run: &Run,
    node_id: &NodeId,
    _cancel_reason: &str,
) -> Result<(), ZergError> {
    phases.insert(node_id.clone(), NodePhase::Skipped);
    state.completed_nodes.push(node_id.clone());
    emit_node_state(deps, run, node_id, NodePhase::Skipped, None, None).await
}

async fn emit_node_state(
    deps: &ExecutionDeps<'_>,
    run: &Run,
    node_id: &NodeId,
    phase: NodePhase,
    envelope: Option<OutputEnvelope>,
    error: Option<String>,
) -> Result<(), ZergError> {
    let now = Utc::now();
    deps.store
        .record_node_state(NodeExecutionState {
            run_id: run.id,
            node_id: node_id.clone(),
            phase,
            output: envelope.clone(),
            error: error.clone(),
            started_at: Some(now),
            finished_at: if phase.is_terminal() { Some(now) } else { None },
        })
        .await?;

    deps.event_bus.publish(Event::NodeState {
        run_id: run.id,
        node_id: node_id.clone(),
        phase: format!("{phase:?}").to_lowercase(),
        envelope: envelope.map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null)),
        error,
    });
    Ok(())
}

impl NodePhase {
    fn is_terminal(self) -> bool {
        matches!(self, NodePhase::Succeeded | NodePhase::Failed | NodePhase::Skipped)
    }
}

/// Shared cancellation flag for an in-flight workflow run.
pub fn new_cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zerg::domain::{NodeConfig, NodeLayout};

    fn node(id: &str, node_type: NodeType, config: NodeConfig) -> Node {
        Node { id: id.to_string(), node_type, config, layout: NodeLayout { x: 0.0, y: 0.0 } }
    }

    fn edge(from: &str, to: &str, branch: Option<&str>) -> Edge {
        Edge { from: from.to_string(), to: to.to_string(), branch: branch.map(|b| b.to_string()) }
    }

    fn trigger_id() -> uuid::Uuid {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn compile_rejects_cycles() {
        let workflow = Workflow {
            id: uuid::Uuid::new_v4(),
            owner_id: uuid::Uuid::new_v4(),
            name: "cyclic".into(),
            nodes: vec![
                node("t", NodeType::Trigger, NodeConfig::Trigger { trigger_id: trigger_id() }),
                node("a", NodeType::Tool, NodeConfig::Tool { tool_name: "x".into(), arguments_template: serde_json::json!({}) }),
                node("b", NodeType::Tool, NodeConfig::Tool { tool_name: "y".into(), arguments_template: serde_json::json!({}) }),
            ],
            edges: vec![edge("t", "a", None), edge("a", "b", None), edge("b", "a", None)],
        };
        assert!(compile(&workflow).is_err());
    }

    #[test]
    fn compile_rejects_unreachable_node() {
        let workflow = Workflow {
            id: uuid::Uuid::new_v4(),
            owner_id: uuid::Uuid::new_v4(),
            name: "orphan".into(),
            nodes: vec![
                node("t", NodeType::Trigger, NodeConfig::Trigger { trigger_id: trigger_id() }),
                node("a", NodeType::Tool, NodeConfig::Tool { tool_name: "x".into(), arguments_template: serde_json::json!({}) }),
                node("orphan", NodeType::Tool, NodeConfig::Tool { tool_name: "z".into(), arguments_template: serde_json::json!({}) }),
            ],
            edges: vec![edge("t", "a", None)],
        };
        assert!(compile(&workflow).is_err());
    }

    #[test]
    fn compile_rejects_conditional_without_both_branches() {
        let workflow = Workflow {
            id: uuid::Uuid::new_v4(),
            owner_id: uuid::Uuid::new_v4(),
            name: "bad-cond".into(),
            nodes: vec![
                node("t", NodeType::Trigger, NodeConfig::Trigger { trigger_id: trigger_id() }),
                node("c", NodeType::Conditional, NodeConfig::Conditional { expression: "1 == 1".into() }),
                node("a", NodeType::Tool, NodeConfig::Tool { tool_name: "x".into(), arguments_template: serde_json::json!({}) }),
            ],
            edges: vec![edge("t", "c", None), edge("c", "a", Some("true"))],
        };
        assert!(compile(&workflow).is_err());
    }

    #[test]
    fn compile_accepts_valid_branching_graph() {
        let workflow = Workflow {
            id: uuid::Uuid::new_v4(),
            owner_id: uuid::Uuid::new_v4(),
            name: "valid".into(),
            nodes: vec![
                node("t", NodeType::Trigger, NodeConfig::Trigger { trigger_id: trigger_id() }),
                node("c", NodeType::Conditional, NodeConfig::Conditional { expression: "1 == 1".into() }),
                node("a", NodeType::Tool, NodeConfig::Tool { tool_name: "x".into(), arguments_template: serde_json::json!({}) }),
                node("b", NodeType::Tool, NodeConfig::Tool { tool_name: "y".into(), arguments_template: serde_json::json!({}) }),
            ],
            edges: vec![
                edge("t", "c", None),
                edge("c", "a", Some("true")),
                edge("c", "b", Some("false")),
            ],
        };
        let compiled = compile(&workflow).unwrap();
        assert_eq!(compiled.topo_order.first().unwrap(), "t");
    }

    #[test]
    fn skip_logic_passes_through_succeeded_branch_only() {
        let mut phases = HashMap::new();
        phases.insert("c".to_string(), NodePhase::Succeeded);
        let mut selected = HashMap::new();
        selected.insert("c".to_string(), true);

        let taken = vec![edge("c", "a", Some("true"))];
        let not_taken = vec![edge("c", "b", Some("false"))];

        assert!(!is_node_skipped(&taken, &phases, &selected));
        assert!(is_node_skipped(&not_taken, &phases, &selected));
    }
}
