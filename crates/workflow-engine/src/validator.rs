//! `ValidateWorkflow` — structural validity (spec.md §3) plus per-node
//! config validation, plus a non-blocking warnings pass (SPEC_FULL.md §5,
//! supplemental feature #1: unreachable-node warnings, grounded on the
//! teacher's `WorkflowValidator` distinguishing hard errors from advice).

use common::types::{NodeConfig, Workflow};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct WorkflowValidator;

impl WorkflowValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, workflow: &Workflow) -> ValidationResult {
        let mut result = ValidationResult::default();

        if workflow.nodes.is_empty() {
            result.errors.push("workflow has no nodes".to_string());
            return result;
        }

        let mut seen_ids = HashSet::new();
        for node in &workflow.nodes {
            if !seen_ids.insert(node.id.clone()) {
                result.errors.push(format!("duplicate node id: {}", node.id));
            }
        }

        let node_ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
        for node in &workflow.nodes {
            for (label, target) in [("on_success", &node.on_success), ("on_failure", &node.on_failure)] {
                if let Some(target_id) = target {
                    if !target_id.is_empty() && !node_ids.contains(target_id.as_str()) {
                        result.errors.push(format!(
                            "node {} {} references unknown node: {}",
                            node.id, label, target_id
                        ));
                    }
                }
            }
            if let Err(e) = validate_node_config(&node.config) {
                result.errors.push(format!("node {} config invalid: {e}", node.id));
            }
        }

        if !result.errors.is_empty() {
            return result;
        }

        if let Some(cycle_node) = detect_cycle(workflow) {
            result.errors.push(format!(
                "cycle detected reachable from entry node at: {cycle_node}"
            ));
            return result;
        }

        let unreachable = find_unreachable(workflow);
        if !unreachable.is_empty() {
            result
                .warnings
                .push(format!("unreachable nodes (never reached from entry): {unreachable:?}"));
        }

        result
    }
}

impl Default for WorkflowValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_node_config(config: &NodeConfig) -> Result<(), String> {
    match config {
        NodeConfig::Http { url, .. } => {
            if url.trim().is_empty() {
                return Err("HTTP node requires a non-empty url".to_string());
            }
        }
        NodeConfig::Switch { field, .. } => {
            if field.trim().is_empty() {
                return Err("SWITCH node requires a non-empty field".to_string());
            }
        }
        NodeConfig::Transform { mappings } => {
            if mappings.is_empty() {
                return Err("TRANSFORM node requires at least one mapping".to_string());
            }
        }
        NodeConfig::Loop { iterate_over, item_var, body_node, max_iterations, .. } => {
            if iterate_over.trim().is_empty() {
                return Err("LOOP node requires a non-empty iterate_over expression".to_string());
            }
            if item_var.trim().is_empty() {
                return Err("LOOP node requires a non-empty item_var".to_string());
            }
            if body_node.trim().is_empty() {
                return Err("LOOP node requires a body_node".to_string());
            }
            if *max_iterations > common::types::MAX_LOOP_ITERATIONS {
                return Err(format!(
                    "LOOP max_iterations {max_iterations} exceeds the hard cap of {}",
                    common::types::MAX_LOOP_ITERATIONS
                ));
            }
        }
        NodeConfig::Validate { schema, .. } => {
            if schema.is_empty() {
                return Err("VALIDATE node requires a non-empty schema".to_string());
            }
        }
        NodeConfig::Delay { duration_ms, duration, duration_seconds } => {
            let set_count = [duration_ms.is_some(), duration.is_some(), duration_seconds.is_some()]
                .iter()
                .filter(|b| **b)
                .count();
            if set_count != 1 {
                return Err("DELAY node requires exactly one of duration_ms/duration/duration_seconds".to_string());
            }
        }
        NodeConfig::AiAgent { provider, model, system_prompt, temperature, max_tokens, .. } => {
            if provider.trim().is_empty() || model.trim().is_empty() || system_prompt.trim().is_empty() {
                return Err("AI_AGENT node requires provider, model, and system_prompt".to_string());
            }
            if let Some(t) = temperature {
                if !(0.0..=2.0).contains(t) {
                    return Err(format!("AI_AGENT temperature {t} must be within [0, 2]"));
                }
            }
            if let Some(mt) = max_tokens {
                if *mt == 0 {
                    return Err("AI_AGENT max_tokens must be greater than 0".to_string());
                }
            }
        }
        NodeConfig::Condition { field, .. } => {
            if field.trim().is_empty() {
                return Err("CONDITION node requires a non-empty field".to_string());
            }
        }
        NodeConfig::Action { .. } => {}
        NodeConfig::SendMessage { channel_id, recipient_id, .. } => {
            if channel_id.trim().is_empty() || recipient_id.trim().is_empty() {
                return Err("SEND_MESSAGE node requires channel_id and recipient_id".to_string());
            }
        }
    }
    Ok(())
}

/// DFS cycle detection reachable from the entry node, walking
/// `on_success`/`on_failure` edges as the graph's adjacency (spec.md §3
/// invariant). Returns the id of the first node found already on the
/// current DFS stack.
fn detect_cycle(workflow: &Workflow) -> Option<String> {
    let Some(entry) = workflow.entry_node() else {
        return None;
    };
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    dfs_cycle(workflow, &entry.id, &mut visited, &mut stack)
}

fn dfs_cycle(
    workflow: &Workflow,
    node_id: &str,
    visited: &mut HashSet<String>,
    stack: &mut HashSet<String>,
) -> Option<String> {
    if stack.contains(node_id) {
        return Some(node_id.to_string());
    }
    if visited.contains(node_id) {
        return None;
    }
    visited.insert(node_id.to_string());
    stack.insert(node_id.to_string());

    if let Some(node) = workflow.find_node(node_id) {
        for next in [&node.on_success, &node.on_failure] {
            if let Some(next_id) = next {
                if !next_id.is_empty() {
                    if let Some(cycle) = dfs_cycle(workflow, next_id, visited, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        // SWITCH cases are reachable edges too, even though the executor
        // only follows them at runtime via `__next_node`.
        if let NodeConfig::Switch { cases, default, .. } = &node.config {
            for target in cases.values().chain(default.iter()) {
                if let Some(cycle) = dfs_cycle(workflow, target, visited, stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.remove(node_id);
    None
}

fn find_unreachable(workflow: &Workflow) -> Vec<String> {
    let Some(entry) = workflow.entry_node() else {
        return Vec::new();
    };
    let mut reached = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(entry.id.clone());
    reached.insert(entry.id.clone());

    while let Some(id) = queue.pop_front() {
        let Some(node) = workflow.find_node(&id) else { continue };
        let mut neighbors: Vec<String> = [&node.on_success, &node.on_failure]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        if let NodeConfig::Switch { cases, default, .. } = &node.config {
            neighbors.extend(cases.values().cloned());
            neighbors.extend(default.iter().cloned());
        }
        if let NodeConfig::Loop { body_node, .. } = &node.config {
            neighbors.push(body_node.clone());
        }
        for next in neighbors {
            if reached.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }

    workflow
        .nodes
        .iter()
        .map(|n| n.id.clone())
        .filter(|id| !reached.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{ActionConfig, NodeConfig, TriggerType, WorkflowNode, WorkflowTrigger};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn node(id: &str, on_success: Option<&str>) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            name: id.to_string(),
            config: NodeConfig::Action {
                action: ActionConfig::ConsoleLog { message: serde_json::json!("x") },
            },
            on_success: on_success.map(|s| s.to_string()),
            on_failure: None,
            timeout: None,
        }
    }

    fn workflow(nodes: Vec<WorkflowNode>) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "w".to_string(),
            description: None,
            trigger: WorkflowTrigger { trigger_type: TriggerType::Manual, filters: HashMap::new() },
            nodes,
            is_active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn rejects_empty_workflow() {
        let wf = workflow(vec![]);
        let result = WorkflowValidator::new().validate(&wf);
        assert!(!result.is_valid());
    }

    #[test]
    fn rejects_dangling_edge() {
        let wf = workflow(vec![node("n1", Some("missing"))]);
        let result = WorkflowValidator::new().validate(&wf);
        assert!(!result.is_valid());
    }

    #[test]
    fn rejects_cycle() {
        let wf = workflow(vec![node("n1", Some("n2")), node("n2", Some("n1"))]);
        let result = WorkflowValidator::new().validate(&wf);
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn accepts_simple_linear_workflow() {
        let wf = workflow(vec![node("n1", Some("n2")), node("n2", None)]);
        let result = WorkflowValidator::new().validate(&wf);
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn warns_on_unreachable_node() {
        let wf = workflow(vec![node("n1", None), node("n2", None)]);
        let result = WorkflowValidator::new().validate(&wf);
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }
}
