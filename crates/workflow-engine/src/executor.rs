//! Component C — `WorkflowExecutor`: `ValidateWorkflow`/`Execute`/
//! `ResumeFromNode` (spec.md §4.C).
//!
//! The main loop walks `on_success`/`on_failure` edges starting from the
//! entry node (or, on resume, from a continuation's `next_node_id`), capped
//! by a hop limit of `hop_limit_multiplier × |nodes|` to turn a cyclic graph
//! into a bounded-but-safe run rather than an infinite loop — the validator
//! already rejects cycles reachable from the entry node at definition time,
//! so this is defense in depth against any edge the validator doesn't see
//! (e.g. a SWITCH `next_node_override` the static graph analysis missed).

use crate::ai_node;
use crate::delay::parse_duration_string;
use crate::expression;
use crate::http_node;
use crate::nodes::{self, ChannelManager, NodeOutcome};
use crate::repos::ContinuationRepository;
use crate::validator::{ValidationResult, WorkflowValidator};
use ai_service::{AiProvider, ToolRegistry};
use chrono::Utc;
use common::error::WorkflowError;
use common::types::{
    Continuation, ExecutionContext, ExecutionResult, JsonValue, NodeConfig, NodeResult, Workflow,
    WorkflowNode,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct WorkflowExecutor {
    http_client: reqwest::Client,
    ai_provider: Arc<dyn AiProvider>,
    tool_registry: Option<ToolRegistry>,
    channel_manager: Arc<dyn ChannelManager>,
    continuation_repo: Arc<dyn ContinuationRepository>,
    validator: WorkflowValidator,
    hop_limit_multiplier: usize,
    sync_delay_threshold_secs: u64,
    max_delay_secs: u64,
}

impl WorkflowExecutor {
    pub fn new(
        ai_provider: Arc<dyn AiProvider>,
        tool_registry: Option<ToolRegistry>,
        channel_manager: Arc<dyn ChannelManager>,
        continuation_repo: Arc<dyn ContinuationRepository>,
        hop_limit_multiplier: usize,
        sync_delay_threshold_secs: u64,
        max_delay_secs: u64,
    ) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            ai_provider,
            tool_registry,
            channel_manager,
            continuation_repo,
            validator: WorkflowValidator::new(),
            hop_limit_multiplier,
            sync_delay_threshold_secs,
            max_delay_secs,
        }
    }

    pub fn validate_workflow(&self, workflow: &Workflow) -> ValidationResult {
        self.validator.validate(workflow)
    }

    /// Runs a workflow from its entry node with a fresh context seeded from
    /// the triggering payload.
    pub async fn execute(&self, workflow: &Workflow, trigger_payload: JsonValue) -> ExecutionResult {
        let validation = self.validate_workflow(workflow);
        if !validation.is_valid() {
            return ExecutionResult {
                success: false,
                output: None,
                executed_nodes: Vec::new(),
                error: Some(format!(
                    "workflow failed validation: {}",
                    validation.errors.join("; ")
                )),
            };
        }
        let Some(entry) = workflow.entry_node() else {
            return ExecutionResult {
                success: false,
                output: None,
                executed_nodes: Vec::new(),
                error: Some(WorkflowError::NodeNotFound("<entry>".to_string()).to_string()),
            };
        };
        let mut ctx = ExecutionContext::new();
        ctx.insert("trigger_data", trigger_payload);
        ctx.insert("tenant_id", serde_json::json!(workflow.tenant_id));
        ctx.insert("metadata", serde_json::json!({}));
        self.run_from(workflow, &entry.id, ctx).await
    }

    /// Resumes a paused workflow at `node_id`, with the context snapshot a
    /// `Continuation` captured before pausing (spec.md §4.D).
    pub async fn resume_from_node(
        &self,
        workflow: &Workflow,
        node_id: &str,
        context: JsonValue,
    ) -> ExecutionResult {
        let ctx = ExecutionContext::from_json(context);
        self.run_from(workflow, node_id, ctx).await
    }

    async fn run_from(&self, workflow: &Workflow, start_node_id: &str, mut ctx: ExecutionContext) -> ExecutionResult {
        let hop_limit = (self.hop_limit_multiplier * workflow.nodes.len().max(1)) as u32;
        let mut executed = Vec::new();
        let mut current_id = start_node_id.to_string();
        let mut hops = 0u32;
        let mut visited = std::collections::HashSet::new();

        loop {
            hops += 1;
            if hops > hop_limit {
                return ExecutionResult {
                    success: false,
                    output: Some(ctx.snapshot()),
                    executed_nodes: executed,
                    error: Some(WorkflowError::HopLimitExceeded(hop_limit).to_string()),
                };
            }
            if !visited.insert(current_id.clone()) {
                return ExecutionResult {
                    success: false,
                    output: Some(ctx.snapshot()),
                    executed_nodes: executed,
                    error: Some(WorkflowError::CyclicWorkflow(current_id).to_string()),
                };
            }

            let Some(node) = workflow.find_node(&current_id) else {
                return ExecutionResult {
                    success: false,
                    output: Some(ctx.snapshot()),
                    executed_nodes: executed,
                    error: Some(WorkflowError::NodeNotFound(current_id).to_string()),
                };
            };

            let timeout_secs = node.timeout.unwrap_or_else(|| self.default_timeout_secs(&node.config));
            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                self.dispatch_node(workflow, node, &mut ctx),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => NodeOutcome::fail(
                    WorkflowError::Timeout(node.id.clone(), timeout_secs).to_string(),
                    JsonValue::Null,
                ),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            executed.push(NodeResult {
                node_id: node.id.clone(),
                name: node.name.clone(),
                success: outcome.success,
                output: Some(outcome.output.clone()),
                error: outcome.error.clone(),
                duration_ms,
                timestamp: Utc::now(),
            });
            ctx.merge_under(&node.id, outcome.output.clone());

            if outcome.paused {
                return ExecutionResult {
                    success: true,
                    output: Some(ctx.snapshot()),
                    executed_nodes: executed,
                    error: None,
                };
            }

            let next = outcome.next_node_override.clone().or_else(|| {
                if outcome.success {
                    node.on_success.clone()
                } else {
                    node.on_failure.clone()
                }
            });

            match next {
                Some(next_id) if !next_id.is_empty() => current_id = next_id,
                _ => {
                    return ExecutionResult {
                        success: outcome.success,
                        output: Some(ctx.snapshot()),
                        executed_nodes: executed,
                        error: outcome.error,
                    };
                }
            }
        }
    }

    fn default_timeout_secs(&self, config: &NodeConfig) -> u64 {
        match config {
            NodeConfig::Http { timeout, .. } => timeout.unwrap_or(30),
            NodeConfig::AiAgent { .. } => 60,
            NodeConfig::Loop { .. } => 300,
            NodeConfig::Delay { .. } => self.sync_delay_threshold_secs + 5,
            _ => 10,
        }
    }

    fn dispatch_node<'a>(
        &'a self,
        workflow: &'a Workflow,
        node: &'a WorkflowNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxedFuture<'a, NodeOutcome> {
        Box::pin(async move {
            match &node.config {
                NodeConfig::Http {
                    url,
                    method,
                    headers,
                    body,
                    timeout,
                    success_codes,
                    retry_on_failure,
                    max_retries,
                } => {
                    let snapshot = ctx.snapshot();
                    http_node::execute(
                        &self.http_client,
                        url,
                        method,
                        headers,
                        body,
                        *timeout,
                        success_codes,
                        *retry_on_failure,
                        *max_retries,
                        &snapshot,
                    )
                    .await
                }
                NodeConfig::Switch { field, cases, default } => {
                    nodes::execute_switch(field, cases, default, &ctx.snapshot())
                }
                NodeConfig::Transform { mappings } => nodes::execute_transform(mappings, &ctx.snapshot()),
                NodeConfig::Loop { iterate_over, item_var, index_var, body_node, max_iterations } => {
                    self.execute_loop(workflow, iterate_over, item_var, index_var.as_deref(), body_node, *max_iterations, ctx)
                        .await
                }
                NodeConfig::Validate { schema, fail_on_error } => {
                    nodes::execute_validate(schema, *fail_on_error, &ctx.snapshot())
                }
                NodeConfig::Delay { duration_ms, duration, duration_seconds } => {
                    self.execute_delay(workflow, node, *duration_ms, duration.as_deref(), *duration_seconds, ctx)
                        .await
                }
                NodeConfig::AiAgent {
                    provider,
                    model,
                    system_prompt,
                    prompt,
                    temperature,
                    max_tokens,
                    max_auto_iterations,
                    max_total_iterations,
                    ..
                } => {
                    let snapshot = ctx.snapshot();
                    ai_node::execute(
                        &self.ai_provider,
                        self.tool_registry.as_ref(),
                        provider,
                        model,
                        system_prompt,
                        prompt,
                        *temperature,
                        *max_tokens,
                        *max_auto_iterations,
                        *max_total_iterations,
                        &snapshot,
                    )
                    .await
                }
                NodeConfig::Condition { field, operator, value } => {
                    nodes::execute_condition(field, *operator, value, &ctx.snapshot())
                }
                NodeConfig::Action { action } => nodes::execute_action(action, &ctx.snapshot()),
                NodeConfig::SendMessage { channel_id, recipient_id, content } => {
                    nodes::execute_send_message(&self.channel_manager, channel_id, recipient_id, content, &ctx.snapshot())
                        .await
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_loop(
        &self,
        workflow: &Workflow,
        iterate_over: &str,
        item_var: &str,
        index_var: Option<&str>,
        body_node: &str,
        max_iterations: u32,
        ctx: &mut ExecutionContext,
    ) -> NodeOutcome {
        let items = match expression::evaluate(iterate_over, ctx) {
            Ok(JsonValue::Array(items)) => items,
            Ok(_) => {
                return NodeOutcome::fail(
                    format!("LOOP iterate_over `{iterate_over}` did not resolve to an array"),
                    JsonValue::Null,
                )
            }
            Err(e) => return NodeOutcome::fail(format!("LOOP iterate_over resolution failed: {e}"), JsonValue::Null),
        };
        let Some(body) = workflow.find_node(body_node).cloned() else {
            return NodeOutcome::fail(format!("LOOP body_node `{body_node}` not found"), JsonValue::Null);
        };

        let cap = (max_iterations as usize).min(items.len()).min(common::types::MAX_LOOP_ITERATIONS as usize);
        let mut iterations = Vec::with_capacity(cap);
        for (i, item) in items.into_iter().enumerate().take(cap) {
            ctx.insert(item_var.to_string(), item);
            if let Some(name) = index_var {
                ctx.insert(name.to_string(), serde_json::json!(i));
            }
            let outcome = self.dispatch_node(workflow, &body, ctx).await;
            ctx.merge_under(&body.id, outcome.output.clone());
            let iteration_success = outcome.success;
            iterations.push(serde_json::json!({
                "index": i,
                "success": outcome.success,
                "output": outcome.output,
                "error": outcome.error,
            }));
            if !iteration_success {
                return NodeOutcome::fail(
                    format!("LOOP body node `{body_node}` failed on iteration {i}"),
                    serde_json::json!({ "iterations": iterations }),
                );
            }
        }
        NodeOutcome::ok(serde_json::json!({ "iterations": iterations, "count": iterations.len() }))
    }

    async fn execute_delay(
        &self,
        workflow: &Workflow,
        node: &WorkflowNode,
        duration_ms: Option<u64>,
        duration: Option<&str>,
        duration_seconds: Option<u64>,
        ctx: &ExecutionContext,
    ) -> NodeOutcome {
        let total_secs = match (duration_ms, duration_seconds, duration) {
            (Some(ms), _, _) => ms.div_ceil(1000),
            (_, Some(s), _) => s,
            (_, _, Some(s)) => match parse_duration_string(s) {
                Ok(v) => v,
                Err(e) => return NodeOutcome::fail(e, JsonValue::Null),
            },
            _ => return NodeOutcome::fail("DELAY node missing a duration".to_string(), JsonValue::Null),
        };
        let total_secs = total_secs.min(self.max_delay_secs);

        if total_secs <= self.sync_delay_threshold_secs {
            tokio::time::sleep(Duration::from_secs(total_secs)).await;
            return NodeOutcome::ok(serde_json::json!({ "delayed_secs": total_secs, "mode": "sync" }));
        }

        let scheduled_for = Utc::now() + chrono::Duration::seconds(total_secs as i64);
        let continuation = Continuation {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id,
            node_id: node.id.clone(),
            next_node_id: node.on_success.clone(),
            node_context: ctx.snapshot(),
            scheduled_for,
            created_at: Utc::now(),
        };
        let continuation_id = continuation.id;
        if let Err(e) = self.continuation_repo.save(continuation).await {
            return NodeOutcome::fail(format!("failed to persist continuation: {e}"), JsonValue::Null);
        }

        let mut outcome = NodeOutcome::ok(serde_json::json!({
            "delayed_secs": total_secs,
            "mode": "async",
            "continuation_id": continuation_id,
            "scheduled_for": scheduled_for,
        }));
        outcome.paused = true;
        outcome
    }
}

/// Supplemental feature (SPEC_FULL.md §5 item 2): a coarse, rule-based
/// classification of a failed run's terminal error into a next action an
/// operator or an automated retrier could take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    RetryAfter(u64),
    ResumeFrom(String),
    Abort,
}

pub fn suggest_recovery(error: &WorkflowError) -> RecoveryAction {
    match error {
        WorkflowError::Timeout(node_id, _) => RecoveryAction::ResumeFrom(node_id.clone()),
        WorkflowError::NodeExecutionFailed(node_id, _) => {
            let _ = node_id;
            RecoveryAction::RetryAfter(5)
        }
        WorkflowError::HopLimitExceeded(_) | WorkflowError::CyclicWorkflow(_) => RecoveryAction::Abort,
        WorkflowError::NodeNotFound(_) | WorkflowError::ValidationFailed(_) => RecoveryAction::Abort,
        WorkflowError::DelayCancelled => RecoveryAction::Abort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::NullChannelManager;
    use crate::repos::InMemoryContinuationRepository;
    use ai_service::{AgentError, AgentRequest, AgentResponse};
    use async_trait::async_trait;
    use common::types::{ActionConfig, NodeConfig, TriggerType, WorkflowTrigger};
    use std::collections::HashMap;

    struct StubProvider;
    #[async_trait]
    impl AiProvider for StubProvider {
        async fn complete(&self, _request: AgentRequest) -> Result<AgentResponse, AgentError> {
            unreachable!("not exercised in these tests")
        }
    }

    fn executor() -> WorkflowExecutor {
        WorkflowExecutor::new(
            Arc::new(StubProvider),
            None,
            Arc::new(NullChannelManager),
            Arc::new(InMemoryContinuationRepository::new()),
            2,
            60,
            86_400,
        )
    }

    fn action_node(id: &str, on_success: Option<&str>, message: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            name: id.to_string(),
            config: NodeConfig::Action {
                action: ActionConfig::ConsoleLog { message: serde_json::json!(message) },
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn executes_linear_workflow_to_completion() {
        let wf = workflow(vec![action_node("n1", Some("n2"), "first"), action_node("n2", None, "second")]);
        let result = executor().execute(&wf, serde_json::json!({})).await;
        assert!(result.success);
        assert_eq!(result.executed_nodes.len(), 2);
    }

    #[tokio::test]
    async fn rejects_invalid_workflow_before_running() {
        let wf = workflow(vec![]);
        let result = executor().execute(&wf, serde_json::json!({})).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn sync_delay_completes_inline() {
        let delay_node = WorkflowNode {
            id: "d".to_string(),
            name: "d".to_string(),
            config: NodeConfig::Delay { duration_ms: Some(1), duration: None, duration_seconds: None },
            on_success: None,
            on_failure: None,
            timeout: None,
        };
        let wf = workflow(vec![delay_node]);
        let result = executor().execute(&wf, serde_json::json!({})).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn async_delay_pauses_and_persists_continuation() {
        let delay_node = WorkflowNode {
            id: "d".to_string(),
            name: "d".to_string(),
            config: NodeConfig::Delay { duration_ms: None, duration: None, duration_seconds: Some(3600) },
            on_success: Some("after".to_string()),
            on_failure: None,
            timeout: None,
        };
        let wf = workflow(vec![delay_node, action_node("after", None, "resumed")]);
        let result = executor().execute(&wf, serde_json::json!({})).await;
        assert!(result.success);
        assert_eq!(result.executed_nodes.len(), 1);
    }

    #[test]
    fn recovery_suggests_resume_for_timeouts() {
        let action = suggest_recovery(&WorkflowError::Timeout("n1".to_string(), 10));
        assert_eq!(action, RecoveryAction::ResumeFrom("n1".to_string()));
    }

    mod graph_safety {
        use super::*;
        use proptest::prelude::*;

        /// A linear chain of `n` action nodes, each succeeding into the next.
        fn linear_workflow(n: usize) -> Workflow {
            let nodes = (0..n)
                .map(|i| {
                    let next = (i + 1 < n).then(|| format!("n{}", i + 1));
                    action_node(&format!("n{i}"), next.as_deref(), "step")
                })
                .collect();
            workflow(nodes)
        }

        proptest! {
            /// spec.md §8 property 1: any workflow `ValidateWorkflow` accepts
            /// terminates `Execute` in at most `2 * |nodes|` node visits —
            /// here, a linear chain always runs every node exactly once.
            #[test]
            fn linear_chains_terminate_within_hop_bound(n in 1usize..40) {
                let wf = linear_workflow(n);
                let rt = tokio::runtime::Runtime::new().unwrap();
                let result = rt.block_on(executor().execute(&wf, serde_json::json!({})));
                prop_assert!(result.success);
                prop_assert_eq!(result.executed_nodes.len(), n);
                prop_assert!(result.executed_nodes.len() <= 2 * n);
            }
        }

        #[test]
        fn two_node_cycle_is_rejected_before_any_side_effect() {
            let wf = workflow(vec![
                action_node("n1", Some("n2"), "first"),
                action_node("n2", Some("n1"), "second"),
            ]);
            let result = tokio_test_execute(&wf);
            assert!(!result.success);
            assert!(result.executed_nodes.is_empty(), "validation must reject before any node runs");
        }

        fn tokio_test_execute(wf: &Workflow) -> ExecutionResult {
            tokio::runtime::Runtime::new()
                .unwrap()
                .block_on(executor().execute(wf, serde_json::json!({})))
        }

        #[tokio::test]
        async fn resumed_cycle_fails_with_cyclic_workflow_at_second_visit() {
            // A cycle reached via `resume_from_node` skips `validate_workflow`
            // entirely, so `run_from`'s own `visited` tracking is the only
            // thing standing between it and running forever.
            let wf = workflow(vec![
                action_node("n1", Some("n2"), "first"),
                action_node("n2", Some("n1"), "second"),
            ]);
            let result = executor().resume_from_node(&wf, "n1", serde_json::json!({})).await;
            assert!(!result.success);
            assert_eq!(result.executed_nodes.len(), 2);
            assert!(result.error.unwrap().contains("n1"));
        }
    }
}
