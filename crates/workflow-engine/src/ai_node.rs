//! AI_AGENT node executor — resolves prompts through the expression
//! evaluator, then delegates to the `ai-service` external collaborator.

use crate::expression;
use crate::nodes::NodeOutcome;
use ai_service::{AgentRequest, AiProvider, ToolRegistry};
use common::types::{ExecutionContext, JsonValue};
use std::sync::Arc;

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    provider: &Arc<dyn AiProvider>,
    tool_registry: Option<&ToolRegistry>,
    ai_provider_name: &str,
    model: &str,
    system_prompt: &str,
    prompt: &Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_auto_iterations: u32,
    max_total_iterations: u32,
    snapshot: &JsonValue,
) -> NodeOutcome {
    let ctx = ExecutionContext::from_json(snapshot.clone());

    let resolved_system = match expression::evaluate_string(system_prompt, &ctx) {
        Ok(JsonValue::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(e) => return NodeOutcome::fail(format!("system_prompt resolution failed: {e}"), JsonValue::Null),
    };
    let resolved_user = match prompt {
        Some(p) => match expression::evaluate_string(p, &ctx) {
            Ok(JsonValue::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(e) => return NodeOutcome::fail(format!("prompt resolution failed: {e}"), JsonValue::Null),
        },
        None => String::new(),
    };

    let tools = tool_registry.map(|r| r.list_tools()).unwrap_or_default();
    let request = AgentRequest {
        provider: ai_provider_name.to_string(),
        model: model.to_string(),
        system_prompt: resolved_system,
        user_prompt: resolved_user,
        temperature: temperature.unwrap_or(0.7),
        max_tokens: max_tokens.unwrap_or(2000),
        tools,
    };

    match ai_service::run_agent_loop(provider, tool_registry, request, max_auto_iterations, max_total_iterations).await
    {
        Ok(response) => NodeOutcome::ok(serde_json::json!({
            "response_text": response.response_text,
            "tool_calls": response.tool_calls,
            "finish_reason": response.finish_reason,
        })),
        Err(e) => NodeOutcome::fail(format!("AI agent call failed: {e}"), JsonValue::Null),
    }
}
