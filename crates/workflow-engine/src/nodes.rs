//! Component B — node executors for the node kinds that need no external
//! collaborator: SWITCH, TRANSFORM, VALIDATE, CONDITION, ACTION, SEND_MESSAGE.
//!
//! HTTP lives in [`crate::http_node`], AI_AGENT in [`crate::ai_node`], LOOP
//! and DELAY are driven by [`crate::executor::WorkflowExecutor`] directly
//! since both need to recurse back into node dispatch.

use crate::expression::{self};
use async_trait::async_trait;
use common::types::{ActionConfig, ConditionOperator, ExecutionContext, JsonValue};
use std::sync::Arc;

/// Result of running one node executor. Mirrors spec.md §4.C's contract: the
/// workflow executor merges `output` into the running context under the
/// node's id and uses `next_node_override`/`success` to pick the next hop.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub success: bool,
    pub output: JsonValue,
    pub error: Option<String>,
    /// Set by SWITCH to override `on_success`/`on_failure` routing.
    pub next_node_override: Option<String>,
    /// Set by an async DELAY to signal the executor to stop the loop.
    pub paused: bool,
}

impl NodeOutcome {
    pub fn ok(output: JsonValue) -> Self {
        Self {
            success: true,
            output,
            error: None,
            next_node_override: None,
            paused: false,
        }
    }

    pub fn fail(error: impl Into<String>, output: JsonValue) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
            next_node_override: None,
            paused: false,
        }
    }
}

/// Outbound channel collaborator for SEND_MESSAGE nodes (spec.md §6).
#[async_trait]
pub trait ChannelManager: Send + Sync {
    async fn send_message(
        &self,
        channel_id: &str,
        message: common::types::OutgoingMessage,
    ) -> Result<(), String>;
}

/// A channel manager that records sends in memory; useful as a default and
/// in tests where no real adapter is wired.
#[derive(Default)]
pub struct NullChannelManager;

#[async_trait]
impl ChannelManager for NullChannelManager {
    async fn send_message(
        &self,
        channel_id: &str,
        message: common::types::OutgoingMessage,
    ) -> Result<(), String> {
        tracing::debug!(channel_id, recipient = %message.recipient_id, "send_message (null channel manager)");
        Ok(())
    }
}

fn as_context(snapshot: &JsonValue) -> ExecutionContext {
    ExecutionContext::from_json(snapshot.clone())
}

pub fn execute_switch(
    field: &str,
    cases: &std::collections::HashMap<String, String>,
    default: &Option<String>,
    snapshot: &JsonValue,
) -> NodeOutcome {
    let ctx = as_context(snapshot);
    let value = ctx.get_path(field);
    let stringified = value.map(stringify_field);
    if let Some(s) = &stringified {
        if let Some(target) = cases.get(s) {
            let mut out = NodeOutcome::ok(serde_json::json!({ "next_node": target }));
            out.next_node_override = Some(target.clone());
            return out;
        }
    }
    if let Some(default_target) = default {
        let mut out = NodeOutcome::ok(serde_json::json!({ "next_node": default_target }));
        out.next_node_override = Some(default_target.clone());
        return out;
    }
    NodeOutcome::fail(
        format!("switch field `{field}` matched no case and no default was set"),
        serde_json::json!({ "field_value": stringified }),
    )
}

fn stringify_field(v: &JsonValue) -> String {
    match v {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn execute_transform(
    mappings: &std::collections::HashMap<String, JsonValue>,
    snapshot: &JsonValue,
) -> NodeOutcome {
    let ctx = as_context(snapshot);
    let mut out = serde_json::Map::with_capacity(mappings.len());
    for (key, expr_value) in mappings {
        match expression::resolve_value(expr_value, &ctx) {
            Ok(v) => {
                out.insert(key.clone(), v);
            }
            Err(e) => {
                return NodeOutcome::fail(
                    format!("transform mapping `{key}` failed: {e}"),
                    JsonValue::Object(out),
                )
            }
        }
    }
    NodeOutcome::ok(JsonValue::Object(out))
}

pub fn execute_validate(
    schema: &std::collections::HashMap<String, String>,
    fail_on_error: bool,
    snapshot: &JsonValue,
) -> NodeOutcome {
    let ctx = as_context(snapshot);
    let mut violations = Vec::new();
    for (field, rule) in schema {
        if let Err(reason) = check_rule(&ctx, field, rule) {
            violations.push(serde_json::json!({ "field": field, "rule": rule, "reason": reason }));
        }
    }
    if violations.is_empty() {
        return NodeOutcome::ok(serde_json::json!({ "valid": true }));
    }
    if fail_on_error {
        return NodeOutcome::fail(
            "validation failed",
            serde_json::json!({ "violations": violations }),
        );
    }
    NodeOutcome::ok(serde_json::json!({ "valid": false, "violations": violations }))
}

/// Rule grammar kept intentionally small: `required`, `type:<kind>`,
/// `min:<n>`, `max:<n>`. Unknown rule names are treated as a non-match
/// rather than a parse error, per spec.md's duck-typed config tolerance.
fn check_rule(ctx: &ExecutionContext, field: &str, rule: &str) -> Result<(), String> {
    let value = ctx.get_path(field);
    for clause in rule.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if clause == "required" {
            if value.is_none() || value == Some(&JsonValue::Null) {
                return Err(format!("`{field}` is required"));
            }
            continue;
        }
        if let Some(kind) = clause.strip_prefix("type:") {
            let matches = match (kind, value) {
                ("string", Some(JsonValue::String(_))) => true,
                ("number", Some(JsonValue::Number(_))) => true,
                ("bool", Some(JsonValue::Bool(_))) => true,
                ("array", Some(JsonValue::Array(_))) => true,
                ("object", Some(JsonValue::Object(_))) => true,
                _ => false,
            };
            if !matches {
                return Err(format!("`{field}` is not of type `{kind}`"));
            }
            continue;
        }
        if let Some(bound) = clause.strip_prefix("min:") {
            let min: f64 = bound.parse().map_err(|_| format!("invalid min bound `{bound}`"))?;
            let ok = match value {
                Some(JsonValue::Number(n)) => n.as_f64().map(|f| f >= min).unwrap_or(false),
                Some(JsonValue::String(s)) => s.len() as f64 >= min,
                Some(JsonValue::Array(a)) => a.len() as f64 >= min,
                _ => false,
            };
            if !ok {
                return Err(format!("`{field}` is below minimum {min}"));
            }
            continue;
        }
        if let Some(bound) = clause.strip_prefix("max:") {
            let max: f64 = bound.parse().map_err(|_| format!("invalid max bound `{bound}`"))?;
            let ok = match value {
                Some(JsonValue::Number(n)) => n.as_f64().map(|f| f <= max).unwrap_or(false),
                Some(JsonValue::String(s)) => s.len() as f64 <= max,
                Some(JsonValue::Array(a)) => a.len() as f64 <= max,
                _ => false,
            };
            if !ok {
                return Err(format!("`{field}` is above maximum {max}"));
            }
            continue;
        }
    }
    Ok(())
}

pub fn execute_condition(
    field: &str,
    operator: ConditionOperator,
    value: &JsonValue,
    snapshot: &JsonValue,
) -> NodeOutcome {
    let ctx = as_context(snapshot);
    let lhs = ctx.get_path(field).cloned().unwrap_or(JsonValue::Null);
    let matched = match evaluate_condition(&lhs, operator, value) {
        Ok(m) => m,
        Err(e) => return NodeOutcome::fail(e, serde_json::json!({ "matched": false })),
    };
    if matched {
        NodeOutcome::ok(serde_json::json!({ "matched": true }))
    } else {
        NodeOutcome::fail("condition not met", serde_json::json!({ "matched": false }))
    }
}

fn evaluate_condition(lhs: &JsonValue, op: ConditionOperator, rhs: &JsonValue) -> Result<bool, String> {
    use ConditionOperator::*;
    match op {
        Equals => Ok(lhs == rhs),
        Contains => {
            let (JsonValue::String(haystack), JsonValue::String(needle)) = (lhs, rhs) else {
                return Err("`contains` requires string operands".to_string());
            };
            Ok(haystack.contains(needle.as_str()))
        }
        Gt | Gte | Lt | Lte => {
            let l = lhs.as_f64().ok_or("comparison operator requires numeric operands")?;
            let r = rhs.as_f64().ok_or("comparison operator requires numeric operands")?;
            Ok(match op {
                Gt => l > r,
                Gte => l >= r,
                Lt => l < r,
                Lte => l <= r,
                Equals | Contains => unreachable!(),
            })
        }
    }
}

pub fn execute_action(action: &ActionConfig, snapshot: &JsonValue) -> NodeOutcome {
    let ctx = as_context(snapshot);
    match action {
        ActionConfig::SetContext { key, value } => match expression::resolve_value(value, &ctx) {
            Ok(resolved) => NodeOutcome::ok(serde_json::json!({ key.clone(): resolved })),
            Err(e) => NodeOutcome::fail(format!("set_context failed: {e}"), JsonValue::Null),
        },
        ActionConfig::SetState { value } => match expression::resolve_value(value, &ctx) {
            Ok(resolved) => NodeOutcome::ok(serde_json::json!({ "next_state": resolved })),
            Err(e) => NodeOutcome::fail(format!("set_state failed: {e}"), JsonValue::Null),
        },
        ActionConfig::ConsoleLog { message } => match expression::resolve_value(message, &ctx) {
            Ok(resolved) => {
                tracing::info!(message = %resolved, "console_log action");
                NodeOutcome::ok(serde_json::json!({ "logged": resolved }))
            }
            Err(e) => NodeOutcome::fail(format!("console_log failed: {e}"), JsonValue::Null),
        },
        ActionConfig::Response { body } => match expression::resolve_value(body, &ctx) {
            Ok(resolved) => NodeOutcome::ok(serde_json::json!({ "response": resolved, "should_respond": true })),
            Err(e) => NodeOutcome::fail(format!("response action failed: {e}"), JsonValue::Null),
        },
    }
}

pub async fn execute_send_message(
    channel_manager: &Arc<dyn ChannelManager>,
    channel_id: &str,
    recipient_id: &str,
    content: &JsonValue,
    snapshot: &JsonValue,
) -> NodeOutcome {
    let ctx = as_context(snapshot);
    let resolved_content = match expression::resolve_value(content, &ctx) {
        Ok(v) => v,
        Err(e) => return NodeOutcome::fail(format!("send_message content resolution failed: {e}"), JsonValue::Null),
    };
    let message = common::types::OutgoingMessage {
        recipient_id: recipient_id.to_string(),
        content: resolved_content.clone(),
        metadata: JsonValue::Null,
    };
    match channel_manager.send_message(channel_id, message).await {
        Ok(()) => NodeOutcome::ok(serde_json::json!({ "sent": true, "content": resolved_content })),
        Err(e) => NodeOutcome::fail(format!("send_message failed: {e}"), JsonValue::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn switch_routes_to_matching_case() {
        let mut cases = HashMap::new();
        cases.insert("a".to_string(), "n3".to_string());
        cases.insert("b".to_string(), "n4".to_string());
        let snapshot = serde_json::json!({"n1": {"kind": "a"}});
        let out = execute_switch("n1.kind", &cases, &None, &snapshot);
        assert!(out.success);
        assert_eq!(out.next_node_override, Some("n3".to_string()));
    }

    #[test]
    fn switch_without_default_fails_on_unmatched() {
        let cases = HashMap::new();
        let snapshot = serde_json::json!({"n1": {"kind": "c"}});
        let out = execute_switch("n1.kind", &cases, &None, &snapshot);
        assert!(!out.success);
    }

    #[test]
    fn validate_collects_violations_without_failing() {
        let mut schema = HashMap::new();
        schema.insert("name".to_string(), "required".to_string());
        let snapshot = serde_json::json!({});
        let out = execute_validate(&schema, false, &snapshot);
        assert!(out.success);
        assert_eq!(out.output["valid"], serde_json::json!(false));
    }

    #[test]
    fn validate_fails_hard_when_fail_on_error() {
        let mut schema = HashMap::new();
        schema.insert("name".to_string(), "required".to_string());
        let snapshot = serde_json::json!({});
        let out = execute_validate(&schema, true, &snapshot);
        assert!(!out.success);
    }

    #[test]
    fn condition_contains_requires_strings() {
        let snapshot = serde_json::json!({"msg": "hello world"});
        let out = execute_condition("msg", ConditionOperator::Contains, &serde_json::json!("world"), &snapshot);
        assert!(out.success);
    }

    #[test]
    fn condition_numeric_compare() {
        let snapshot = serde_json::json!({"n": 10});
        let out = execute_condition("n", ConditionOperator::Gte, &serde_json::json!(10), &snapshot);
        assert!(out.success);
        let out2 = execute_condition("n", ConditionOperator::Lt, &serde_json::json!(5), &snapshot);
        assert!(!out2.success);
    }

    #[test]
    fn set_context_merges_resolved_value() {
        let snapshot = serde_json::json!({});
        let action = ActionConfig::SetContext { key: "k".to_string(), value: serde_json::json!("v") };
        let out = execute_action(&action, &snapshot);
        assert_eq!(out.output, serde_json::json!({"k": "v"}));
    }
}
