//! Component F — `TriggerDispatcher`: matches an inbound trigger event
//! against active workflows sharing its trigger type and filters, then
//! launches each match as an independent, fire-and-forget `Execute` run
//! (spec.md §4.F). Concurrent launches are intentional — one slow or
//! failing workflow must never block another tenant's run.

use crate::executor::WorkflowExecutor;
use crate::repos::WorkflowRepository;
use common::error::DispatchError;
use common::types::{JsonValue, TenantId, TriggerType, WorkflowId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct TriggerDispatcher {
    executor: Arc<WorkflowExecutor>,
    workflow_repo: Arc<dyn WorkflowRepository>,
}

impl TriggerDispatcher {
    pub fn new(executor: Arc<WorkflowExecutor>, workflow_repo: Arc<dyn WorkflowRepository>) -> Self {
        Self { executor, workflow_repo }
    }

    /// Dispatches `trigger_data` to every active workflow of `tenant_id`
    /// whose trigger type is `trigger_type` and whose trigger filters match
    /// `event_filters`, the incoming event's own trigger envelope (spec.md
    /// §3: equal type, plus a per-type filter rule — see [`filters_match`]).
    /// Returns the ids of the workflows launched.
    pub async fn dispatch(
        &self,
        tenant_id: TenantId,
        trigger_type: TriggerType,
        event_filters: HashMap<String, JsonValue>,
        trigger_data: JsonValue,
    ) -> Result<Vec<WorkflowId>, DispatchError> {
        let candidates = self
            .workflow_repo
            .find_by_trigger_type(tenant_id, trigger_type)
            .await
            .map_err(|e| DispatchError::RepositoryUnavailable(e.to_string()))?;

        let matched: Vec<_> = candidates
            .into_iter()
            .filter(|w| w.is_active && filters_match(trigger_type, &w.trigger.filters, &event_filters))
            .collect();
        let launched = matched.iter().map(|w| w.id).collect();

        for workflow in matched {
            let executor = self.executor.clone();
            let trigger_data = trigger_data.clone();
            tokio::spawn(async move {
                let result = executor.execute(&workflow, trigger_data).await;
                if !result.success {
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        error = ?result.error,
                        "dispatched workflow run ended in failure"
                    );
                }
            });
        }

        Ok(launched)
    }
}

/// Matches a workflow's configured trigger filters against the incoming
/// event's own trigger filters (spec.md §3). Type equality is the caller's
/// job (it already restricted candidates by `trigger_type`); this checks
/// the filter map:
///
/// - `CHANNEL_WEBHOOK`: the workflow's `channel_ids` matches if it shares
///   *any* element with the event's `channel_ids` (set overlap, not
///   equality — a workflow can watch several channels).
/// - `SCHEDULE`: the workflow's `schedule_id` must equal the event's.
/// - every other key: exact equality against the event's filter value.
///
/// An empty workflow filter map always matches.
fn filters_match(
    trigger_type: TriggerType,
    workflow_filters: &HashMap<String, JsonValue>,
    event_filters: &HashMap<String, JsonValue>,
) -> bool {
    workflow_filters.iter().all(|(key, configured)| match (trigger_type, key.as_str()) {
        (TriggerType::ChannelWebhook, "channel_ids") => {
            let configured_ids = as_string_set(configured);
            let event_ids = event_filters.get("channel_ids").map(as_string_set).unwrap_or_default();
            configured_ids.intersection(&event_ids).next().is_some()
        }
        (TriggerType::Schedule, "schedule_id") => event_filters.get("schedule_id") == Some(configured),
        _ => event_filters.get(key) == Some(configured),
    })
}

fn as_string_set(value: &JsonValue) -> HashSet<String> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        JsonValue::String(s) => std::iter::once(s.clone()).collect(),
        _ => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filters_always_match() {
        let filters = HashMap::new();
        assert!(filters_match(TriggerType::Webhook, &filters, &HashMap::new()));
    }

    #[test]
    fn generic_filter_requires_matching_value() {
        let mut filters = HashMap::new();
        filters.insert("event".to_string(), serde_json::json!("push"));
        let mut matching_event = HashMap::new();
        matching_event.insert("event".to_string(), serde_json::json!("push"));
        let mut other_event = HashMap::new();
        other_event.insert("event".to_string(), serde_json::json!("pull_request"));
        assert!(filters_match(TriggerType::Webhook, &filters, &matching_event));
        assert!(!filters_match(TriggerType::Webhook, &filters, &other_event));
        assert!(!filters_match(TriggerType::Webhook, &filters, &HashMap::new()));
    }

    #[test]
    fn channel_webhook_matches_on_channel_id_overlap() {
        let mut filters = HashMap::new();
        filters.insert("channel_ids".to_string(), serde_json::json!(["c1"]));
        let mut event_c1 = HashMap::new();
        event_c1.insert("channel_ids".to_string(), serde_json::json!(["c1"]));
        let mut event_c2 = HashMap::new();
        event_c2.insert("channel_ids".to_string(), serde_json::json!(["c2"]));
        assert!(filters_match(TriggerType::ChannelWebhook, &filters, &event_c1));
        assert!(!filters_match(TriggerType::ChannelWebhook, &filters, &event_c2));
    }

    #[test]
    fn schedule_matches_on_exact_schedule_id() {
        let mut filters = HashMap::new();
        filters.insert("schedule_id".to_string(), serde_json::json!("sched-1"));
        let mut matching = HashMap::new();
        matching.insert("schedule_id".to_string(), serde_json::json!("sched-1"));
        let mut other = HashMap::new();
        other.insert("schedule_id".to_string(), serde_json::json!("sched-2"));
        assert!(filters_match(TriggerType::Schedule, &filters, &matching));
        assert!(!filters_match(TriggerType::Schedule, &filters, &other));
    }
}
