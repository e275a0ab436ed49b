//! Component D — the scheduler-facing half of DELAY handling: a humantime-ish
//! duration parser shared with [`crate::executor`], and the tick-worker that
//! resumes continuations once they come due.

use crate::executor::WorkflowExecutor;
use crate::repos::{ContinuationRepository, WorkflowRepository};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Parses a single `<number><unit>` duration string, unit in `s`/`m`/`h`/`d`.
/// Deliberately small: no compound durations (`1h30m`), no decimals.
pub fn parse_duration_string(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split_at = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| format!("duration `{s}` has no unit"))?;
    let (number, unit) = s.split_at(split_at);
    let value: u64 = number.parse().map_err(|_| format!("invalid duration number in `{s}`"))?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => return Err(format!("unknown duration unit `{other}` in `{s}`")),
    };
    Ok(value * multiplier)
}

/// Polls the continuation store for due entries and resumes each one's
/// workflow past the node that scheduled it (spec.md §4.D). Each resume runs
/// as its own task so one slow workflow can't stall the tick.
pub struct ContinuationWorker {
    executor: Arc<WorkflowExecutor>,
    continuation_repo: Arc<dyn ContinuationRepository>,
    workflow_repo: Arc<dyn WorkflowRepository>,
    tick_interval: Duration,
    batch_limit: usize,
}

impl ContinuationWorker {
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        continuation_repo: Arc<dyn ContinuationRepository>,
        workflow_repo: Arc<dyn WorkflowRepository>,
        tick_interval: Duration,
        batch_limit: usize,
    ) -> Self {
        Self { executor, continuation_repo, workflow_repo, tick_interval, batch_limit }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            self.tick_once().await;
        }
    }

    pub async fn tick_once(&self) {
        let due = match self.continuation_repo.find_due(Utc::now(), self.batch_limit).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll due continuations");
                return;
            }
        };
        for continuation in due {
            if let Err(e) = self.continuation_repo.delete(continuation.id).await {
                tracing::warn!(error = %e, continuation_id = %continuation.id, "failed to clear continuation");
            }
            let Some(next_node_id) = continuation.next_node_id.clone() else {
                tracing::debug!(continuation_id = %continuation.id, "delay had no on_success hop; run ends here");
                continue;
            };
            let workflow = match self.workflow_repo.find_by_id(continuation.tenant_id, continuation.workflow_id).await {
                Ok(Some(w)) => w,
                Ok(None) => {
                    tracing::warn!(workflow_id = %continuation.workflow_id, "workflow deleted before its delay resumed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load workflow for continuation resume");
                    continue;
                }
            };
            let executor = self.executor.clone();
            tokio::spawn(async move {
                let result = executor.resume_from_node(&workflow, &next_node_id, continuation.node_context).await;
                if !result.success {
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        node_id = %next_node_id,
                        error = ?result.error,
                        "resumed workflow run ended in failure"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_units() {
        assert_eq!(parse_duration_string("30s").unwrap(), 30);
        assert_eq!(parse_duration_string("5m").unwrap(), 300);
        assert_eq!(parse_duration_string("2h").unwrap(), 7200);
        assert_eq!(parse_duration_string("1d").unwrap(), 86_400);
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration_string("10x").is_err());
    }

    #[test]
    fn rejects_missing_unit() {
        assert!(parse_duration_string("10").is_err());
    }
}
