//! Component E — the schedule engine: CRUD + validation over
//! `WorkflowScheduleRepository` backed by the real `cron` crate, and the
//! tick-worker that fires due schedules (spec.md §4.E). Grounded on the
//! teacher's `scheduler.rs`, whose hand-rolled cron matcher is replaced here
//! with `cron::Schedule` per the note left in that file about production use.

use crate::dispatcher::TriggerDispatcher;
use crate::repos::{WorkflowRepository, WorkflowScheduleRepository};
use chrono::{DateTime, Utc};
use common::error::ScheduleError;
use common::types::{
    Schedule, ScheduleId, ScheduleType, TenantId, TriggerType, WorkflowId, MAX_SCHEDULES_PER_WORKFLOW,
    MAX_SCHEDULE_INTERVAL_SECS, MIN_SCHEDULE_INTERVAL_SECS,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct ScheduleEngine {
    repo: Arc<dyn WorkflowScheduleRepository>,
}

impl ScheduleEngine {
    pub fn new(repo: Arc<dyn WorkflowScheduleRepository>) -> Self {
        Self { repo }
    }

    pub async fn create(
        &self,
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        schedule_type: ScheduleType,
        timezone: String,
    ) -> Result<Schedule, ScheduleError> {
        validate_schedule_type(&schedule_type)?;
        let count = self
            .repo
            .count_by_workflow(workflow_id)
            .await
            .map_err(|e| ScheduleError::NotFound(e.to_string()))?;
        if count >= MAX_SCHEDULES_PER_WORKFLOW {
            return Err(ScheduleError::TooManySchedules(workflow_id.to_string(), MAX_SCHEDULES_PER_WORKFLOW));
        }
        let next_run_at = compute_next_run(&schedule_type, Utc::now())?;
        let schedule = Schedule {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_id,
            schedule_type,
            is_active: true,
            last_run_at: None,
            next_run_at,
            run_count: 0,
            timezone,
            metadata: serde_json::Value::Null,
        };
        self.repo
            .save(schedule.clone())
            .await
            .map_err(|e| ScheduleError::NotFound(e.to_string()))?;
        Ok(schedule)
    }

    pub async fn delete(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        self.repo.delete(id).await.map_err(|e| ScheduleError::NotFound(e.to_string()))
    }

    pub async fn set_active(&self, id: ScheduleId, is_active: bool) -> Result<(), ScheduleError> {
        self.repo
            .bulk_update_status(&[id], is_active)
            .await
            .map_err(|e| ScheduleError::NotFound(e.to_string()))
    }

    pub async fn list_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Schedule>, ScheduleError> {
        self.repo
            .find_by_workflow(workflow_id)
            .await
            .map_err(|e| ScheduleError::NotFound(e.to_string()))
    }
}

fn validate_schedule_type(schedule_type: &ScheduleType) -> Result<(), ScheduleError> {
    match schedule_type {
        ScheduleType::Cron { cron_expression } => {
            cron::Schedule::from_str(cron_expression).map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;
            Ok(())
        }
        ScheduleType::Interval { interval_seconds } => {
            if *interval_seconds < MIN_SCHEDULE_INTERVAL_SECS || *interval_seconds > MAX_SCHEDULE_INTERVAL_SECS {
                return Err(ScheduleError::IntervalOutOfRange {
                    min: MIN_SCHEDULE_INTERVAL_SECS,
                    max: MAX_SCHEDULE_INTERVAL_SECS,
                    actual: *interval_seconds,
                });
            }
            Ok(())
        }
        ScheduleType::Once { scheduled_at } => {
            if *scheduled_at <= Utc::now() {
                return Err(ScheduleError::OnceInPast);
            }
            Ok(())
        }
    }
}

fn compute_next_run(schedule_type: &ScheduleType, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match schedule_type {
        ScheduleType::Cron { cron_expression } => {
            let schedule = cron::Schedule::from_str(cron_expression).map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;
            Ok(schedule.after(&after).next())
        }
        ScheduleType::Interval { interval_seconds } => Ok(Some(after + chrono::Duration::seconds(*interval_seconds as i64))),
        ScheduleType::Once { scheduled_at } => Ok(Some(*scheduled_at)),
    }
}

/// Polls for due schedules and emits each one as a `SCHEDULE`-type trigger
/// through the [`TriggerDispatcher`] (spec.md §4.E step 2 / §2's `E → F`
/// data flow), then advances `next_run_at`/`run_count` and retires `Once`
/// schedules after they fire.
pub struct ScheduleWorker {
    dispatcher: Arc<TriggerDispatcher>,
    schedule_repo: Arc<dyn WorkflowScheduleRepository>,
    workflow_repo: Arc<dyn WorkflowRepository>,
    tick_interval: Duration,
    batch_limit: usize,
}

impl ScheduleWorker {
    pub fn new(
        dispatcher: Arc<TriggerDispatcher>,
        schedule_repo: Arc<dyn WorkflowScheduleRepository>,
        workflow_repo: Arc<dyn WorkflowRepository>,
        tick_interval: Duration,
        batch_limit: usize,
    ) -> Self {
        Self { dispatcher, schedule_repo, workflow_repo, tick_interval, batch_limit }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            self.tick_once().await;
        }
    }

    pub async fn tick_once(&self) {
        let due = match self.schedule_repo.find_due(Utc::now(), self.batch_limit).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll due schedules");
                return;
            }
        };
        for mut schedule in due {
            let workflow = match self.workflow_repo.find_by_id(schedule.tenant_id, schedule.workflow_id).await {
                Ok(Some(w)) if w.is_active => w,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load workflow for due schedule");
                    continue;
                }
            };

            // Advance (and persist) `next_run_at`/`run_count` *before* spawning
            // the run, the same "claim before dispatch" ordering the
            // continuation worker uses — a crash after this save but before
            // the spawned execution finishes still leaves the schedule
            // correctly advanced, so a restart's next `find_due` can't select
            // it again within the same minute (spec.md §8 property 5).
            schedule.last_run_at = Some(Utc::now());
            schedule.run_count += 1;
            schedule.next_run_at = compute_next_run(&schedule.schedule_type, Utc::now()).unwrap_or(None);
            if matches!(schedule.schedule_type, ScheduleType::Once { .. }) {
                schedule.is_active = false;
                schedule.next_run_at = None;
            }
            if let Err(e) = self.schedule_repo.save(schedule.clone()).await {
                tracing::warn!(error = %e, "failed to persist schedule before firing; skipping this tick");
                continue;
            }

            let payload = schedule_trigger_payload(&schedule);
            let mut event_filters = HashMap::new();
            event_filters.insert("schedule_id".to_string(), serde_json::json!(schedule.id.to_string()));
            if let Err(e) = self
                .dispatcher
                .dispatch(schedule.tenant_id, TriggerType::Schedule, event_filters, payload)
                .await
            {
                tracing::warn!(workflow_id = %workflow.id, error = %e, "failed to dispatch scheduled trigger");
            }
        }
    }
}

/// `{ schedule_id, schedule_type, run_count, [expression|interval] }`
/// (spec.md §4.E step 2) — `schedule` has already had `run_count` advanced
/// by the caller, so this reads straight off it.
fn schedule_trigger_payload(schedule: &Schedule) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "schedule_id": schedule.id,
        "schedule_type": schedule.schedule_type,
        "run_count": schedule.run_count,
    });
    let extra = match &schedule.schedule_type {
        ScheduleType::Cron { cron_expression } => Some(("expression", serde_json::json!(cron_expression))),
        ScheduleType::Interval { interval_seconds } => Some(("interval", serde_json::json!(interval_seconds))),
        ScheduleType::Once { .. } => None,
    };
    if let (Some((key, value)), Some(map)) = (extra, payload.as_object_mut()) {
        map.insert(key.to_string(), value);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_cron_expression() {
        let err = validate_schedule_type(&ScheduleType::Cron { cron_expression: "not a cron".to_string() });
        assert!(matches!(err, Err(ScheduleError::InvalidCron(_))));
    }

    #[test]
    fn rejects_interval_below_minimum() {
        let err = validate_schedule_type(&ScheduleType::Interval { interval_seconds: 1 });
        assert!(matches!(err, Err(ScheduleError::IntervalOutOfRange { .. })));
    }

    #[test]
    fn rejects_once_in_the_past() {
        let err = validate_schedule_type(&ScheduleType::Once { scheduled_at: Utc::now() - chrono::Duration::seconds(10) });
        assert!(matches!(err, Err(ScheduleError::OnceInPast)));
    }

    #[test]
    fn interval_next_run_adds_seconds() {
        let now = Utc::now();
        let next = compute_next_run(&ScheduleType::Interval { interval_seconds: 120 }, now).unwrap();
        assert_eq!(next, Some(now + chrono::Duration::seconds(120)));
    }
}
