//! Status queries: a task's condition explained from its row alone.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Phase, StageName, TaskId, TaskRecord, TenantId, WorkerId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub tenant_id: TenantId,
    pub stage: StageName,
    pub phase: Phase,
    pub priority: i32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl From<TaskRecord> for TaskView {
    fn from(record: TaskRecord) -> Self {
        Self {
            task_id: record.id,
            tenant_id: record.tenant_id,
            stage: record.stage,
            phase: record.phase,
            priority: record.priority,
            retry_count: record.retry_count,
            last_error: record.last_error,
            next_retry_at: record.next_retry_at,
            claimed_by: record.claimed_by,
            claimed_at: record.claimed_at,
            payload: record.payload,
            updated_at: record.updated_at,
        }
    }
}

impl TaskView {
    /// One line a human can act on.
    pub fn explain(&self) -> String {
        let error = self.last_error.as_deref().unwrap_or("no error recorded");
        match self.phase {
            Phase::Queued => format!("queued for stage '{}'", self.stage),
            Phase::Processing => match (self.claimed_by, self.claimed_at) {
                (Some(worker), Some(at)) => format!(
                    "stage '{}' running on {worker} since {}",
                    self.stage,
                    at.to_rfc3339()
                ),
                _ => format!("stage '{}' running", self.stage),
            },
            Phase::Failed => match self.next_retry_at {
                Some(at) => format!(
                    "stage '{}' failed ({} so far): {error}; retry at {}",
                    self.stage,
                    self.retry_count,
                    at.to_rfc3339()
                ),
                None => format!(
                    "stage '{}' failed ({} so far): {error}; retry pending",
                    self.stage, self.retry_count
                ),
            },
            Phase::AwaitingReview => format!("waiting for approval at '{}'", self.stage),
            Phase::Published => "published".to_string(),
            Phase::FailedFinal => format!(
                "gave up at stage '{}' after {} failures: {error}; needs manual intervention",
                self.stage, self.retry_count
            ),
        }
    }
}
