//! Task record: the durable row every other component operates on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{StageName, TaskId, TenantId, WorkerId};
use super::rate_limit::LimitHolder;
use super::status::{Phase, TaskStatus};

/// Intake request. The payload is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            priority: 0,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Single source of truth for one task.
///
/// The tenant id and display name are denormalized onto the row so claim
/// queries never join. Rows are never deleted; `updated_at` moves on every
/// status write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub tenant_name: String,

    pub stage: StageName,
    pub phase: Phase,
    pub priority: i32,
    pub payload: serde_json::Value,

    /// Last time a worker claimed this task. Kept after release so tenant
    /// fairness can be recomputed from rows alone.
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,

    /// Number of failures recorded so far.
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        new: NewTask,
        tenant_name: String,
        stage: StageName,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id: new.tenant_id,
            tenant_name,
            stage,
            phase: Phase::Queued,
            priority: new.priority,
            payload: new.payload,
            claimed_at: None,
            claimed_by: None,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::new(self.stage.clone(), self.phase)
    }

    /// Queued, or failed with its retry time reached.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.phase {
            Phase::Queued => true,
            Phase::Failed => self.next_retry_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Does `claim` still own this row?
    pub fn is_held_by(&self, claim: &Claim) -> bool {
        self.phase == Phase::Processing
            && self.claimed_by == Some(claim.worker)
            && self.claimed_at == Some(claim.claimed_at)
    }

    /// Stamp the claim. Caller must have checked eligibility.
    pub fn start_claim(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Claim {
        self.phase = Phase::Processing;
        self.claimed_at = Some(now);
        self.claimed_by = Some(worker);
        self.updated_at = now;
        Claim::new(self, worker, now)
    }

    /// Give the claim back without touching the retry budget.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.phase = Phase::Queued;
        self.claimed_by = None;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// The phase a `processing` row was claimed from.
    ///
    /// A queued row never carries `next_retry_at` (intake, `advance` and
    /// `release` all clear it) and a failed one always does, and claiming
    /// leaves it alone.
    pub fn claimed_from(&self) -> Phase {
        if self.next_retry_at.is_some() {
            Phase::Failed
        } else {
            Phase::Queued
        }
    }

    /// Move to another stage/phase after success or approval.
    pub fn advance(
        &mut self,
        target: TaskStatus,
        fields: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) {
        self.stage = target.stage;
        self.phase = target.phase;
        self.claimed_by = None;
        self.next_retry_at = None;
        merge_fields(&mut self.payload, fields);
        self.updated_at = now;
    }

    /// Record one failure. `next_retry_at == None` means final.
    pub fn fail(&mut self, error: String, next_retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error);
        self.claimed_by = None;
        match next_retry_at {
            Some(at) => {
                self.phase = Phase::Failed;
                self.next_retry_at = Some(at);
            }
            None => {
                self.phase = Phase::FailedFinal;
                self.next_retry_at = None;
            }
        }
        self.updated_at = now;
    }
}

/// Merge step result fields into the task payload.
///
/// A non-object payload is replaced by an object when there is something to
/// merge.
pub fn merge_fields(
    payload: &mut serde_json::Value,
    fields: &serde_json::Map<String, serde_json::Value>,
) {
    if fields.is_empty() {
        return;
    }
    if !payload.is_object() {
        *payload = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(map) = payload {
        for (k, v) in fields {
            map.insert(k.clone(), v.clone());
        }
    }
}

/// Exclusive, time-bounded ownership of one task by one worker.
///
/// `(task_id, worker, claimed_at)` is the claim token: every write after the
/// claim is conditional on the row still carrying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: TaskId,
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub stage: StageName,
    pub worker: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub priority: i32,
    pub retry_count: u32,
    pub payload: serde_json::Value,

    /// `queued` or `failed`: where the task was before this claim.
    pub claimed_from: Phase,
    pub last_error: Option<String>,
}

impl Claim {
    pub fn new(record: &TaskRecord, worker: WorkerId, claimed_at: DateTime<Utc>) -> Self {
        Self {
            task_id: record.id,
            tenant_id: record.tenant_id.clone(),
            tenant_name: record.tenant_name.clone(),
            stage: record.stage.clone(),
            worker,
            claimed_at,
            priority: record.priority,
            retry_count: record.retry_count,
            payload: record.payload.clone(),
            claimed_from: record.claimed_from(),
            last_error: record.last_error.clone(),
        }
    }

    /// Status the task left when it was claimed.
    pub fn from_status(&self) -> TaskStatus {
        TaskStatus::new(self.stage.clone(), self.claimed_from)
    }

    /// The token rate-limit units taken under this claim are recorded against.
    pub fn holder(&self) -> LimitHolder {
        LimitHolder::new(self.task_id, self.worker, self.claimed_at)
    }
}

/// Result of a write that is conditional on a claim token.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    Applied(TaskRecord),

    /// The row no longer carries the claim (reaped, or already finished).
    /// A normal race outcome, not an error.
    ClaimLost,
}

impl Commit {
    pub fn applied(&self) -> Option<&TaskRecord> {
        match self {
            Commit::Applied(record) => Some(record),
            Commit::ClaimLost => None,
        }
    }
}
