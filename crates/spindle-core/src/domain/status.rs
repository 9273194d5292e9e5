//! Task status: a pipeline stage paired with a phase.
//!
//! A long linear pipeline would otherwise need one enum variant per
//! "stage N queued / stage N processing / ..." combination. Splitting the
//! status into `(stage, phase)` keeps the enum small and lets the pipeline
//! graph (see [`crate::domain::pipeline`]) own the ordering of stages.
//!
//! # Phase transitions
//! - Queued -> Processing (claim)
//! - Processing -> Queued (rate-limit denial, same stage, no retry penalty)
//! - Processing -> Queued of the next stage | AwaitingReview | Published (success)
//! - Processing -> Failed (transient failure, retry scheduled)
//! - Processing -> FailedFinal (terminal failure or retries exhausted)
//! - Failed -> Processing (claim once `next_retry_at <= now`)
//! - AwaitingReview -> Queued of the next stage | Published (external approval)
//!
//! Every transition out of `processing` is written under the claim token;
//! the rest are unconditional single-row writes.
//!
//! # Columns per phase
//! | phase            | `claimed_by` | `next_retry_at` |
//! |------------------|--------------|-----------------|
//! | queued           | none         | none            |
//! | processing       | the worker   | kept from claim |
//! | failed           | none         | set             |
//! | awaiting_review  | none         | none            |
//! | published        | none         | none            |
//! | failed_final     | none         | none            |
//!
//! `claimed_at` is never cleared: it records when the task was last served
//! and feeds the fairness order.
//!
//! # Example
//! ```
//! use spindle_core::domain::{Phase, StageName, TaskStatus};
//!
//! let status = TaskStatus::queued(StageName::new("render"));
//! assert_eq!(status.to_string(), "render:queued");
//! assert!(!status.phase.is_terminal());
//! assert_eq!(Phase::parse("failed_final"), Some(Phase::FailedFinal));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::StageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Eligible for claim.
    Queued,

    /// Owned by exactly one worker (`claimed_by`, `claimed_at`).
    Processing,

    /// Recoverable failure; eligible again once `next_retry_at` has passed.
    Failed,

    /// Held at a review gate. Workers never claim out of this phase.
    AwaitingReview,

    /// Terminal success.
    Published,

    /// Terminal failure; needs manual intervention.
    FailedFinal,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Queued,
        Phase::Processing,
        Phase::Failed,
        Phase::AwaitingReview,
        Phase::Published,
        Phase::FailedFinal,
    ];

    /// No further transition happens without manual intervention.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Published | Phase::FailedFinal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Processing => "processing",
            Phase::Failed => "failed",
            Phase::AwaitingReview => "awaiting_review",
            Phase::Published => "published",
            Phase::FailedFinal => "failed_final",
        }
    }

    /// Inverse of [`Phase::as_str`]; the storage encoding.
    pub fn parse(s: &str) -> Option<Self> {
        Phase::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task sits in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskStatus {
    pub stage: StageName,
    pub phase: Phase,
}

impl TaskStatus {
    pub fn new(stage: StageName, phase: Phase) -> Self {
        Self { stage, phase }
    }

    pub fn queued(stage: StageName) -> Self {
        Self::new(stage, Phase::Queued)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.phase)
    }
}
