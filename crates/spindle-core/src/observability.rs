use serde::{Deserialize, Serialize};

use crate::domain::Phase;

/// Task counts by phase, across all stages and tenants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub processing: usize,
    pub failed: usize,
    pub awaiting_review: usize,
    pub published: usize,
    pub failed_final: usize,
}

impl QueueCounts {
    pub fn add(&mut self, phase: Phase, n: usize) {
        match phase {
            Phase::Queued => self.queued += n,
            Phase::Processing => self.processing += n,
            Phase::Failed => self.failed += n,
            Phase::AwaitingReview => self.awaiting_review += n,
            Phase::Published => self.published += n,
            Phase::FailedFinal => self.failed_final += n,
        }
    }

    pub fn total(&self) -> usize {
        self.queued
            + self.processing
            + self.failed
            + self.awaiting_review
            + self.published
            + self.failed_final
    }

    /// Nothing left for workers: every task is terminal or parked at a gate.
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.processing == 0 && self.failed == 0
    }
}
