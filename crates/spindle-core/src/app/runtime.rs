//! Shared wiring for the worker, reaper and orchestrator surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::app::fairness::FairnessScheduler;
use crate::app::observer_hub::ObserverHub;
use crate::app::registry::StepRegistry;
use crate::app::retry::{Decider, Decision};
use crate::app::wake::WakeSignal;
use crate::domain::{Claim, Commit, FailureExit, Phase, Pipeline, StepFailure, TaskRecord, TaskStatus};
use crate::error::StoreError;
use crate::ports::{
    Alert, Clock, CredentialProvider, IdGenerator, RateLimitLedger, StatusChange, TaskStore,
};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Fallback poll when no wake signal arrives.
    pub poll_interval: Duration,

    /// Default step timeout; stages may override it.
    pub step_timeout: Duration,

    /// Reconnect backoff after a store error, doubling up to `store_retry_max`.
    pub store_retry_base: Duration,
    pub store_retry_max: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            step_timeout: Duration::from_secs(300),
            store_retry_base: Duration::from_millis(500),
            store_retry_max: Duration::from_secs(30),
        }
    }
}

impl WorkerSettings {
    /// Delay after the `failures`-th consecutive store error.
    pub fn store_backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.store_retry_base
            .saturating_mul(1u32 << shift)
            .min(self.store_retry_max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaperSettings {
    pub interval: Duration,

    /// Claims older than this are presumed dead. Must exceed the longest
    /// step timeout.
    pub stale_after: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(900),
        }
    }
}

/// Everything a worker or the reaper needs, shared behind one `Arc`.
pub struct Runtime {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) ledger: Arc<dyn RateLimitLedger>,
    pub(crate) pipeline: Pipeline,
    pub(crate) registry: StepRegistry,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) observers: ObserverHub,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) wake: WakeSignal,
    pub(crate) fairness: FairnessScheduler,
    pub(crate) worker: WorkerSettings,
    pub(crate) reaper: ReaperSettings,
}

impl Runtime {
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn worker_settings(&self) -> &WorkerSettings {
        &self.worker
    }

    pub fn reaper_settings(&self) -> &ReaperSettings {
        &self.reaper
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Apply a failure to a held claim: decide retry or final, write it
    /// under the claim token, then notify.
    pub(crate) async fn fail_claim(
        &self,
        claim: &Claim,
        failure: &StepFailure,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError> {
        let exit = self
            .pipeline
            .stage(&claim.stage)
            .map(|stage| stage.failure)
            .unwrap_or(FailureExit::Final);
        let decision = self.decider.decide(claim.retry_count, failure, exit, now);

        let commit = self
            .store
            .record_failure(claim, &failure.message, decision.next_retry_at(), now)
            .await?;
        let Commit::Applied(record) = &commit else {
            return Ok(commit);
        };

        match &decision {
            Decision::Retry { delay, .. } => {
                tracing::warn!(
                    retry_count = record.retry_count,
                    retry_in = ?delay,
                    error = %failure.message,
                    "step failed; retry scheduled"
                );
                // idle workers recompute their wait against the new retry time
                self.wake.notify_all();
            }
            Decision::MarkFinal { reason } => {
                tracing::error!(
                    retry_count = record.retry_count,
                    reason = %reason,
                    error = %failure.message,
                    "step failed final"
                );
            }
        }
        self.publish(Some(processing(claim)), record);
        Ok(commit)
    }

    /// Fire observers for a committed claim.
    pub(crate) fn publish_claim(&self, claim: &Claim) {
        self.observers.publish(StatusChange {
            task_id: claim.task_id,
            tenant_id: claim.tenant_id.clone(),
            from: Some(claim.from_status()),
            to: processing(claim),
            retry_count: claim.retry_count,
            last_error: claim.last_error.clone(),
            next_retry_at: None,
            at: claim.claimed_at,
        });
    }

    /// Fire observers for a committed write, plus the final-failure alert.
    pub(crate) fn publish(&self, from: Option<TaskStatus>, record: &TaskRecord) {
        if record.phase == Phase::FailedFinal {
            self.observers.alert(Alert::TaskFailedFinal {
                task_id: record.id,
                tenant_id: record.tenant_id.clone(),
                stage: record.stage.clone(),
                retry_count: record.retry_count,
                error: record.last_error.clone().unwrap_or_default(),
            });
        }
        self.observers.publish(StatusChange {
            task_id: record.id,
            tenant_id: record.tenant_id.clone(),
            from,
            to: record.status(),
            retry_count: record.retry_count,
            last_error: record.last_error.clone(),
            next_retry_at: record.next_retry_at,
            at: record.updated_at,
        });
    }
}

pub(crate) fn processing(claim: &Claim) -> TaskStatus {
    TaskStatus::new(claim.stage.clone(), Phase::Processing)
}
