//! ReaperLoop: recover tasks whose worker died mid-step.
//!
//! Every `interval` it looks for `processing` rows whose `claimed_at` is
//! older than `stale_after` and fails them with a synthetic transient error
//! through the normal retry path. The write is conditional on the stale
//! claim token, so a task its worker finished in the meantime is left alone.
//!
//! Rate-limit units the dead worker still held are released by the same
//! token before the failure is written. A worker that did finish has already
//! dropped its holds, so that release finds nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::app::runtime::Runtime;
use crate::domain::{Claim, Commit, FailureCause, Phase, StepFailure};
use crate::error::StoreError;

pub const WORKER_LOST_MESSAGE: &str = "worker timeout or crash";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub found: usize,
    pub retried: usize,
    pub finalized: usize,

    /// Rate-limit units given back on behalf of dead workers.
    pub units_released: usize,

    /// Finished by their worker between the scan and the write.
    pub already_done: usize,
}

pub struct ReaperLoop {
    runtime: Arc<Runtime>,
}

impl ReaperLoop {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub async fn sweep_once(&self) -> Result<ReapReport, StoreError> {
        let rt = &self.runtime;
        let now = rt.now();
        let stale_after = chrono::Duration::from_std(rt.reaper.stale_after)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(stale_after).unwrap_or(now);

        let stale = rt.store.find_stale(cutoff).await?;
        let mut report = ReapReport {
            found: stale.len(),
            ..ReapReport::default()
        };

        for claim in stale {
            let span = tracing::info_span!(
                "reap",
                task_id = %claim.task_id,
                tenant = %claim.tenant_id,
                stage = %claim.stage,
                worker = %claim.worker,
            );
            let (freed, commit) = self.reap(&claim, now).instrument(span).await?;
            report.units_released += freed;
            match commit {
                Commit::Applied(record) if record.phase == Phase::FailedFinal => {
                    report.finalized += 1
                }
                Commit::Applied(_) => report.retried += 1,
                Commit::ClaimLost => report.already_done += 1,
            }
        }

        if report.found > 0 {
            tracing::info!(
                found = report.found,
                retried = report.retried,
                finalized = report.finalized,
                already_done = report.already_done,
                units_released = report.units_released,
                "reaper sweep"
            );
        }
        Ok(report)
    }

    /// Free the claim's rate-limit units, then fail it. Returns the number
    /// of units freed alongside the commit.
    async fn reap(&self, claim: &Claim, now: DateTime<Utc>) -> Result<(usize, Commit), StoreError> {
        tracing::warn!(claimed_at = %claim.claimed_at, "stale claim");
        let freed = self.runtime.ledger.release_holder(&claim.holder()).await?;
        if !freed.is_empty() {
            tracing::warn!(keys = ?freed, "released rate limit units of stale claim");
            self.runtime.wake.notify_all();
        }
        let failure = StepFailure::new(FailureCause::WorkerLost, WORKER_LOST_MESSAGE);
        let commit = self.runtime.fail_claim(claim, &failure, now).await?;
        Ok((freed.len(), commit))
    }

    /// Sweep every `interval` until `shutdown` flips to true. Store errors
    /// are logged and the next tick tries again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.runtime.reaper.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::error!(error = %err, "reaper sweep failed");
                    }
                }
            }
        }
    }
}

pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn spawn(runtime: Arc<Runtime>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(ReaperLoop::new(runtime).run(shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "reaper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::OrchestratorBuilder;
    use crate::app::runtime::ReaperSettings;
    use crate::domain::{NewTask, PipelineBuilder, StepOutcome, Tenant, WorkerId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::clock::Clock;
    use crate::ports::{FixedClock, StepContext, StepHandler, TaskStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::time::Duration;

    struct Done;

    #[async_trait]
    impl StepHandler for Done {
        async fn run(&self, _ctx: StepContext) -> StepOutcome {
            StepOutcome::success()
        }
    }

    #[tokio::test]
    async fn stale_claim_is_failed_through_retry_path() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = InMemoryTaskStore::new();
        let orch = OrchestratorBuilder::new()
            .clock(clock.clone())
            .store(store.clone())
            .pipeline(PipelineBuilder::new().step("render").build().unwrap())
            .handler("render", Arc::new(Done))
            .unwrap()
            .reaper_settings(ReaperSettings {
                interval: Duration::from_secs(60),
                stale_after: Duration::from_secs(600),
            })
            .build()
            .unwrap();
        orch.register_tenant(&Tenant::new("acme", "Acme")).await.unwrap();
        let id = orch.submit(NewTask::new("acme")).await.unwrap();

        // a worker claims and then vanishes
        let dead = WorkerId::from_ulid(ulid::Ulid::new());
        let claim = store
            .claim_next(&"acme".into(), dead, clock.now())
            .await
            .unwrap()
            .unwrap();

        clock.advance(chrono::Duration::seconds(599));
        assert_eq!(orch.reaper().sweep_once().await.unwrap().found, 0);

        clock.advance(chrono::Duration::seconds(2));
        let report = orch.reaper().sweep_once().await.unwrap();
        assert_eq!(report.retried, 1);

        let view = orch.status(id).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Failed);
        assert_eq!(view.retry_count, 1);
        assert_eq!(view.last_error.as_deref(), Some(WORKER_LOST_MESSAGE));

        // the dead worker's late commit is rejected
        let late = store
            .advance(&claim, &orch.pipeline().entry_status(), &Default::default(), clock.now())
            .await
            .unwrap();
        assert_eq!(late, Commit::ClaimLost);
    }

    #[tokio::test]
    async fn finished_task_is_not_reaped() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = InMemoryTaskStore::new();
        let orch = OrchestratorBuilder::new()
            .clock(clock.clone())
            .store(store.clone())
            .pipeline(PipelineBuilder::new().step("render").build().unwrap())
            .handler("render", Arc::new(Done))
            .unwrap()
            .build()
            .unwrap();
        orch.register_tenant(&Tenant::new("acme", "Acme")).await.unwrap();
        let id = orch.submit(NewTask::new("acme")).await.unwrap();

        orch.worker().run_once().await.unwrap();
        clock.advance(chrono::Duration::hours(2));

        let report = orch.reaper().sweep_once().await.unwrap();
        assert_eq!(report, ReapReport::default());
        let view = orch.status(id).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Published);
    }
}
