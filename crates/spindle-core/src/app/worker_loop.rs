//! WorkerLoop: claim -> permit -> step -> commit.
//!
//! # Flow of one pass
//! 1. `TaskStore::tenant_marks` + `FairnessScheduler::order` pick candidates
//! 2. `TaskStore::claim_next` takes the first tenant's best task; the
//!    claim is published to observers like any other committed write
//! 3. `ServicePermit::acquire` covers the stage's rate-limited service;
//!    denial hands the task back to `queued` without touching its retries
//! 4. The step handler runs under its timeout with nothing open in the store
//! 5. `advance` or the retry decision is written under the claim token
//!
//! Store errors fail closed: the worker stops claiming and backs off.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app::permit::ServicePermit;
use crate::app::runtime::{Runtime, processing};
use crate::domain::{Claim, Commit, Phase, StepFailure, StepOutcome, TaskId, TaskStatus, WorkerId};
use crate::error::StoreError;
use crate::ports::{StepContext, StepHandler};

/// Lower bound for an idle wait, so a retry time that is already due
/// cannot turn the loop into a spin.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Result of a single [`WorkerLoop::run_once`] pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOnce {
    /// No tenant had eligible work.
    Idle,

    /// The step ran and its result was committed.
    Completed { task_id: TaskId, status: TaskStatus },

    /// Rate limit denied; the task went back to `queued`.
    Deferred { task_id: TaskId },

    /// The claim was taken over (reaped) before the commit landed.
    ClaimLost { task_id: TaskId },
}

pub struct WorkerLoop {
    id: WorkerId,
    runtime: Arc<Runtime>,
}

impl WorkerLoop {
    pub fn new(id: WorkerId, runtime: Arc<Runtime>) -> Self {
        Self { id, runtime }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// One scheduling pass. Tenants are tried in fairness order; a tenant
    /// whose task is rate-limited is skipped in favour of the next one.
    pub async fn run_once(&self) -> Result<RunOnce, StoreError> {
        let rt = &self.runtime;
        let marks = rt.store.tenant_marks(rt.now()).await?;
        let mut deferred = None;

        for tenant in rt.fairness.order(marks) {
            let Some(claim) = rt.store.claim_next(&tenant, self.id, rt.now()).await? else {
                // contention: someone else got there first
                continue;
            };
            rt.publish_claim(&claim);
            let span = tracing::info_span!(
                "task",
                task_id = %claim.task_id,
                tenant = %claim.tenant_id,
                stage = %claim.stage,
                worker = %self.id,
            );
            match self.process(claim).instrument(span).await? {
                RunOnce::Deferred { task_id } => deferred = Some(task_id),
                done => return Ok(done),
            }
        }

        Ok(match deferred {
            Some(task_id) => RunOnce::Deferred { task_id },
            None => RunOnce::Idle,
        })
    }

    async fn process(&self, claim: Claim) -> Result<RunOnce, StoreError> {
        let rt = &self.runtime;
        tracing::debug!(attempt = claim.retry_count + 1, "claimed");

        let Some(stage) = rt.pipeline.stage(&claim.stage).cloned() else {
            let failure =
                StepFailure::terminal(format!("stage '{}' is not in the pipeline", claim.stage));
            return self.fail(&claim, failure).await;
        };
        let Some(handler) = rt.registry.get(&claim.stage).cloned() else {
            let failure =
                StepFailure::terminal(format!("no step handler for stage '{}'", claim.stage));
            return self.fail(&claim, failure).await;
        };

        let credentials = match rt.credentials.lookup(&claim.tenant_id).await {
            Ok(credentials) => credentials,
            Err(err) => {
                let failure = StepFailure::transient(format!("credentials unavailable: {err}"));
                return self.fail(&claim, failure).await;
            }
        };

        let permit = match &stage.spec.service {
            None => None,
            Some(service) => {
                let acquired = ServicePermit::acquire(
                    Arc::clone(&rt.ledger),
                    rt.wake.clone(),
                    &claim.tenant_id,
                    service,
                    claim.holder(),
                    rt.now(),
                )
                .await;
                match acquired {
                    Ok(Some(permit)) => Some(permit),
                    Ok(None) => return self.defer(&claim).await,
                    Err(err) => {
                        self.abandon(&claim).await;
                        return Err(err);
                    }
                }
            }
        };

        let ctx = StepContext {
            task_id: claim.task_id,
            tenant_id: claim.tenant_id.clone(),
            tenant_name: claim.tenant_name.clone(),
            stage: claim.stage.clone(),
            attempt: claim.retry_count + 1,
            payload: claim.payload.clone(),
            credentials,
        };
        let timeout = stage.spec.timeout.unwrap_or(rt.worker.step_timeout);
        let outcome = run_step(handler, ctx, timeout).await;
        if let Some(permit) = permit {
            permit.release().await;
        }

        match outcome {
            StepOutcome::Success { fields } => {
                let target = rt.pipeline.success_target(&stage);
                let commit = rt.store.advance(&claim, &target, &fields, rt.now()).await?;
                match commit {
                    Commit::Applied(record) => {
                        tracing::info!(to = %target, "step succeeded");
                        if record.phase == Phase::Queued {
                            rt.wake.notify();
                        }
                        rt.publish(Some(processing(&claim)), &record);
                        Ok(RunOnce::Completed {
                            task_id: record.id,
                            status: record.status(),
                        })
                    }
                    Commit::ClaimLost => Ok(self.claim_lost(&claim)),
                }
            }
            StepOutcome::Failure(failure) => self.fail(&claim, failure).await,
        }
    }

    async fn fail(&self, claim: &Claim, failure: StepFailure) -> Result<RunOnce, StoreError> {
        let rt = &self.runtime;
        match rt.fail_claim(claim, &failure, rt.now()).await? {
            Commit::Applied(record) => Ok(RunOnce::Completed {
                task_id: record.id,
                status: record.status(),
            }),
            Commit::ClaimLost => Ok(self.claim_lost(claim)),
        }
    }

    async fn defer(&self, claim: &Claim) -> Result<RunOnce, StoreError> {
        let rt = &self.runtime;
        match rt.store.release_claim(claim, rt.now()).await? {
            Commit::Applied(record) => {
                tracing::debug!("rate limited; task handed back to queued");
                rt.publish(Some(processing(claim)), &record);
                Ok(RunOnce::Deferred {
                    task_id: claim.task_id,
                })
            }
            Commit::ClaimLost => Ok(self.claim_lost(claim)),
        }
    }

    /// Best-effort hand-back after a store error; the reaper covers us if
    /// this fails too.
    async fn abandon(&self, claim: &Claim) {
        let rt = &self.runtime;
        if let Err(err) = rt.store.release_claim(claim, rt.now()).await {
            tracing::warn!(error = %err, "could not release claim; left for the reaper");
        }
    }

    fn claim_lost(&self, claim: &Claim) -> RunOnce {
        tracing::warn!("claim lost before commit; result discarded");
        RunOnce::ClaimLost {
            task_id: claim.task_id,
        }
    }

    /// How long to sleep when there was nothing to do: the poll interval,
    /// shortened to the earliest pending retry.
    async fn idle_wait(&self) -> Duration {
        let rt = &self.runtime;
        let poll = rt.worker.poll_interval;
        let wait = match rt.store.earliest_retry_at().await {
            Ok(Some(at)) => (at - rt.now()).to_std().map_or(Duration::ZERO, |d| d.min(poll)),
            Ok(None) => poll,
            Err(err) => {
                tracing::debug!(error = %err, "earliest_retry_at failed; using poll interval");
                poll
            }
        };
        wait.max(MIN_IDLE_WAIT.min(poll))
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let rt = Arc::clone(&self.runtime);
        let mut store_failures = 0u32;
        tracing::info!(worker = %self.id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(RunOnce::Completed { .. } | RunOnce::ClaimLost { .. }) => {
                    store_failures = 0;
                }
                Ok(RunOnce::Idle | RunOnce::Deferred { .. }) => {
                    store_failures = 0;
                    let wait = self.idle_wait().await;
                    tokio::select! {
                        changed = shutdown.changed() => if changed.is_err() { break },
                        _ = rt.wake.wait(wait) => {}
                    }
                }
                Err(err) => {
                    store_failures = store_failures.saturating_add(1);
                    let delay = rt.worker.store_backoff(store_failures);
                    tracing::error!(
                        worker = %self.id,
                        error = %err,
                        failures = store_failures,
                        retry_in = ?delay,
                        "store error; pausing claims"
                    );
                    tokio::select! {
                        changed = shutdown.changed() => if changed.is_err() { break },
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!(worker = %self.id, "worker stopped");
    }
}

/// Run the handler on its own task so a panic or a timeout becomes a
/// transient failure instead of taking the worker down.
async fn run_step(
    handler: Arc<dyn StepHandler>,
    ctx: StepContext,
    timeout: Duration,
) -> StepOutcome {
    let mut join = tokio::spawn(async move { handler.run(ctx).await });
    match tokio::time::timeout(timeout, &mut join).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => StepFailure::transient(format!("step handler crashed: {err}")).into(),
        Err(_) => {
            join.abort();
            StepFailure::timeout(format!("step timed out after {}s", timeout.as_secs_f64())).into()
        }
    }
}

/// Worker group handle.
/// - `request_shutdown` stops new claims; in-flight steps finish first
/// - `shutdown_and_join` waits for every worker
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers with fresh ids.
    pub fn spawn(n: usize, runtime: Arc<Runtime>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = WorkerLoop::new(runtime.ids.generate_worker_id(), Arc::clone(&runtime));
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker.run(rx)));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}
