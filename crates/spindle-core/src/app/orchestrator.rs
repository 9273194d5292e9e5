//! Orchestrator: the surface callers use to feed and watch the queue.

use std::sync::Arc;

use crate::app::reaper_loop::{ReaperHandle, ReaperLoop};
use crate::app::runtime::Runtime;
use crate::app::status::TaskView;
use crate::app::wake::WakeSignal;
use crate::app::worker_loop::{WorkerGroup, WorkerLoop};
use crate::domain::{LimitKey, NewTask, Phase, Pipeline, TaskId, TaskRecord, Tenant};
use crate::error::{SpindleError, StoreError};
use crate::observability::QueueCounts;

#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<Runtime>,
}

impl Orchestrator {
    pub(crate) fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.runtime.pipeline
    }

    pub fn wake_signal(&self) -> WakeSignal {
        self.runtime.wake.clone()
    }

    /// Insert or update a tenant and apply its per-service ceilings to the
    /// ledger. In-flight counts are kept.
    pub async fn register_tenant(&self, tenant: &Tenant) -> Result<(), SpindleError> {
        let rt = &self.runtime;
        rt.store.upsert_tenant(tenant).await?;
        for (service, max) in &tenant.limits {
            let key = LimitKey::tenant(tenant.id.clone(), service.clone());
            rt.ledger.set_limit(&key, *max, rt.now()).await?;
        }
        tracing::info!(tenant = %tenant.id, limits = tenant.limits.len(), "tenant registered");
        Ok(())
    }

    /// Queue a new task at the pipeline's entry stage.
    pub async fn submit(&self, new: NewTask) -> Result<TaskId, SpindleError> {
        let rt = &self.runtime;
        let tenant = rt
            .store
            .get_tenant(&new.tenant_id)
            .await?
            .ok_or_else(|| StoreError::UnknownTenant(new.tenant_id.clone()))?;

        let id = rt.ids.generate_task_id();
        let record = TaskRecord::new(
            id,
            new,
            tenant.name,
            rt.pipeline.entry().name().clone(),
            rt.now(),
        );
        rt.store.insert_task(&record).await?;

        tracing::info!(task_id = %id, tenant = %record.tenant_id, "task submitted");
        rt.wake.notify();
        rt.publish(None, &record);
        Ok(id)
    }

    /// Release a task held at a review gate to the gate's success exit.
    pub async fn approve_review(&self, id: TaskId) -> Result<TaskRecord, SpindleError> {
        let rt = &self.runtime;
        let record = rt
            .store
            .get_task(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        if record.phase != Phase::AwaitingReview {
            return Err(SpindleError::NotAwaitingReview(id));
        }

        let target = rt.pipeline.approval_target(&record.stage)?;
        let approved = rt
            .store
            .approve_review(id, &record.stage, &target, rt.now())
            .await?
            .ok_or(SpindleError::NotAwaitingReview(id))?;

        tracing::info!(task_id = %id, gate = %record.stage, to = %target, "review approved");
        if approved.phase == Phase::Queued {
            rt.wake.notify();
        }
        rt.publish(Some(record.status()), &approved);
        Ok(approved)
    }

    pub async fn status(&self, id: TaskId) -> Result<Option<TaskView>, SpindleError> {
        Ok(self.runtime.store.get_task(id).await?.map(TaskView::from))
    }

    pub async fn counts(&self) -> Result<QueueCounts, SpindleError> {
        Ok(self.runtime.store.counts().await?)
    }

    /// A single worker with a fresh id; drive it with `run_once` or `run`.
    pub fn worker(&self) -> WorkerLoop {
        WorkerLoop::new(self.runtime.ids.generate_worker_id(), Arc::clone(&self.runtime))
    }

    pub fn spawn_workers(&self, n: usize) -> WorkerGroup {
        WorkerGroup::spawn(n, Arc::clone(&self.runtime))
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(Arc::clone(&self.runtime))
    }

    pub fn spawn_reaper(&self) -> ReaperHandle {
        ReaperHandle::spawn(Arc::clone(&self.runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::OrchestratorBuilder;
    use crate::domain::{PipelineBuilder, ServiceName, StageName, StepOutcome, TaskStatus};
    use crate::impls::InMemoryLedger;
    use crate::ports::{
        ObserverError, RateLimitLedger, StatusChange, StatusObserver, StepContext, StepHandler,
    };
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct Noop;

    #[async_trait]
    impl StepHandler for Noop {
        async fn run(&self, _ctx: StepContext) -> StepOutcome {
            StepOutcome::success()
        }
    }

    #[derive(Default)]
    struct Board(Mutex<Vec<StatusChange>>);

    #[async_trait]
    impl StatusObserver for Board {
        fn name(&self) -> &str {
            "board"
        }

        async fn on_status(&self, change: &StatusChange) -> Result<(), ObserverError> {
            self.0.lock().await.push(change.clone());
            Ok(())
        }
    }

    fn gated(board: Arc<Board>) -> Orchestrator {
        OrchestratorBuilder::new()
            .pipeline(
                PipelineBuilder::new()
                    .step("script")
                    .review_gate("review")
                    .step("upload")
                    .build()
                    .unwrap(),
            )
            .handler("script", Arc::new(Noop))
            .unwrap()
            .handler("upload", Arc::new(Noop))
            .unwrap()
            .observer(board)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn submit_for_unknown_tenant_fails() {
        let orch = gated(Arc::default());
        let err = orch.submit(NewTask::new("ghost")).await.unwrap_err();
        assert!(matches!(err, SpindleError::Store(StoreError::UnknownTenant(_))));
    }

    #[tokio::test]
    async fn review_gate_holds_until_approved() {
        let board = Arc::new(Board::default());
        let orch = gated(board.clone());
        orch.register_tenant(&Tenant::new("acme", "Acme")).await.unwrap();
        let id = orch.submit(NewTask::new("acme")).await.unwrap();
        let worker = orch.worker();

        worker.run_once().await.unwrap();
        let view = orch.status(id).await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::AwaitingReview);
        assert_eq!(
            worker.run_once().await.unwrap(),
            crate::app::worker_loop::RunOnce::Idle
        );

        let approved = orch.approve_review(id).await.unwrap();
        assert_eq!(approved.status(), TaskStatus::queued(StageName::new("upload")));
        assert!(matches!(
            orch.approve_review(id).await,
            Err(SpindleError::NotAwaitingReview(_))
        ));

        worker.run_once().await.unwrap();
        assert_eq!(orch.counts().await.unwrap().published, 1);

        // deliveries are spawned; give them a moment to land
        for _ in 0..50 {
            if board.0.lock().await.len() >= 6 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let changes = board.0.lock().await;
        assert_eq!(changes.len(), 6);
        assert!(changes.iter().any(|c| c.from.is_none()));
        assert!(changes.iter().any(|c| {
            c.to == TaskStatus::new(StageName::new("script"), Phase::Processing)
                && c.from == Some(TaskStatus::queued(StageName::new("script")))
        }));
        assert!(changes.iter().any(|c| c.to.phase == Phase::AwaitingReview));
        assert!(changes.iter().any(|c| c.to.phase == Phase::Published));
    }

    #[tokio::test]
    async fn tenant_limits_reach_the_ledger() {
        let ledger = InMemoryLedger::default();
        let orch = OrchestratorBuilder::new()
            .ledger(ledger.clone())
            .pipeline(PipelineBuilder::new().step("script").build().unwrap())
            .handler("script", Arc::new(Noop))
            .unwrap()
            .build()
            .unwrap();
        orch.register_tenant(&Tenant::new("acme", "Acme").with_limit("video_api", 2))
            .await
            .unwrap();

        let key = LimitKey::tenant("acme".into(), ServiceName::new("video_api"));
        let counter = ledger.counter(&key).await.unwrap().unwrap();
        assert_eq!(counter.max_concurrent, 2);
        assert_eq!(counter.current_count, 0);
    }
}
