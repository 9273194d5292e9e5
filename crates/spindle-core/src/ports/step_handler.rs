//! StepHandler port: the external work behind one pipeline stage.

use async_trait::async_trait;

use crate::domain::{StageName, StepOutcome, TaskId, TenantId};
use crate::ports::credentials::Credentials;

/// What a handler gets to see of the claimed task.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: TaskId,
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub stage: StageName,

    /// 1 on the first run, `retry_count + 1` afterwards.
    pub attempt: u32,
    pub payload: serde_json::Value,
    pub credentials: Option<Credentials>,
}

/// Handlers must be safe to run more than once for the same task: a worker
/// can die after the external call but before its status write.
///
/// Failures are returned as [`StepOutcome::Failure`], never panics.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: StepContext) -> StepOutcome;
}
