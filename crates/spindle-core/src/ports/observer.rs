//! Status observers and alerting: fire-and-forget seams.
//!
//! Observers run after a status write has committed. Their failures never
//! roll back or block that write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{StageName, TaskId, TaskStatus, TenantId};

/// One committed status transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub tenant_id: TenantId,

    /// `None` for a freshly submitted task.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

#[async_trait]
pub trait StatusObserver: Send + Sync {
    /// Used in logs and alerts.
    fn name(&self) -> &str;

    async fn on_status(&self, change: &StatusChange) -> Result<(), ObserverError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// A task reached `failed_final` and needs manual intervention.
    TaskFailedFinal {
        task_id: TaskId,
        tenant_id: TenantId,
        stage: StageName,
        retry_count: u32,
        error: String,
    },

    /// An observer gave up delivering a status change.
    ObserverExhausted {
        observer: String,
        task_id: TaskId,
        attempts: u32,
        error: String,
    },
}

#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, alert: Alert);
}

/// Alerts as `error` level log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, alert: Alert) {
        match &alert {
            Alert::TaskFailedFinal {
                task_id,
                tenant_id,
                stage,
                retry_count,
                error,
            } => tracing::error!(
                task_id = %task_id,
                tenant = %tenant_id,
                stage = %stage,
                retry_count,
                error = %error,
                "task failed final"
            ),
            Alert::ObserverExhausted {
                observer,
                task_id,
                attempts,
                error,
            } => tracing::error!(
                observer = %observer,
                task_id = %task_id,
                attempts,
                error = %error,
                "status observer gave up"
            ),
        }
    }
}
