//! TaskStore port: the single source of truth for task status.
//!
//! # Rules every implementation follows
//! - `claim_next` is one atomic step: concurrent callers never receive the
//!   same task, and contention moves on to the next candidate instead of
//!   waiting behind a lock.
//! - Every write after a claim is conditional on the claim token
//!   `(task_id, claimed_by, claimed_at, phase = processing)`. A write whose
//!   token no longer matches returns [`Commit::ClaimLost`] and changes nothing.
//! - No call holds a transaction open across an await in the caller. The
//!   external step always runs with nothing open in the store.
//!
//! # Claim flow
//! ```text
//! tenant_marks(now) -> fairness order -> claim_next(tenant)
//!     -> step runs (no store state held)
//!     -> advance | record_failure | release_claim   (token-checked)
//! find_stale(cutoff) -> record_failure              (reaper, token-checked)
//! ```
//!
//! # Eligibility
//! A row is eligible when it is `queued`, or `failed` with `next_retry_at`
//! at or before `now`. `awaiting_review` rows are only moved by
//! `approve_review`.
//!
//! # Ordering inside a tenant
//! `priority` descending, then `created_at` ascending, then id. Across
//! tenants the order comes from [`TenantMark`], not from the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Claim, Commit, StageName, TaskId, TaskRecord, TaskStatus, Tenant, TenantId, WorkerId,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;

/// A tenant with eligible work, and when it was last served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMark {
    pub tenant_id: TenantId,

    /// Max `claimed_at` over all of the tenant's tasks. `None` if none of its
    /// tasks was ever claimed.
    pub last_claimed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or update a tenant. Tenant ids starting with `*` are reserved.
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    /// Persist a new task row. The tenant must exist.
    async fn insert_task(&self, record: &TaskRecord) -> Result<(), StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Tenants that have at least one eligible task at `now`.
    async fn tenant_marks(&self, now: DateTime<Utc>) -> Result<Vec<TenantMark>, StoreError>;

    /// Atomically claim the tenant's best eligible task (priority desc,
    /// created_at asc). `Ok(None)` when nothing is eligible.
    async fn claim_next(
        &self,
        tenant: &TenantId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, StoreError>;

    /// Hand the task back to `queued` on the same stage. The retry budget
    /// is not touched.
    async fn release_claim(&self, claim: &Claim, now: DateTime<Utc>)
    -> Result<Commit, StoreError>;

    /// Move the task to `target` and merge result fields into its payload.
    async fn advance(
        &self,
        claim: &Claim,
        target: &TaskStatus,
        fields: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError>;

    /// Increment `retry_count` and record `error`. `next_retry_at == None`
    /// finalizes the task (`failed_final`).
    async fn record_failure(
        &self,
        claim: &Claim,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError>;

    /// Claims on `processing` rows whose `claimed_at` is older than `cutoff`.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Claim>, StoreError>;

    /// Move a task held at `gate` to `target`. `Ok(None)` when the task is
    /// not awaiting review at that gate.
    async fn approve_review(
        &self,
        id: TaskId,
        gate: &StageName,
        target: &TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Earliest `next_retry_at` among failed tasks still waiting.
    async fn earliest_retry_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}

/// Tenant ids beginning with `*` collide with the global ledger scope.
pub(crate) fn check_tenant_id(tenant: &Tenant) -> Result<(), StoreError> {
    if tenant.id.as_str().is_empty() || tenant.id.as_str().starts_with('*') {
        return Err(StoreError::InvalidTenant(tenant.id.clone()));
    }
    Ok(())
}
