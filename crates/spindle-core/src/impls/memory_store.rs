//! In-memory task store (development and tests).
//!
//! One tokio `Mutex` guards every row, so each trait call is atomic with
//! respect to every other. Nothing is held across the caller's awaits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Claim, Commit, Phase, StageName, TaskId, TaskRecord, TaskStatus, Tenant, TenantId, WorkerId,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::task_store::{TaskStore, TenantMark, check_tenant_id};

#[derive(Default)]
struct InMemoryStoreState {
    tenants: BTreeMap<TenantId, Tenant>,

    /// All task records (single source of truth for tasks).
    records: HashMap<TaskId, TaskRecord>,
}

impl InMemoryStoreState {
    /// Best eligible task for `tenant`: priority desc, then created_at asc,
    /// then id asc so the order is total.
    fn best_candidate(&self, tenant: &TenantId, now: DateTime<Utc>) -> Option<TaskId> {
        self.records
            .values()
            .filter(|r| &r.tenant_id == tenant && r.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|r| r.id)
    }

    /// Row still carrying `claim`, or `None` if the claim was lost.
    fn held(&mut self, claim: &Claim) -> Option<&mut TaskRecord> {
        self.records
            .get_mut(&claim.task_id)
            .filter(|r| r.is_held_by(claim))
    }

    fn counts_by_phase(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            counts.add(record.phase, 1);
        }
        counts
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        check_tenant_id(tenant)?;
        let mut state = self.state.lock().await;
        state.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tenants.get(id).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tenants.values().cloned().collect())
    }

    async fn insert_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&record.tenant_id) {
            return Err(StoreError::UnknownTenant(record.tenant_id.clone()));
        }
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn tenant_marks(&self, now: DateTime<Utc>) -> Result<Vec<TenantMark>, StoreError> {
        let state = self.state.lock().await;
        let mut marks: BTreeMap<TenantId, (bool, Option<DateTime<Utc>>)> = BTreeMap::new();
        for record in state.records.values() {
            let entry = marks.entry(record.tenant_id.clone()).or_default();
            entry.0 |= record.is_eligible(now);
            entry.1 = entry.1.max(record.claimed_at);
        }
        Ok(marks
            .into_iter()
            .filter(|(_, (eligible, _))| *eligible)
            .map(|(tenant_id, (_, last_claimed_at))| TenantMark {
                tenant_id,
                last_claimed_at,
            })
            .collect())
    }

    async fn claim_next(
        &self,
        tenant: &TenantId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task_id) = state.best_candidate(tenant, now) else {
            return Ok(None);
        };
        Ok(state
            .records
            .get_mut(&task_id)
            .map(|record| record.start_claim(worker, now)))
    }

    async fn release_claim(
        &self,
        claim: &Claim,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError> {
        let mut state = self.state.lock().await;
        Ok(match state.held(claim) {
            Some(record) => {
                record.release(now);
                Commit::Applied(record.clone())
            }
            None => Commit::ClaimLost,
        })
    }

    async fn advance(
        &self,
        claim: &Claim,
        target: &TaskStatus,
        fields: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError> {
        let mut state = self.state.lock().await;
        Ok(match state.held(claim) {
            Some(record) => {
                record.advance(target.clone(), fields, now);
                Commit::Applied(record.clone())
            }
            None => Commit::ClaimLost,
        })
    }

    async fn record_failure(
        &self,
        claim: &Claim,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError> {
        let mut state = self.state.lock().await;
        Ok(match state.held(claim) {
            Some(record) => {
                record.fail(error.to_string(), next_retry_at, now);
                Commit::Applied(record.clone())
            }
            None => Commit::ClaimLost,
        })
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Claim>, StoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Claim> = state
            .records
            .values()
            .filter(|r| r.phase == Phase::Processing)
            .filter_map(|r| match (r.claimed_by, r.claimed_at) {
                (Some(worker), Some(at)) if at < cutoff => Some(Claim::new(r, worker, at)),
                _ => None,
            })
            .collect();
        stale.sort_by_key(|c| c.claimed_at);
        Ok(stale)
    }

    async fn approve_review(
        &self,
        id: TaskId,
        gate: &StageName,
        target: &TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if record.phase != Phase::AwaitingReview || &record.stage != gate {
            return Ok(None);
        }
        record.advance(target.clone(), &serde_json::Map::new(), now);
        Ok(Some(record.clone()))
    }

    async fn earliest_retry_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.phase == Phase::Failed)
            .filter_map(|r| r.next_retry_at)
            .min())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(state.counts_by_phase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn new_id() -> TaskId {
        TaskId::from_ulid(ulid::Ulid::new())
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(ulid::Ulid::new())
    }

    async fn seeded() -> InMemoryTaskStore {
        let store = InMemoryTaskStore::new();
        store.upsert_tenant(&Tenant::new("acme", "Acme")).await.unwrap();
        store.upsert_tenant(&Tenant::new("beta", "Beta")).await.unwrap();
        store
    }

    async fn insert(
        store: &InMemoryTaskStore,
        tenant: &str,
        priority: i32,
        at: DateTime<Utc>,
    ) -> TaskId {
        let id = new_id();
        let record = TaskRecord::new(
            id,
            NewTask::new(tenant).with_priority(priority),
            tenant.to_uppercase(),
            StageName::new("script"),
            at,
        );
        store.insert_task(&record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn claims_by_priority_then_age() {
        let store = seeded().await;
        let old_low = insert(&store, "acme", 0, t0()).await;
        let new_high = insert(&store, "acme", 5, t0() + Duration::seconds(10)).await;
        let newer_low = insert(&store, "acme", 0, t0() + Duration::seconds(20)).await;

        let now = t0() + Duration::minutes(1);
        let tenant = TenantId::new("acme");
        let order: Vec<TaskId> = [
            store.claim_next(&tenant, worker(), now).await.unwrap(),
            store.claim_next(&tenant, worker(), now).await.unwrap(),
            store.claim_next(&tenant, worker(), now).await.unwrap(),
        ]
        .into_iter()
        .map(|c| c.unwrap().task_id)
        .collect();

        assert_eq!(order, vec![new_high, old_low, newer_low]);
        assert!(store.claim_next(&tenant, worker(), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_only_sees_own_tenant() {
        let store = seeded().await;
        insert(&store, "beta", 0, t0()).await;

        let claim = store
            .claim_next(&TenantId::new("acme"), worker(), t0())
            .await
            .unwrap();
        assert!(claim.is_none());
    }

    #[tokio::test]
    async fn write_with_stale_token_is_claim_lost() {
        let store = seeded().await;
        let id = insert(&store, "acme", 0, t0()).await;
        let tenant = TenantId::new("acme");

        let first = store.claim_next(&tenant, worker(), t0()).await.unwrap().unwrap();
        store.release_claim(&first, t0()).await.unwrap();
        let second = store
            .claim_next(&tenant, worker(), t0() + Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.task_id, id);

        let lost = store
            .record_failure(&first, "late", None, t0() + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(lost, Commit::ClaimLost);

        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.phase, Phase::Processing);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn tenant_marks_report_last_claim_for_eligible_tenants() {
        let store = seeded().await;
        insert(&store, "acme", 0, t0()).await;
        insert(&store, "acme", 0, t0()).await;
        insert(&store, "beta", 0, t0()).await;

        let claimed_at = t0() + Duration::seconds(5);
        store
            .claim_next(&TenantId::new("acme"), worker(), claimed_at)
            .await
            .unwrap()
            .unwrap();

        let marks = store.tenant_marks(claimed_at).await.unwrap();
        assert_eq!(
            marks,
            vec![
                TenantMark {
                    tenant_id: TenantId::new("acme"),
                    last_claimed_at: Some(claimed_at),
                },
                TenantMark {
                    tenant_id: TenantId::new("beta"),
                    last_claimed_at: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_task() {
        let store = seeded().await;
        for _ in 0..20 {
            insert(&store, "acme", 0, t0()).await;
        }

        let mut joins = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(claim) = store
                    .claim_next(&TenantId::new("acme"), worker(), t0())
                    .await
                    .unwrap()
                {
                    got.push(claim.task_id);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for join in joins {
            all.extend(join.await.unwrap());
        }
        let distinct: HashSet<TaskId> = all.iter().copied().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(distinct.len(), 20);
    }

    #[tokio::test]
    async fn reserved_tenant_ids_are_rejected() {
        let store = InMemoryTaskStore::new();
        let err = store
            .upsert_tenant(&Tenant::new("*global*", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTenant(_)));
    }

    #[tokio::test]
    async fn insert_for_unknown_tenant_fails() {
        let store = InMemoryTaskStore::new();
        let record = TaskRecord::new(
            new_id(),
            NewTask::new("ghost"),
            "Ghost".into(),
            StageName::new("script"),
            t0(),
        );
        let err = store.insert_task(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownTenant(_)));
    }
}
