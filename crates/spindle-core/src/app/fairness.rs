//! Tenant fairness: least-recently-served first.
//!
//! Recomputed from store rows on every pass, so there is no cursor to lose
//! across restarts or to share between instances.

use chrono::{DateTime, Utc};

use crate::domain::TenantId;
use crate::ports::TenantMark;

#[derive(Debug, Clone, Copy, Default)]
pub struct FairnessScheduler;

impl FairnessScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Candidates in serving order: oldest `last_claimed_at` first (never
    /// claimed counts as epoch zero), ties broken by lowest tenant id.
    ///
    /// Workers walk this list and claim from the first tenant that still has
    /// work when the claim lands.
    pub fn order(&self, mut marks: Vec<TenantMark>) -> Vec<TenantId> {
        marks.sort_by(|a, b| {
            served_at(a)
                .cmp(&served_at(b))
                .then_with(|| a.tenant_id.cmp(&b.tenant_id))
        });
        marks.into_iter().map(|m| m.tenant_id).collect()
    }

    pub fn next_tenant(&self, marks: Vec<TenantMark>) -> Option<TenantId> {
        self.order(marks).into_iter().next()
    }
}

fn served_at(mark: &TenantMark) -> DateTime<Utc> {
    mark.last_claimed_at.unwrap_or(DateTime::UNIX_EPOCH)
}
