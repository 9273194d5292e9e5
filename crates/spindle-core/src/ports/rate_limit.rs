//! RateLimitLedger port: durable compare-and-increment counters per
//! (tenant or global, service).
//!
//! # Holds
//! Every granted unit is recorded against a [`LimitHolder`] (the claim
//! token of the task that asked). Releases go through the hold:
//! - `release` drops one hold and decrements only if the hold existed, so
//!   a second release of the same unit is a no-op
//! - `release_holder` drops every hold of a token; the reaper uses it for
//!   claims whose worker died
//!
//! # Example
//! ```ignore
//! let holder = claim.holder();
//! if ledger.try_acquire(&key, &holder, now).await? == Acquire::Granted {
//!     call_service().await;
//!     ledger.release(&key, &holder).await?;
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Acquire, LimitHolder, LimitKey, LimitScope, RateLimitCounter, ServiceName, TenantId,
};
use crate::error::StoreError;

#[async_trait]
pub trait RateLimitLedger: Send + Sync {
    /// Create the row or change its ceiling. `current_count` is kept, so a
    /// lowered ceiling can sit below the in-flight count; acquisitions are
    /// then denied until releases drain it.
    async fn set_limit(
        &self,
        key: &LimitKey,
        max_concurrent: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomic compare-and-increment, recorded against `holder`. A missing
    /// row is created from the configured [`LimitTable`]; a key with no
    /// configured ceiling is [`Acquire::Unlimited`]. A holder that already
    /// holds the key is granted without a second increment.
    async fn try_acquire(
        &self,
        key: &LimitKey,
        holder: &LimitHolder,
        now: DateTime<Utc>,
    ) -> Result<Acquire, StoreError>;

    /// Drop `holder`'s unit on `key`. Returns whether a hold existed; the
    /// count is only decremented (floored at zero) when it did.
    async fn release(&self, key: &LimitKey, holder: &LimitHolder) -> Result<bool, StoreError>;

    /// Drop every unit `holder` still has. Returns the keys released.
    async fn release_holder(&self, holder: &LimitHolder) -> Result<Vec<LimitKey>, StoreError>;

    async fn counter(&self, key: &LimitKey) -> Result<Option<RateLimitCounter>, StoreError>;
}

/// Configured ceilings used when a counter row is created lazily.
///
/// Lookup order for a tenant key: tenant override, then the per-tenant
/// default for the service. Global keys use the global table only.
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    global: HashMap<ServiceName, u32>,
    per_tenant: HashMap<ServiceName, u32>,
    overrides: HashMap<(TenantId, ServiceName), u32>,
}

impl LimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(mut self, service: impl Into<ServiceName>, max_concurrent: u32) -> Self {
        self.global.insert(service.into(), max_concurrent);
        self
    }

    pub fn per_tenant(mut self, service: impl Into<ServiceName>, max_concurrent: u32) -> Self {
        self.per_tenant.insert(service.into(), max_concurrent);
        self
    }

    pub fn tenant_override(
        mut self,
        tenant: impl Into<TenantId>,
        service: impl Into<ServiceName>,
        max_concurrent: u32,
    ) -> Self {
        self.overrides
            .insert((tenant.into(), service.into()), max_concurrent);
        self
    }

    pub fn max_for(&self, key: &LimitKey) -> Option<u32> {
        match &key.scope {
            LimitScope::Global => self.global.get(&key.service).copied(),
            LimitScope::Tenant(tenant) => self
                .overrides
                .get(&(tenant.clone(), key.service.clone()))
                .or_else(|| self.per_tenant.get(&key.service))
                .copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_override_wins_over_default() {
        let table = LimitTable::new()
            .global("video_api", 4)
            .per_tenant("video_api", 1)
            .tenant_override("acme", "video_api", 2);

        let svc = ServiceName::new("video_api");
        assert_eq!(table.max_for(&LimitKey::global(svc.clone())), Some(4));
        assert_eq!(
            table.max_for(&LimitKey::tenant(TenantId::new("acme"), svc.clone())),
            Some(2)
        );
        assert_eq!(
            table.max_for(&LimitKey::tenant(TenantId::new("other"), svc)),
            Some(1)
        );
        assert_eq!(
            table.max_for(&LimitKey::global(ServiceName::new("tts"))),
            None
        );
    }
}
