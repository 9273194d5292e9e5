//! Scoped rate-limit permits.
//!
//! A step that calls a limited service holds one [`ServicePermit`] for the
//! whole external call. The permit covers both the tenant and the global
//! counter; both must grant or neither is held.
//!
//! Units are recorded against the claim token ([`LimitHolder`]). If the
//! process dies before `release`, the reaper frees them by that token.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::app::wake::WakeSignal;
use crate::domain::{Acquire, LimitHolder, LimitKey, ServiceName, TenantId};
use crate::error::StoreError;
use crate::ports::RateLimitLedger;

pub struct ServicePermit {
    ledger: Arc<dyn RateLimitLedger>,
    wake: WakeSignal,
    holder: LimitHolder,

    /// Keys that were counted and must be released.
    held: Vec<LimitKey>,
}

impl ServicePermit {
    /// Acquire tenant then global capacity for `service`. `Ok(None)` when
    /// either is denied; nothing stays held in that case.
    pub async fn acquire(
        ledger: Arc<dyn RateLimitLedger>,
        wake: WakeSignal,
        tenant: &TenantId,
        service: &ServiceName,
        holder: LimitHolder,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, StoreError> {
        let mut permit = Self {
            ledger,
            wake,
            holder,
            held: Vec::with_capacity(2),
        };
        for key in [
            LimitKey::tenant(tenant.clone(), service.clone()),
            LimitKey::global(service.clone()),
        ] {
            let acquired = match permit.ledger.try_acquire(&key, &permit.holder, now).await {
                Ok(acquired) => acquired,
                Err(err) => {
                    permit.release().await;
                    return Err(err);
                }
            };
            match acquired {
                Acquire::Granted => permit.held.push(key),
                Acquire::Unlimited => {}
                Acquire::Denied => {
                    tracing::debug!(key = %key, "rate limit denied");
                    permit.release().await;
                    return Ok(None);
                }
            }
        }
        Ok(Some(permit))
    }

    pub fn held(&self) -> &[LimitKey] {
        &self.held
    }

    pub fn holder(&self) -> &LimitHolder {
        &self.holder
    }

    /// Give the capacity back. Release errors are logged; a hold left
    /// behind is freed by the reaper once the claim goes stale.
    pub async fn release(mut self) {
        let held = std::mem::take(&mut self.held);
        release_keys(self.ledger.as_ref(), &self.holder, &held).await;
        if !held.is_empty() {
            self.wake.notify();
        }
    }
}

async fn release_keys(ledger: &dyn RateLimitLedger, holder: &LimitHolder, keys: &[LimitKey]) {
    for key in keys.iter().rev() {
        if let Err(err) = ledger.release(key, holder).await {
            tracing::error!(key = %key, error = %err, "rate limit release failed");
        }
    }
}

impl Drop for ServicePermit {
    /// Fallback for a permit dropped without `release` (cancelled future,
    /// panicking handler): release on a spawned task.
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        let ledger = Arc::clone(&self.ledger);
        let wake = self.wake.clone();
        let holder = self.holder.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_keys(ledger.as_ref(), &holder, &held).await;
                    wake.notify();
                });
            }
            Err(_) => {
                tracing::error!(keys = ?held, "permit dropped outside a runtime; holds left for the reaper");
            }
        }
    }
}
