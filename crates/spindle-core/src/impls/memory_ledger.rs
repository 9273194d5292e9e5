//! In-memory rate limit ledger.
//!
//! Counters and holds sit behind one lock, so a grant and its hold (or a
//! release and its decrement) are never observed apart.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Acquire, LimitHolder, LimitKey, RateLimitCounter};
use crate::error::StoreError;
use crate::ports::rate_limit::{LimitTable, RateLimitLedger};

#[derive(Default)]
struct LedgerState {
    counters: HashMap<LimitKey, RateLimitCounter>,
    holds: HashMap<LimitHolder, BTreeSet<LimitKey>>,
}

impl LedgerState {
    fn drop_hold(&mut self, key: &LimitKey, holder: &LimitHolder) -> bool {
        let Some(keys) = self.holds.get_mut(holder) else {
            return false;
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            self.holds.remove(holder);
        }
        if removed {
            if let Some(counter) = self.counters.get_mut(key) {
                counter.release();
            }
        }
        removed
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    table: Arc<LimitTable>,
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new(table: LimitTable) -> Self {
        Self {
            table: Arc::new(table),
            state: Arc::default(),
        }
    }
}

#[async_trait]
impl RateLimitLedger for InMemoryLedger {
    async fn set_limit(
        &self,
        key: &LimitKey,
        max_concurrent: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .counters
            .entry(key.clone())
            .or_insert_with(|| RateLimitCounter::new(key.clone(), max_concurrent, now))
            .max_concurrent = max_concurrent;
        Ok(())
    }

    async fn try_acquire(
        &self,
        key: &LimitKey,
        holder: &LimitHolder,
        now: DateTime<Utc>,
    ) -> Result<Acquire, StoreError> {
        let mut state = self.state.lock().await;
        let LedgerState { counters, holds } = &mut *state;
        let counter = match counters.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.table.max_for(key) {
                Some(max) => entry.insert(RateLimitCounter::new(key.clone(), max, now)),
                None => return Ok(Acquire::Unlimited),
            },
        };
        if holds.get(holder).is_some_and(|keys| keys.contains(key)) {
            return Ok(Acquire::Granted);
        }
        if !counter.try_acquire(now) {
            return Ok(Acquire::Denied);
        }
        holds.entry(holder.clone()).or_default().insert(key.clone());
        Ok(Acquire::Granted)
    }

    async fn release(&self, key: &LimitKey, holder: &LimitHolder) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.drop_hold(key, holder))
    }

    async fn release_holder(&self, holder: &LimitHolder) -> Result<Vec<LimitKey>, StoreError> {
        let mut state = self.state.lock().await;
        let keys: Vec<LimitKey> = state
            .holds
            .get(holder)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            state.drop_hold(key, holder);
        }
        Ok(keys)
    }

    async fn counter(&self, key: &LimitKey) -> Result<Option<RateLimitCounter>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.counters.get(key).cloned())
    }
}
