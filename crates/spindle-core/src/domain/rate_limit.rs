//! Rate limit counter rows.
//!
//! # Model
//! One counter exists per `(scope, service)` pair, where the scope is a
//! tenant or the whole deployment. A step that calls a limited service
//! needs one unit from its tenant counter and one from the global counter.
//!
//! # Holds
//! Every counted unit is recorded against the claim token that took it
//! ([`LimitHolder`]). The worker gives its units back when the step ends.
//! When the worker dies instead, the reaper gives them back by token, so a
//! crash never leaves capacity counted forever.
//!
//! # Ceiling changes
//! Lowering `max_concurrent` below the in-flight count does not revoke
//! anything. New acquisitions are denied until releases bring the count
//! under the new ceiling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{ServiceName, TaskId, TenantId, WorkerId};

/// Whose capacity a counter tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Tenant(TenantId),
    Global,
}

impl LimitScope {
    /// Storage key: the tenant id, or `*global*` (tenant ids may not start
    /// with `*`).
    pub fn as_key(&self) -> &str {
        match self {
            LimitScope::Tenant(id) => id.as_str(),
            LimitScope::Global => GLOBAL_SCOPE_KEY,
        }
    }

    pub fn from_key(key: &str) -> Self {
        if key == GLOBAL_SCOPE_KEY {
            LimitScope::Global
        } else {
            LimitScope::Tenant(TenantId::new(key))
        }
    }
}

pub const GLOBAL_SCOPE_KEY: &str = "*global*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LimitKey {
    pub scope: LimitScope,
    pub service: ServiceName,
}

impl LimitKey {
    pub fn tenant(tenant: TenantId, service: ServiceName) -> Self {
        Self {
            scope: LimitScope::Tenant(tenant),
            service,
        }
    }

    pub fn global(service: ServiceName) -> Self {
        Self {
            scope: LimitScope::Global,
            service,
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope.as_key(), self.service)
    }
}

/// In-flight consumers of one (scope, service) pair.
///
/// Invariant: `current_count` is never negative, and an acquisition never
/// takes it past `max_concurrent`. Only a ceiling lowered while units are
/// held leaves it above the ceiling, until those units are released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub key: LimitKey,
    pub current_count: u32,
    pub max_concurrent: u32,
    /// When the current busy window opened (last 0 -> 1 transition).
    pub window_start: DateTime<Utc>,
}

impl RateLimitCounter {
    pub fn new(key: LimitKey, max_concurrent: u32, now: DateTime<Utc>) -> Self {
        Self {
            key,
            current_count: 0,
            max_concurrent,
            window_start: now,
        }
    }

    /// Compare-and-increment.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if self.current_count >= self.max_concurrent {
            return false;
        }
        if self.current_count == 0 {
            self.window_start = now;
        }
        self.current_count += 1;
        true
    }

    /// Decrement, floored at zero so a double release from a recovery path
    /// cannot drive the count negative.
    pub fn release(&mut self) {
        self.current_count = self.current_count.saturating_sub(1);
    }
}

/// The claim token a counted unit belongs to.
///
/// Same fields as the task store's claim token, so the reaper can release
/// the units of a stale claim without asking the worker that took them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LimitHolder {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub claimed_at: DateTime<Utc>,
}

impl LimitHolder {
    pub fn new(task_id: TaskId, worker: WorkerId, claimed_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            worker,
            claimed_at,
        }
    }
}

impl fmt::Display for LimitHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task_id, self.worker)
    }
}

/// Outcome of `try_acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Denied,
    /// No ceiling is configured for this key; nothing was counted and
    /// nothing must be released.
    Unlimited,
}

impl Acquire {
    pub fn is_denied(self) -> bool {
        self == Acquire::Denied
    }
}
