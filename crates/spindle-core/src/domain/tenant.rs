//! Tenant (channel): an isolated owner of tasks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::{ServiceName, TenantId};

/// Configured tenant. Rarely mutates and is never deleted in the hot path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,

    /// Per-service capacity hints (`max_concurrent` for this tenant's
    /// ledger rows). Services not listed fall back to the configured
    /// per-tenant default.
    #[serde(default)]
    pub limits: BTreeMap<ServiceName, u32>,

    /// Opaque reference handed to the credential provider. The core never
    /// looks inside it.
    #[serde(default)]
    pub credentials_ref: Option<String>,
}

impl Tenant {
    pub fn new(id: impl Into<TenantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            limits: BTreeMap::new(),
            credentials_ref: None,
        }
    }

    pub fn with_limit(mut self, service: impl Into<ServiceName>, max_concurrent: u32) -> Self {
        self.limits.insert(service.into(), max_concurrent);
        self
    }

    pub fn with_credentials_ref(mut self, reference: impl Into<String>) -> Self {
        self.credentials_ref = Some(reference.into());
        self
    }
}
