//! Credential provider backed by a fixed map.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::TenantId;
use crate::ports::credentials::{CredentialError, CredentialProvider, Credentials};

#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    by_tenant: HashMap<TenantId, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tenant: impl Into<TenantId>, credentials: Credentials) -> Self {
        self.by_tenant.insert(tenant.into(), credentials);
        self
    }

    pub fn insert(&mut self, tenant: impl Into<TenantId>, credentials: Credentials) {
        self.by_tenant.insert(tenant.into(), credentials);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn lookup(&self, tenant: &TenantId) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.by_tenant.get(tenant).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn looks_up_by_tenant() {
        let provider = StaticCredentials::new().with("acme", Credentials::new("k1"));
        let found = provider.lookup(&TenantId::new("acme")).await.unwrap();
        assert_eq!(found, Some(Credentials::new("k1")));
        assert!(provider.lookup(&TenantId::new("beta")).await.unwrap().is_none());
    }
}
