//! CredentialProvider port.

use std::fmt;

use async_trait::async_trait;

use crate::domain::TenantId;

/// Opaque secret handed straight to a step handler. Never logged, never
/// persisted by the core.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(***)")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("credential lookup failed: {0}")]
pub struct CredentialError(pub String);

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn lookup(&self, tenant: &TenantId) -> Result<Option<Credentials>, CredentialError>;
}

/// Provider for deployments whose steps need no credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn lookup(&self, _tenant: &TenantId) -> Result<Option<Credentials>, CredentialError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_secret() {
        let creds = Credentials::new("hunter2");
        assert_eq!(format!("{creds:?}"), "Credentials(***)");
        assert_eq!(creds.expose(), "hunter2");
    }
}
