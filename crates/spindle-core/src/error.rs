use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{StageName, TaskId, TenantId};

pub use crate::domain::PipelineError;

/// Store-level failures. These are system errors: they are logged and
/// surfaced to supervision, never written into task state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached right now (busy, locked, connection lost).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    /// A row could not be decoded back into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("invalid tenant id '{0}'")]
    InvalidTenant(TenantId),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate handler for stage={0}")]
    DuplicateHandler(StageName),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no pipeline configured")]
    MissingPipeline,

    #[error("missing step handlers: {0:?}. These stages were declared but have no handler.")]
    MissingHandlers(Vec<StageName>),

    #[error("handler registered for '{0}', which is not a step stage of the pipeline")]
    UnexpectedHandler(StageName),

    #[error(
        "stale_after ({stale_after:?}) must exceed the longest step timeout ({longest_step:?})"
    )]
    StaleThresholdTooShort {
        stale_after: Duration,
        longest_step: Duration,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for the orchestrator surface.
#[derive(Debug, Error)]
pub enum SpindleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("task {0} is not awaiting review")]
    NotAwaitingReview(TaskId),
}
