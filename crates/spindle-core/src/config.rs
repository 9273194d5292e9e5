//! Configuration: TOML file, every section defaulted, plus environment
//! overrides.
//!
//! | variable             | overrides              |
//! |----------------------|------------------------|
//! | `SPINDLE_DB_PATH`    | `store.path` (sqlite)  |
//! | `SPINDLE_WORKERS`    | `worker.count`         |
//! | `SPINDLE_LOG_FORMAT` | `logging.format`       |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{DeliveryPolicy, MAX_RETRY_CEILING, ReaperSettings, RetryPolicy, WorkerSettings};
use crate::domain::{ServiceName, Tenant};
use crate::error::{ConfigError, StoreError};
use crate::impls::{InMemoryLedger, InMemoryTaskStore, SqliteStore};
use crate::ports::{LimitTable, RateLimitLedger, TaskStore};
use crate::telemetry::LogFormat;

pub const ENV_DB_PATH: &str = "SPINDLE_DB_PATH";
pub const ENV_WORKERS: &str = "SPINDLE_WORKERS";
pub const ENV_LOG_FORMAT: &str = "SPINDLE_LOG_FORMAT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpindleConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
    pub retry: RetryConfig,
    pub limits: LimitsConfig,
    pub observers: DeliveryConfig,
    pub logging: LoggingConfig,
    pub tenants: Vec<Tenant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Database file; required for `sqlite`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub count: usize,
    pub poll_interval_ms: u64,
    pub step_timeout_secs: u64,
    pub store_retry_base_ms: u64,
    pub store_retry_max_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval_ms: 1_000,
            step_timeout_secs: 300,
            store_retry_base_ms: 500,
            store_retry_max_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stale_after_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub base_secs: u64,
    pub multiplier: f64,
    pub ceiling_secs: u64,
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            multiplier: 2.0,
            ceiling_secs: 3_600,
            jitter: 0.25,
            max_retries: 5,
        }
    }
}

/// Concurrency ceilings per service. Tenant-specific values go on the
/// tenant entry itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub global: BTreeMap<ServiceName, u32>,
    pub per_tenant: BTreeMap<ServiceName, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl SpindleConfig {
    /// Read `path` (defaults when `None`), apply the process environment
    /// and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply environment overrides through `lookup` (tests pass a map).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.store.backend = StoreBackend::Sqlite;
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup(ENV_WORKERS) {
            self.worker.count = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_WORKERS,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = value.parse().map_err(|_| ConfigError::Env {
                var: ENV_LOG_FORMAT,
                value,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.count == 0 {
            return Err(ConfigError::Invalid("worker.count must be at least 1".into()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_ms must be positive".into(),
            ));
        }
        if self.reaper.stale_after_secs <= self.worker.step_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "reaper.stale_after_secs ({}) must exceed worker.step_timeout_secs ({})",
                self.reaper.stale_after_secs, self.worker.step_timeout_secs
            )));
        }
        if self.reaper.interval_secs == 0 {
            return Err(ConfigError::Invalid("reaper.interval_secs must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be in [0, 1), got {}",
                self.retry.jitter
            )));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be at least 1, got {}",
                self.retry.multiplier
            )));
        }
        let max_ceiling = MAX_RETRY_CEILING.as_secs();
        if self.retry.ceiling_secs == 0 || self.retry.ceiling_secs > max_ceiling {
            return Err(ConfigError::Invalid(format!(
                "retry.ceiling_secs must be in 1..={max_ceiling}, got {}",
                self.retry.ceiling_secs
            )));
        }
        if self.retry.base_secs > self.retry.ceiling_secs {
            return Err(ConfigError::Invalid(format!(
                "retry.base_secs ({}) must not exceed retry.ceiling_secs ({})",
                self.retry.base_secs, self.retry.ceiling_secs
            )));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            return Err(ConfigError::Invalid("store.path is required for sqlite".into()));
        }
        for tenant in &self.tenants {
            if tenant.id.as_str().is_empty() || tenant.id.as_str().starts_with('*') {
                return Err(ConfigError::Invalid(format!(
                    "tenant id '{}' is reserved or empty",
                    tenant.id
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry.base_secs),
            multiplier: self.retry.multiplier,
            ceiling: Duration::from_secs(self.retry.ceiling_secs),
            jitter: self.retry.jitter,
            max_retries: self.retry.max_retries,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            step_timeout: Duration::from_secs(self.worker.step_timeout_secs),
            store_retry_base: Duration::from_millis(self.worker.store_retry_base_ms),
            store_retry_max: Duration::from_secs(self.worker.store_retry_max_secs),
        }
    }

    pub fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings {
            interval: Duration::from_secs(self.reaper.interval_secs),
            stale_after: Duration::from_secs(self.reaper.stale_after_secs),
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: self.observers.max_attempts.max(1),
            base_delay: Duration::from_millis(self.observers.base_delay_ms),
            max_delay: Duration::from_secs(self.observers.max_delay_secs),
        }
    }

    /// Ceilings used when a ledger row is created lazily. Tenant entries
    /// override the per-tenant defaults.
    pub fn limit_table(&self) -> LimitTable {
        let mut table = LimitTable::new();
        for (service, max) in &self.limits.global {
            table = table.global(service.clone(), *max);
        }
        for (service, max) in &self.limits.per_tenant {
            table = table.per_tenant(service.clone(), *max);
        }
        for tenant in &self.tenants {
            for (service, max) in &tenant.limits {
                table = table.tenant_override(tenant.id.clone(), service.clone(), *max);
            }
        }
        table
    }

    /// Open the configured backend. SQLite serves both ports from one file.
    pub fn open_backends(
        &self,
    ) -> Result<(Arc<dyn TaskStore>, Arc<dyn RateLimitLedger>), StoreError> {
        let table = self.limit_table();
        match (self.store.backend, &self.store.path) {
            (StoreBackend::Sqlite, Some(path)) => {
                let store = SqliteStore::open(path, table)?;
                tracing::info!(path = %path.display(), "sqlite store opened");
                Ok((Arc::new(store.clone()), Arc::new(store)))
            }
            (StoreBackend::Sqlite, None) => Err(StoreError::Unavailable(
                "store.path is required for sqlite".into(),
            )),
            (StoreBackend::Memory, _) => Ok((
                Arc::new(InMemoryTaskStore::new()),
                Arc::new(InMemoryLedger::new(table)),
            )),
        }
    }
}
