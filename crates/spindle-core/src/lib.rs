//! spindle-core
//!
//! Multi-tenant task queue and scheduling core: durable task rows claimed
//! atomically by any number of workers, tenant fairness, per-tenant and
//! global concurrency ceilings, retry with backoff and stale-claim recovery.
//!
//! # Modules
//! - **domain**: ids, task rows, status, tenants, pipeline graph, outcomes
//! - **ports**: TaskStore, RateLimitLedger, StepHandler, observers, clock
//! - **impls**: in-memory and SQLite stores, static credentials
//! - **app**: orchestrator, worker and reaper loops, retry and fairness
//! - **config**: TOML configuration with environment overrides
//! - **telemetry**: tracing subscriber setup

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod telemetry;

pub use app::{Orchestrator, OrchestratorBuilder};
pub use config::SpindleConfig;
pub use error::SpindleError;
