//! OrchestratorBuilder: wiring and fail-fast startup checks.
//!
//! `build()` refuses to start when
//! - no pipeline was given
//! - a step stage has no handler, or a handler names no step stage
//! - `stale_after` does not exceed the longest step timeout (the reaper
//!   would fail tasks that are still legitimately running)

use std::collections::HashSet;
use std::sync::Arc;

use crate::app::fairness::FairnessScheduler;
use crate::app::observer_hub::{DeliveryPolicy, ObserverHub};
use crate::app::orchestrator::Orchestrator;
use crate::app::registry::StepRegistry;
use crate::app::retry::{Decider, RetryDecider, RetryPolicy};
use crate::app::runtime::{ReaperSettings, Runtime, WorkerSettings};
use crate::app::wake::WakeSignal;
use crate::config::SpindleConfig;
use crate::domain::{Pipeline, StageName};
use crate::error::{BuildError, RegistryError};
use crate::impls::{InMemoryLedger, InMemoryTaskStore};
use crate::ports::{
    Alerter, Clock, CredentialProvider, IdGenerator, LogAlerter, NoCredentials, RateLimitLedger,
    StatusObserver, StepHandler, SystemClock, TaskStore, UlidGenerator,
};

/// # Example
/// ```ignore
/// let orch = OrchestratorBuilder::new()
///     .backends(store.clone(), store)
///     .pipeline(pipeline)
///     .handler("script", Arc::new(ScriptStep))?
///     .config(&config)
///     .build()?;
/// ```
#[derive(Default)]
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn TaskStore>>,
    ledger: Option<Arc<dyn RateLimitLedger>>,
    pipeline: Option<Pipeline>,
    registry: StepRegistry,
    observers: Vec<Arc<dyn StatusObserver>>,
    alerter: Option<Arc<dyn Alerter>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    retry: RetryPolicy,
    worker: WorkerSettings,
    reaper: ReaperSettings,
    delivery: DeliveryPolicy,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: impl TaskStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn ledger(mut self, ledger: impl RateLimitLedger + 'static) -> Self {
        self.ledger = Some(Arc::new(ledger));
        self
    }

    /// Both ports at once, typically the same durable store.
    pub fn backends(
        mut self,
        store: Arc<dyn TaskStore>,
        ledger: Arc<dyn RateLimitLedger>,
    ) -> Self {
        self.store = Some(store);
        self.ledger = Some(ledger);
        self
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn handler(
        mut self,
        stage: impl Into<StageName>,
        handler: Arc<dyn StepHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(stage.into(), handler)?;
        Ok(self)
    }

    pub fn observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn credentials(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.credentials = Some(Arc::new(provider));
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    /// Replaces the default [`RetryDecider`].
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn worker_settings(mut self, settings: WorkerSettings) -> Self {
        self.worker = settings;
        self
    }

    pub fn reaper_settings(mut self, settings: ReaperSettings) -> Self {
        self.reaper = settings;
        self
    }

    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery = policy;
        self
    }

    /// Take retry, worker, reaper and delivery settings from config.
    /// Backends are opened separately (see [`SpindleConfig::open_backends`]).
    pub fn config(self, config: &SpindleConfig) -> Self {
        self.retry_policy(config.retry_policy())
            .worker_settings(config.worker_settings())
            .reaper_settings(config.reaper_settings())
            .delivery_policy(config.delivery_policy())
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        let pipeline = self.pipeline.ok_or(BuildError::MissingPipeline)?;

        let steps = pipeline.step_names();
        let missing: Vec<StageName> = steps
            .iter()
            .filter(|stage| self.registry.get(stage).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingHandlers(missing));
        }
        let steps: HashSet<&StageName> = steps.iter().collect();
        let mut unexpected: Vec<&StageName> = self
            .registry
            .stages()
            .filter(|stage| !steps.contains(stage))
            .collect();
        unexpected.sort();
        if let Some(stage) = unexpected.first() {
            return Err(BuildError::UnexpectedHandler((*stage).clone()));
        }

        let longest_step = pipeline.longest_timeout(self.worker.step_timeout);
        if self.reaper.stale_after <= longest_step {
            return Err(BuildError::StaleThresholdTooShort {
                stale_after: self.reaper.stale_after,
                longest_step,
            });
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let alerter = self.alerter.unwrap_or_else(|| Arc::new(LogAlerter));

        let runtime = Runtime {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
            ledger: self
                .ledger
                .unwrap_or_else(|| Arc::new(InMemoryLedger::default())),
            pipeline,
            registry: self.registry,
            decider: self
                .decider
                .unwrap_or_else(|| Arc::new(RetryDecider::new(self.retry))),
            observers: ObserverHub::new(self.observers, alerter, self.delivery),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(NoCredentials)),
            clock,
            ids,
            wake: WakeSignal::new(),
            fairness: FairnessScheduler::new(),
            worker: self.worker,
            reaper: self.reaper,
        };
        Ok(Orchestrator::new(Arc::new(runtime)))
    }
}
