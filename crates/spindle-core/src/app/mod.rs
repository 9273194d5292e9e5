//! App layer: ports combined into the scheduling core.
//!
//! # Main pieces
//! - **OrchestratorBuilder** / **Orchestrator**: wiring, intake, approval, status
//! - **WorkerLoop** / **WorkerGroup**: claim -> permit -> step -> commit
//! - **ReaperLoop**: recovery of claims whose worker died
//! - **FairnessScheduler**, **RetryDecider**, **ServicePermit**, **WakeSignal**
//! - **ObserverHub**: fire-and-forget status delivery and alerts

pub mod builder;
pub mod fairness;
pub mod observer_hub;
pub mod orchestrator;
pub mod permit;
pub mod reaper_loop;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod wake;
pub mod worker_loop;

pub use self::builder::OrchestratorBuilder;
pub use self::fairness::FairnessScheduler;
pub use self::observer_hub::{DeliveryPolicy, ObserverHub};
pub use self::orchestrator::Orchestrator;
pub use self::permit::ServicePermit;
pub use self::reaper_loop::{ReapReport, ReaperHandle, ReaperLoop, WORKER_LOST_MESSAGE};
pub use self::registry::StepRegistry;
pub use self::retry::{Decider, Decision, MAX_RETRY_CEILING, RetryDecider, RetryPolicy};
pub use self::runtime::{ReaperSettings, Runtime, WorkerSettings};
pub use self::status::TaskView;
pub use self::wake::{Wake, WakeSignal};
pub use self::worker_loop::{RunOnce, WorkerGroup, WorkerLoop};
