//! Ports: the traits the app layer is written against.
//!
//! - **TaskStore** and **RateLimitLedger** live in the same durable store
//! - **StepHandler**, **StatusObserver**, **Alerter** and
//!   **CredentialProvider** are external collaborators
//! - **Clock** and **IdGenerator** keep time and ids swappable in tests

pub mod clock;
pub mod credentials;
pub mod id_generator;
pub mod observer;
pub mod rate_limit;
pub mod step_handler;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::credentials::{CredentialError, CredentialProvider, Credentials, NoCredentials};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::observer::{Alert, Alerter, LogAlerter, ObserverError, StatusChange, StatusObserver};
pub use self::rate_limit::{LimitTable, RateLimitLedger};
pub use self::step_handler::{StepContext, StepHandler};
pub use self::task_store::{TaskStore, TenantMark};
