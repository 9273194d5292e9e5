//! Domain model (ids, status, task rows, tenants, counters, pipeline graph, outcomes).

pub mod ids;
pub mod outcome;
pub mod pipeline;
pub mod rate_limit;
pub mod status;
pub mod task;
pub mod tenant;

pub use ids::{Id, IdMarker, ServiceName, StageName, TaskId, TenantId, WorkerId};
pub use outcome::{FailureCause, FailureKind, StepFailure, StepOutcome};
pub use pipeline::{
    FailureExit, Pipeline, PipelineBuilder, PipelineError, Stage, StageEdges, StageKind,
    StageSpec, SuccessExit,
};
pub use rate_limit::{
    Acquire, GLOBAL_SCOPE_KEY, LimitHolder, LimitKey, LimitScope, RateLimitCounter,
};
pub use status::{Phase, TaskStatus};
pub use task::{Claim, Commit, NewTask, TaskRecord, merge_fields};
pub use tenant::Tenant;
