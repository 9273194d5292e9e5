//! Pipeline graph: stage -> {success exit, failure exit}.
//!
//! Validated once at startup so the worker never meets a stage without a
//! way forward or a way to fail.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::{ServiceName, StageName};
use super::status::{Phase, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Executed by a registered step handler.
    Step,

    /// Human approval hold. Tasks wait in `AwaitingReview` until an external
    /// approval moves them to the gate's success exit.
    ReviewGate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: StageName,
    pub kind: StageKind,

    /// Rate-limited downstream service this step calls, if any.
    #[serde(default)]
    pub service: Option<ServiceName>,

    /// Overrides the worker's default step timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl StageSpec {
    pub fn step(name: impl Into<StageName>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Step,
            service: None,
            timeout: None,
        }
    }

    pub fn review_gate(name: impl Into<StageName>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::ReviewGate,
            service: None,
            timeout: None,
        }
    }

    pub fn with_service(mut self, service: impl Into<ServiceName>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessExit {
    Stage(StageName),
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureExit {
    /// `Failed` with backoff, same stage, until retries run out.
    Retry,

    /// Straight to `FailedFinal` (steps that must never run twice on error).
    Final,
}

/// Raw, unvalidated edges for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageEdges {
    pub success: Option<SuccessExit>,
    pub failure: Option<FailureExit>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("duplicate stage '{0}'")]
    DuplicateStage(StageName),

    #[error("stage '{0}' has no success exit")]
    MissingSuccessExit(StageName),

    #[error("stage '{0}' has no failure exit")]
    MissingFailureExit(StageName),

    #[error("stage '{from}' exits to unknown stage '{to}'")]
    UnknownTarget { from: StageName, to: StageName },

    #[error("edges given for unknown stage '{0}'")]
    UnknownStage(StageName),

    #[error("success exits form a cycle through '{0}'")]
    Cycle(StageName),

    #[error("stage '{0}' is not reachable from the entry stage")]
    Unreachable(StageName),

    #[error("entry stage '{0}' cannot be a review gate")]
    GateAtEntry(StageName),

    #[error("stage '{0}' is not a review gate")]
    NotAGate(StageName),
}

/// A validated stage with its exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub spec: StageSpec,
    pub success: SuccessExit,
    pub failure: FailureExit,
}

impl Stage {
    pub fn name(&self) -> &StageName {
        &self.spec.name
    }

    pub fn is_gate(&self) -> bool {
        self.spec.kind == StageKind::ReviewGate
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    index: HashMap<StageName, usize>,
}

impl Pipeline {
    /// Validate an explicit graph. The first stage is the entry.
    pub fn from_graph(
        specs: Vec<StageSpec>,
        mut edges: HashMap<StageName, StageEdges>,
    ) -> Result<Self, PipelineError> {
        if specs.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(PipelineError::DuplicateStage(spec.name.clone()));
            }
        }
        if let Some(unknown) = edges.keys().find(|name| !index.contains_key(*name)) {
            return Err(PipelineError::UnknownStage(unknown.clone()));
        }

        let mut stages = Vec::with_capacity(specs.len());
        for spec in specs {
            let stage_edges = edges.remove(&spec.name).unwrap_or_default();
            let success = stage_edges
                .success
                .ok_or_else(|| PipelineError::MissingSuccessExit(spec.name.clone()))?;
            let failure = stage_edges
                .failure
                .ok_or_else(|| PipelineError::MissingFailureExit(spec.name.clone()))?;
            if let SuccessExit::Stage(to) = &success
                && !index.contains_key(to)
            {
                return Err(PipelineError::UnknownTarget {
                    from: spec.name.clone(),
                    to: to.clone(),
                });
            }
            stages.push(Stage {
                spec,
                success,
                failure,
            });
        }

        let pipeline = Self { stages, index };
        pipeline.check_shape()?;
        Ok(pipeline)
    }

    /// Entry must be a step, success edges must be acyclic and every stage
    /// reachable from the entry.
    fn check_shape(&self) -> Result<(), PipelineError> {
        let entry = &self.stages[0];
        if entry.is_gate() {
            return Err(PipelineError::GateAtEntry(entry.name().clone()));
        }

        for start in &self.stages {
            let mut seen = HashSet::new();
            let mut current = start;
            while let SuccessExit::Stage(next) = &current.success {
                if !seen.insert(current.name().clone()) {
                    return Err(PipelineError::Cycle(current.name().clone()));
                }
                current = &self.stages[self.index[next]];
            }
        }

        let mut reachable = HashSet::new();
        let mut current = Some(entry);
        while let Some(stage) = current {
            reachable.insert(stage.name().clone());
            current = match &stage.success {
                SuccessExit::Stage(next) => Some(&self.stages[self.index[next]]),
                SuccessExit::Published => None,
            };
        }
        if let Some(orphan) = self.stages.iter().find(|s| !reachable.contains(s.name())) {
            return Err(PipelineError::Unreachable(orphan.name().clone()));
        }
        Ok(())
    }

    pub fn entry(&self) -> &Stage {
        &self.stages[0]
    }

    /// Status of a freshly submitted task.
    pub fn entry_status(&self) -> TaskStatus {
        TaskStatus::queued(self.entry().name().clone())
    }

    pub fn stage(&self, name: &StageName) -> Option<&Stage> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Where a task goes when `from` succeeds (or is approved, for a gate).
    pub fn success_target(&self, from: &Stage) -> TaskStatus {
        match &from.success {
            SuccessExit::Published => TaskStatus::new(from.name().clone(), Phase::Published),
            SuccessExit::Stage(next) => {
                let next_stage = &self.stages[self.index[next]];
                let phase = if next_stage.is_gate() {
                    Phase::AwaitingReview
                } else {
                    Phase::Queued
                };
                TaskStatus::new(next.clone(), phase)
            }
        }
    }

    /// Target for an external approval of a task held at `gate`.
    pub fn approval_target(&self, gate: &StageName) -> Result<TaskStatus, PipelineError> {
        let stage = self
            .stage(gate)
            .ok_or_else(|| PipelineError::UnknownStage(gate.clone()))?;
        if !stage.is_gate() {
            return Err(PipelineError::NotAGate(gate.clone()));
        }
        Ok(self.success_target(stage))
    }

    /// Stages that need a step handler.
    pub fn step_names(&self) -> Vec<StageName> {
        self.stages
            .iter()
            .filter(|s| s.spec.kind == StageKind::Step)
            .map(|s| s.name().clone())
            .collect()
    }

    /// Longest step timeout, using `default` for stages without an override.
    pub fn longest_timeout(&self, default: Duration) -> Duration {
        self.stages
            .iter()
            .filter(|s| s.spec.kind == StageKind::Step)
            .map(|s| s.spec.timeout.unwrap_or(default))
            .max()
            .unwrap_or(default)
    }
}

/// Builds a linear pipeline: each stage succeeds into the next, the last
/// one publishes, and every stage retries on failure unless overridden.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    specs: Vec<StageSpec>,
    success_overrides: HashMap<StageName, SuccessExit>,
    failure_overrides: HashMap<StageName, FailureExit>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn step(self, name: impl Into<StageName>) -> Self {
        self.stage(StageSpec::step(name))
    }

    pub fn service_step(self, name: impl Into<StageName>, service: impl Into<ServiceName>) -> Self {
        self.stage(StageSpec::step(name).with_service(service))
    }

    pub fn review_gate(self, name: impl Into<StageName>) -> Self {
        self.stage(StageSpec::review_gate(name))
    }

    pub fn on_success(mut self, from: impl Into<StageName>, exit: SuccessExit) -> Self {
        self.success_overrides.insert(from.into(), exit);
        self
    }

    pub fn on_failure(mut self, from: impl Into<StageName>, exit: FailureExit) -> Self {
        self.failure_overrides.insert(from.into(), exit);
        self
    }

    pub fn build(mut self) -> Result<Pipeline, PipelineError> {
        let mut edges = HashMap::with_capacity(self.specs.len());
        for (i, spec) in self.specs.iter().enumerate() {
            let default_success = match self.specs.get(i + 1) {
                Some(next) => SuccessExit::Stage(next.name.clone()),
                None => SuccessExit::Published,
            };
            let success = self
                .success_overrides
                .remove(&spec.name)
                .unwrap_or(default_success);
            let failure = self
                .failure_overrides
                .remove(&spec.name)
                .unwrap_or(FailureExit::Retry);
            edges.insert(
                spec.name.clone(),
                StageEdges {
                    success: Some(success),
                    failure: Some(failure),
                },
            );
        }
        if let Some(unknown) = self
            .success_overrides
            .keys()
            .chain(self.failure_overrides.keys())
            .next()
        {
            return Err(PipelineError::UnknownStage(unknown.clone()));
        }
        Pipeline::from_graph(self.specs, edges)
    }
}
