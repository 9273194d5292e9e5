//! Step outcome: what a step handler reports back to the core.
//!
//! Failures are data, not `Err`: they are recorded on the task row
//! (`last_error`) and drive the retry decision.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transient failures are retried with backoff; terminal ones finalize the
/// task immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Transient,
    Terminal,
}

/// Coarse failure categories a handler can report.
///
/// Classification:
/// - timeouts, network errors, 5xx, 408 and 429 are transient
/// - validation errors, permanent rejections and other 4xx are terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    Network,
    Http { status: u16 },
    Validation,
    Rejected,
    /// The worker died or stalled while holding the claim.
    WorkerLost,
    /// Handler supplied its own hint.
    Other { kind: FailureKind },
}

impl FailureCause {
    pub fn classify(&self) -> FailureKind {
        match self {
            FailureCause::Timeout | FailureCause::Network | FailureCause::WorkerLost => {
                FailureKind::Transient
            }
            FailureCause::Http { status } => match *status {
                408 | 429 => FailureKind::Transient,
                500..=599 => FailureKind::Transient,
                _ => FailureKind::Terminal,
            },
            FailureCause::Validation | FailureCause::Rejected => FailureKind::Terminal,
            FailureCause::Other { kind } => *kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    pub cause: FailureCause,
}

impl StepFailure {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureCause::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureCause::Network, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(FailureCause::Http { status }, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureCause::Validation, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureCause::Rejected, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(
            FailureCause::Other {
                kind: FailureKind::Transient,
            },
            message,
        )
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(
            FailureCause::Other {
                kind: FailureKind::Terminal,
            },
            message,
        )
    }

    pub fn kind(&self) -> FailureKind {
        self.cause.classify()
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind(), self.message)
    }
}

/// Result of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    /// Forward progress. `fields` are merged into the task payload.
    Success {
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        fields: serde_json::Map<String, serde_json::Value>,
    },
    Failure(StepFailure),
}

impl StepOutcome {
    pub fn success() -> Self {
        StepOutcome::Success {
            fields: serde_json::Map::new(),
        }
    }

    pub fn success_with(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        StepOutcome::Success { fields }
    }

    /// Convenience for a single result field.
    pub fn success_field(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut fields = serde_json::Map::new();
        fields.insert(key.into(), value);
        StepOutcome::Success { fields }
    }

    pub fn failure(failure: StepFailure) -> Self {
        StepOutcome::Failure(failure)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

impl From<StepFailure> for StepOutcome {
    fn from(failure: StepFailure) -> Self {
        StepOutcome::Failure(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(FailureCause::Timeout, FailureKind::Transient)]
    #[case::network(FailureCause::Network, FailureKind::Transient)]
    #[case::worker_lost(FailureCause::WorkerLost, FailureKind::Transient)]
    #[case::server_error(FailureCause::Http { status: 503 }, FailureKind::Transient)]
    #[case::too_many_requests(FailureCause::Http { status: 429 }, FailureKind::Transient)]
    #[case::request_timeout(FailureCause::Http { status: 408 }, FailureKind::Transient)]
    #[case::bad_request(FailureCause::Http { status: 400 }, FailureKind::Terminal)]
    #[case::forbidden(FailureCause::Http { status: 403 }, FailureKind::Terminal)]
    #[case::validation(FailureCause::Validation, FailureKind::Terminal)]
    #[case::rejected(FailureCause::Rejected, FailureKind::Terminal)]
    fn classifies_failures(#[case] cause: FailureCause, #[case] expected: FailureKind) {
        assert_eq!(cause.classify(), expected);
    }

    #[test]
    fn handler_hint_is_respected() {
        assert_eq!(StepFailure::transient("x").kind(), FailureKind::Transient);
        assert_eq!(StepFailure::terminal("x").kind(), FailureKind::Terminal);
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let outcome = StepOutcome::success_field("url", serde_json::json!("https://x.test"));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["kind"], "SUCCESS");
        assert_eq!(value["fields"]["url"], "https://x.test");
    }
}
