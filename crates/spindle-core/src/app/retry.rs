//! Retry scheduling: backoff policy and the retry/finalize decision.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::domain::{FailureExit, FailureKind, StepFailure};

/// Largest retry ceiling configuration accepts (30 days).
pub const MAX_RETRY_CEILING: Duration = Duration::from_secs(30 * 24 * 3600);

/// Exponential backoff with a ceiling and symmetric jitter.
///
/// The deterministic part is `base * multiplier^(n - 1)` for the n-th
/// failure, capped at `ceiling`. Jitter of `±jitter` (fraction of the delay)
/// is applied afterwards so retries from many tenants do not line up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub ceiling: Duration,
    pub jitter: f64,

    /// Failures allowed before a task is finalized. The task goes to
    /// `failed_final` once `retry_count` exceeds this.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    /// 1, 2, 4, 8 ... minutes, capped at one hour, five retries, ±25%.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            multiplier: 2.0,
            ceiling: Duration::from_secs(3600),
            jitter: 0.25,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay after the `failures`-th failure (1-indexed).
    ///
    /// Monotonically non-decreasing in `failures`, never above `ceiling`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let ceiling = self.ceiling.as_secs_f64();
        if !secs.is_finite() || secs >= ceiling {
            return self.ceiling;
        }
        Duration::from_secs_f64(secs)
    }

    /// `delay` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn jittered(&self, delay: Duration, rng: &mut impl Rng) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }
}

/// What to do with a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Back to the pool once `next_retry_at` has passed.
    Retry {
        next_retry_at: DateTime<Utc>,
        delay: Duration,
    },

    /// Give up: `failed_final` plus an alert.
    MarkFinal { reason: String },
}

impl Decision {
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Decision::Retry { next_retry_at, .. } => Some(*next_retry_at),
            Decision::MarkFinal { .. } => None,
        }
    }
}

/// Decides the next action for a failure. No side effects beyond drawing
/// jitter; the caller applies the decision to the store.
pub trait Decider: Send + Sync {
    /// `retry_count` is the task's count before this failure.
    fn decide(
        &self,
        retry_count: u32,
        failure: &StepFailure,
        exit: FailureExit,
        now: DateTime<Utc>,
    ) -> Decision;
}

#[derive(Debug, Clone, Default)]
pub struct RetryDecider {
    policy: RetryPolicy,
}

impl RetryDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Decider for RetryDecider {
    fn decide(
        &self,
        retry_count: u32,
        failure: &StepFailure,
        exit: FailureExit,
        now: DateTime<Utc>,
    ) -> Decision {
        if failure.kind() == FailureKind::Terminal {
            return Decision::MarkFinal {
                reason: format!("terminal failure: {}", failure.message),
            };
        }
        if exit == FailureExit::Final {
            return Decision::MarkFinal {
                reason: "stage does not retry".to_string(),
            };
        }
        let failures = retry_count.saturating_add(1);
        if failures > self.policy.max_retries {
            return Decision::MarkFinal {
                reason: format!(
                    "max retries exceeded: {failures}/{}",
                    self.policy.max_retries
                ),
            };
        }
        let delay = self
            .policy
            .jittered(self.policy.backoff(failures), &mut rand::thread_rng());
        // out-of-range delays fall back to the ceiling
        let scheduled = [delay, self.policy.ceiling].into_iter().find_map(|d| {
            let at = chrono::Duration::from_std(d)
                .ok()
                .and_then(|d| now.checked_add_signed(d))?;
            Some((d, at))
        });
        match scheduled {
            Some((delay, next_retry_at)) => Decision::Retry {
                next_retry_at,
                delay,
            },
            None => Decision::MarkFinal {
                reason: format!("retry time out of range: {delay:?} after {now}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[rstest]
    #[case::first(1, 60)]
    #[case::second(2, 120)]
    #[case::third(3, 240)]
    #[case::fourth(4, 480)]
    #[case::capped(7, 3600)]
    #[case::far_past_cap(200, 3600)]
    fn default_backoff_sequence(#[case] failures: u32, #[case] secs: u64) {
        assert_eq!(RetryPolicy::default().backoff(failures), Duration::from_secs(secs));
    }

    #[test]
    fn backoff_is_monotonic_up_to_ceiling() {
        let policy = RetryPolicy::default();
        for n in 0..64 {
            let (a, b) = (policy.backoff(n), policy.backoff(n + 1));
            assert!(b >= a, "backoff({}) = {b:?} < backoff({n}) = {a:?}", n + 1);
            assert!(b <= policy.ceiling);
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_secs(120);
        for _ in 0..1000 {
            let d = policy.jittered(base, &mut rng).as_secs_f64();
            assert!((90.0..=150.0).contains(&d), "{d}");
        }
    }

    #[test]
    fn transient_failure_retries_until_budget_is_spent() {
        let decider = RetryDecider::new(no_jitter());
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let failure = StepFailure::network("connection reset");

        let first = decider.decide(0, &failure, FailureExit::Retry, now);
        assert_eq!(first.next_retry_at(), Some(now + chrono::Duration::minutes(1)));

        let last = decider.decide(4, &failure, FailureExit::Retry, now);
        assert_eq!(last.next_retry_at(), Some(now + chrono::Duration::minutes(16)));

        let over = decider.decide(5, &failure, FailureExit::Retry, now);
        assert!(matches!(over, Decision::MarkFinal { .. }));
    }

    #[test]
    fn huge_ceiling_never_overflows_the_retry_time() {
        let decider = RetryDecider::new(RetryPolicy {
            base: Duration::from_secs(u64::MAX / 4),
            ceiling: Duration::MAX,
            ..RetryPolicy::default()
        });
        let failure = StepFailure::network("reset");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let decision = decider.decide(0, &failure, FailureExit::Retry, now);
        assert!(matches!(decision, Decision::MarkFinal { .. }));
    }

    #[test]
    fn large_ceiling_is_kept_above_one_hour() {
        let decider = RetryDecider::new(RetryPolicy {
            base: Duration::from_secs(6 * 3600),
            ceiling: Duration::from_secs(24 * 3600),
            jitter: 0.0,
            ..RetryPolicy::default()
        });
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let decision = decider.decide(0, &StepFailure::network("reset"), FailureExit::Retry, now);
        assert_eq!(decision.next_retry_at(), Some(now + chrono::Duration::hours(6)));
    }

    #[rstest]
    #[case::terminal_kind(StepFailure::validation("bad script"), FailureExit::Retry)]
    #[case::final_exit(StepFailure::timeout("slow"), FailureExit::Final)]
    fn finalizes_without_retry(#[case] failure: StepFailure, #[case] exit: FailureExit) {
        let decider = RetryDecider::new(no_jitter());
        let decision = decider.decide(0, &failure, exit, Utc::now());
        assert!(matches!(decision, Decision::MarkFinal { .. }));
    }
}
