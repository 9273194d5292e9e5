//! Fire-and-forget delivery of status changes and alerts.
//!
//! Each observer gets its own spawned delivery task with retry and backoff.
//! Delivery runs after the status write has committed and never feeds back
//! into task state; exhausting the retries raises an alert.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::ports::{Alert, Alerter, StatusChange, StatusObserver};

/// Retry schedule for one observer delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl DeliveryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `base_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct ObserverHub {
    observers: Vec<Arc<dyn StatusObserver>>,
    alerter: Arc<dyn Alerter>,
    policy: DeliveryPolicy,
}

impl ObserverHub {
    pub fn new(
        observers: Vec<Arc<dyn StatusObserver>>,
        alerter: Arc<dyn Alerter>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            observers,
            alerter,
            policy,
        }
    }

    /// Spawn one delivery per observer. The handles are only useful to
    /// tests; production callers drop them.
    pub fn publish(&self, change: StatusChange) -> Vec<JoinHandle<()>> {
        let change = Arc::new(change);
        self.observers
            .iter()
            .map(|observer| {
                let observer = Arc::clone(observer);
                let alerter = Arc::clone(&self.alerter);
                let policy = self.policy.clone();
                let change = Arc::clone(&change);
                tokio::spawn(async move { deliver(observer, alerter, policy, change).await })
            })
            .collect()
    }

    pub fn alert(&self, alert: Alert) -> JoinHandle<()> {
        let alerter = Arc::clone(&self.alerter);
        tokio::spawn(async move { alerter.alert(alert).await })
    }
}

async fn deliver(
    observer: Arc<dyn StatusObserver>,
    alerter: Arc<dyn Alerter>,
    policy: DeliveryPolicy,
    change: Arc<StatusChange>,
) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match observer.on_status(&change).await {
            Ok(()) => return,
            Err(err) if attempt >= policy.max_attempts => {
                alerter
                    .alert(Alert::ObserverExhausted {
                        observer: observer.name().to_string(),
                        task_id: change.task_id,
                        attempts: attempt,
                        error: err.to_string(),
                    })
                    .await;
                return;
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    observer = observer.name(),
                    task_id = %change.task_id,
                    attempt,
                    retry_in = ?delay,
                    error = %err,
                    "status observer failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Phase, StageName, TaskId, TaskStatus, TenantId};
    use crate::ports::ObserverError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StatusObserver for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn on_status(&self, _change: &StatusChange) -> Result<(), ObserverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ObserverError("board unreachable".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<Alert>>);

    #[async_trait]
    impl Alerter for Recording {
        async fn alert(&self, alert: Alert) {
            self.0.lock().await.push(alert);
        }
    }

    fn change() -> StatusChange {
        StatusChange {
            task_id: TaskId::from_ulid(ulid::Ulid::new()),
            tenant_id: TenantId::new("acme"),
            from: None,
            to: TaskStatus::new(StageName::new("script"), Phase::Queued),
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            at: Utc::now(),
        }
    }

    fn fast() -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delivery_delay_doubles_and_caps() {
        let policy = DeliveryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_secs(1));
        assert_eq!(policy.delay_after(30), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn transient_observer_failure_is_retried() {
        let observer = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let alerts = Arc::new(Recording::default());
        let hub = ObserverHub::new(vec![observer.clone()], alerts.clone(), fast());

        for handle in hub.publish(change()) {
            handle.await.unwrap();
        }
        assert_eq!(observer.calls.load(Ordering::SeqCst), 3);
        assert!(alerts.0.lock().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_delivery_raises_alert() {
        let observer = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });
        let alerts = Arc::new(Recording::default());
        let hub = ObserverHub::new(vec![observer.clone()], alerts.clone(), fast());

        for handle in hub.publish(change()) {
            handle.await.unwrap();
        }
        let alerts = alerts.0.lock().await;
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            &alerts[0],
            Alert::ObserverExhausted { observer, attempts: 3, .. } if observer == "flaky"
        ));
    }
}
