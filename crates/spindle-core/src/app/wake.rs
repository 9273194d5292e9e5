//! Wake signal for idle workers.
//!
//! Purely a latency optimization: a dropped signal only delays work until
//! the next fallback poll.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signaled,
    TimedOut,
}

#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake one idle worker. If none is waiting, the next one to wait
    /// returns immediately.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wake every worker currently waiting.
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    /// Wait for a signal, at most `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Wake {
        tokio::select! {
            _ = self.notify.notified() => Wake::Signaled,
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
        }
    }
}
