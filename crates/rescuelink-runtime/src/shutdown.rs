//! Cooperative shutdown and the latched operator inputs (emergency stop,
//! return-home recall).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::info;

/// Cooperative cancellation token shared by every loop.
///
/// Starts running.  [`stop`](RunFlag::stop) is sticky; loops finish their
/// current iteration and exit.
#[derive(Clone, Debug)]
pub struct RunFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    /// Clear the flag.  Returns `true` if this call did the clearing.
    pub fn stop(&self) -> bool {
        let was_running = self.tx.send_replace(false);
        if was_running {
            info!("shutdown requested");
        }
        was_running
    }

    /// Resolve once the flag is cleared.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|running| !*running).await;
    }
}

/// A latched operator request.  Once triggered it stays triggered.
#[derive(Clone, Debug, Default)]
pub struct OperatorLatch {
    triggered: Arc<AtomicBool>,
}

/// Operator emergency stop.
pub type EmergencyLatch = OperatorLatch;

/// Operator recall: return home and end the mission.
pub type RecallLatch = OperatorLatch;

impl OperatorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call latched the request.
    pub fn trigger(&self) -> bool {
        !self.triggered.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_is_sticky_and_reported_once() {
        let flag = RunFlag::new();
        assert!(flag.is_running());
        assert!(flag.stop());
        assert!(!flag.stop());
        assert!(!flag.clone().is_running());
    }

    #[tokio::test]
    async fn stopped_wakes_waiters() {
        let flag = RunFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.stopped().await })
        };
        tokio::task::yield_now().await;
        flag.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn stopped_returns_immediately_when_already_stopped() {
        let flag = RunFlag::new();
        flag.stop();
        tokio::time::timeout(Duration::from_millis(50), flag.stopped())
            .await
            .expect("already stopped");
    }

    #[test]
    fn latch_triggers_once() {
        let latch = EmergencyLatch::new();
        let shared = latch.clone();
        assert!(!latch.is_triggered());
        assert!(shared.trigger());
        assert!(!latch.trigger());
        assert!(latch.is_triggered());
    }
}
