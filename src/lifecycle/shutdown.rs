//! Shutdown coordination: one root `CancellationToken` and a task tracker

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Root token plus the tracker for every background task modules spawn
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
    begun: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            begun: AtomicBool::new(false),
        }
    }

    /// The root token itself
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled together with the root
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Run `task` on the tracker
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Claim the shutdown; only the first caller gets `true`
    pub fn begin(&self) -> bool {
        !self.begun.swap(true, Ordering::AcqRel)
    }

    /// Cancel the root token
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun or the root was cancelled
    pub fn is_shutting_down(&self) -> bool {
        self.begun.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    /// Tasks still running on the tracker
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel, then wait up to `timeout` for tracked tasks
    ///
    /// Returns the number of tasks abandoned at the deadline.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.cancel();
        self.tracker.close();
        info!(
            task_count = self.tracker.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Waiting for background tasks to complete"
        );

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            let abandoned = self.tracker.len();
            warn!(abandoned, "Shutdown timed out after {timeout:?}, abandoning tasks");
            return abandoned;
        }
        0
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.pending(), 0);
    }

    #[test]
    fn test_begin_claims_once() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.begin());
        assert!(!coord.begin());
        assert!(coord.is_shutting_down());
    }

    #[test]
    fn test_child_tokens_follow_root() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.child_token();
        let t2 = coord.token();
        coord.cancel();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.child_token();
        coord.spawn(async move {
            token.cancelled().await;
        });

        assert_eq!(coord.drain(Duration::from_secs(1)).await, 0);
        assert_eq!(coord.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_abandons_stuck_tasks() {
        let coord = ShutdownCoordinator::new();
        coord.spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        let abandoned = coord.drain(Duration::from_millis(50)).await;
        assert_eq!(abandoned, 1);
    }
}
