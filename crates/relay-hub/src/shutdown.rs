//! Process-wide stop signal shared by the hub and subscriber roles.

use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the root [`CancellationToken`]. Session tokens, the broadcast
/// cadence and the subscriber supervisor all derive from it.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the root token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled with the root but cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Cancel everything, wait up to `timeout` for `handles` to finish, then
    /// abort whatever is still running.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(tasks = handles.len(), timeout_secs = timeout.as_secs(), "draining tasks");

        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            let stuck = aborts.iter().filter(|h| !h.is_finished()).count();
            warn!(stuck, "drain timed out after {timeout:?}, aborting");
            for handle in &aborts {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn shutdown_reaches_children() {
        let coord = ShutdownCoordinator::new();
        let child = coord.child_token();
        let root = coord.token();
        assert!(!root.is_cancelled());
        coord.shutdown();
        coord.shutdown();
        assert!(child.is_cancelled());
        assert!(root.is_cancelled());
    }

    #[test]
    fn child_cancel_leaves_root_alone() {
        let coord = ShutdownCoordinator::new();
        let child = coord.child_token();
        child.cancel();
        assert!(!coord.token().is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            let _ = done_tx.send(());
        });
        coord.drain(vec![handle], None).await;
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stuck_tasks() {
        let coord = ShutdownCoordinator::new();
        let (guard_tx, guard_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _guard = guard_tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        coord.drain(vec![handle], Some(Duration::from_millis(50))).await;

        // the aborted task drops its sender without sending
        let dropped = tokio::time::timeout(Duration::from_secs(1), guard_rx).await;
        assert!(matches!(dropped, Ok(Err(_))));
    }
}
