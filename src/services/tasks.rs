//! Supervisor for detached background work.
//!
//! Fire-and-forget side effects (API key `last_used` stamps, detached usage-log writes,
//! cancellation refunds) are spawned here instead of with a bare `tokio::spawn`, so
//! that:
//!
//! - their errors are reported through `tracing` in one place
//! - shutdown can wait for them to finish instead of dropping them

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Cloneable handle; all clones share the same in-flight count.
#[derive(Debug, Clone, Default)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

/// Decrements the in-flight count even if the task panics.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a detached task. A returned error is logged with the task name.
    ///
    /// Outside a tokio runtime (e.g. while one is being torn down) the task cannot run;
    /// this is logged and the work is dropped.
    pub fn spawn<F, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(task = name, "No runtime available, detached task dropped");
            return;
        };

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(self.inner.clone());

        handle.spawn(async move {
            let _guard = guard;
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Detached task failed");
            }
        });
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every spawned task has finished, or `limit` elapses.
    ///
    /// Returns `true` when the supervisor is idle.
    pub async fn drain(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.inner.idle.notified();
                tokio::pin!(idle);
                // Register before checking so a wakeup between the check and the await
                // is not lost
                idle.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        };

        tokio::time::timeout(limit, wait).await.is_ok()
    }
}
