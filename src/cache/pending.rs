//! Tracking for background cache writes.
//!
//! Storing a captured response happens after the client has been answered.
//! [`PendingWrites`] spawns those writes, counts them, and lets shutdown
//! wait until they have landed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{info, warn};

#[derive(Default)]
struct Tracker {
    active: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when the write finishes or panics.
struct WriteGuard {
    tracker: Arc<Tracker>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Spawner and counter for detached store operations.
///
/// Cloning shares the counter.
#[derive(Clone, Default)]
pub struct PendingWrites {
    tracker: Arc<Tracker>,
    permits: Option<Arc<Semaphore>>,
}

impl PendingWrites {
    /// Unbounded: every write starts immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// At most `max_concurrent` writes run at once; the rest queue.
    pub fn bounded(max_concurrent: usize) -> Self {
        Self {
            tracker: Arc::default(),
            permits: Some(Arc::new(Semaphore::new(max_concurrent.max(1)))),
        }
    }

    /// Runs `write` on the tokio runtime and counts it until it completes.
    pub fn spawn<F>(&self, write: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.active.fetch_add(1, Ordering::AcqRel);
        let guard = WriteGuard {
            tracker: Arc::clone(&self.tracker),
        };
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match permits {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            write.await;
        });
    }

    /// Number of writes spawned but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.active.load(Ordering::Acquire)
    }

    /// Waits for every in-flight write to finish.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.tracker.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        };

        if tokio::time::timeout(timeout, wait).await.is_err() {
            warn!(pending = self.in_flight(), "cache write drain timed out");
            return false;
        }
        info!("all cache writes drained");
        true
    }
}
