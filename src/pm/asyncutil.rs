use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Counts the pipeline tasks (waiters, output pumps, background joins) that are still alive, so the
/// daemon can report leaks and drain them on shutdown.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    active: AtomicUsize,
    spawned_total: AtomicUsize,
    idle: Notify,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks currently running or pending.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn total_spawned(&self) -> usize {
        self.inner.spawned_total.load(Ordering::SeqCst)
    }

    /// Spawn a Tokio task whose lifetime is tracked by an RAII guard, so completion, panic and
    /// cancellation all decrement the count.
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.spawned_total.fetch_add(1, Ordering::SeqCst);
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = TaskGuard {
            inner: Arc::clone(&self.inner),
        };
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Wait until no tracked task is alive. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active_count() == 0;
            }
        }
    }
}

#[derive(Debug)]
struct TaskGuard {
    inner: Arc<Inner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_and_drains() {
        let t = TaskTracker::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let h = t.spawn(async move {
            let _ = rx.await;
            7
        });
        assert_eq!(t.active_count(), 1);
        assert!(!t.wait_idle(Duration::from_millis(50)).await);

        tx.send(()).unwrap();
        assert_eq!(h.await.unwrap(), 7);
        assert!(t.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.total_spawned(), 1);
    }

    #[tokio::test]
    async fn aborted_task_is_released() {
        let t = TaskTracker::new();
        let h = t.spawn(std::future::pending::<()>());
        h.abort();
        let _ = h.await;
        assert!(t.wait_idle(Duration::from_secs(1)).await);
    }
}
