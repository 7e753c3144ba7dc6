use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::FutureExt;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinHandle},
};

/// A bounded pool of workers running futures on the Tokio runtime.
///
/// At most `workers` submitted futures make progress at the same time. The queue of waiting
/// futures is unbounded and served in submission order. Cloning the pool shares the same permits,
/// so one pool can be handed to every interface of a test run.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WORKERS)
    }
}

impl WorkerPool {
    /// Number of concurrent workers used by [`WorkerPool::default`].
    pub const DEFAULT_WORKERS: usize = 10;

    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self { permits: Arc::new(Semaphore::new(workers)), workers }
    }

    /// Number of concurrent workers.
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Number of workers currently idle.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Submits `future` to the pool and returns a handle to its result. The future starts as soon
    /// as a worker is free; the handle does not need to be polled for that to happen.
    pub fn spawn<F>(&self, future: F) -> Pending<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            // The semaphore is never closed, a missing permit cannot happen.
            let _permit = permits.acquire_owned().await.ok();
            future.await
        });

        Pending { handle }
    }
}

/// Handle to an operation submitted to a [`WorkerPool`].
///
/// Dropping the handle does not cancel the operation, it keeps running to completion.
#[derive(Debug)]
pub struct Pending<T> {
    handle: JoinHandle<T>,
}

impl<T> Pending<T> {
    /// Waits for the operation to complete.
    pub async fn join(self) -> Result<T, JoinError> {
        self.handle.await
    }

    /// Returns `true` once the operation has completed.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().handle.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles = (0..5)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                })
            })
            .collect::<Vec<_>>();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.join().await.unwrap());
        }

        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn pending_can_be_awaited_directly() {
        let pool = WorkerPool::default();
        assert_eq!(pool.workers(), WorkerPool::DEFAULT_WORKERS);

        let value = pool.spawn(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }
}
