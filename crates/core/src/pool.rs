//! Bounded worker pool for per-component tasks.
//!
//! Every item becomes a spawned tokio task that holds a semaphore permit
//! while it runs, so at most `limit` tasks make progress at once. Results
//! come back in input order once every task has settled.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::debug;

/// Default ceiling on in-flight tasks.
pub const DEFAULT_CONCURRENCY: usize = 30;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl WorkerPool {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `f` over every item and wait for all of them. A task that panics
    /// yields a `JoinError` in its slot; siblings are unaffected.
    pub async fn map<I, T, F, Fut>(&self, items: Vec<I>, f: F) -> Vec<Result<T, JoinError>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let count = items.len();
        let f = Arc::new(f);
        let handles: Vec<_> = items
            .into_iter()
            .map(|item| {
                let semaphore = Arc::clone(&self.semaphore);
                let f = Arc::clone(&f);
                tokio::spawn(async move {
                    // The semaphore is never closed.
                    let _permit = semaphore.acquire_owned().await.ok();
                    f(item).await
                })
            })
            .collect();

        debug!(tasks = count, limit = self.limit, "waiting for pool tasks");
        join_all(handles).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let pool = WorkerPool::new(4);
        let results = pool
            .map((0..20u64).collect(), |n| async move {
                tokio::time::sleep(Duration::from_millis(20 - n)).await;
                n * 2
            })
            .await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_limit() {
        let pool = WorkerPool::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
        pool.map((0..12).collect::<Vec<u32>>(), move |_| {
            let (c, p) = (Arc::clone(&c), Arc::clone(&p));
            async move {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                c.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_abort_siblings() {
        let pool = WorkerPool::new(2);
        let results = pool
            .map(vec![1, 2, 3], |n| async move {
                if n == 2 {
                    panic!("boom");
                }
                n
            })
            .await;
        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &3);
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        assert_eq!(WorkerPool::new(0).limit(), 1);
        assert_eq!(WorkerPool::default().limit(), DEFAULT_CONCURRENCY);
    }
}
