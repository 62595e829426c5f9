use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};

use sentry::{Hub, SentryFutureExt};
use tokio::sync::Semaphore;

use crate::caching::{CacheEntry, CacheError};
use crate::utils::futures::{m, measure};

#[derive(Debug)]
struct PoolInner {
    name: &'static str,
    permits: Arc<Semaphore>,
    workers: Mutex<usize>,
    runtime: tokio::runtime::Handle,
}

/// A fixed number of worker slots for expensive work.
///
/// Every job runs as its own task on the runtime once it acquired a slot, so it keeps running
/// even when the caller that submitted it goes away. A panicking job is turned into
/// [`CacheError::InternalError`] and leaves the pool intact.
///
/// The number of slots can be changed at runtime. Shrinking the pool waits for running jobs to
/// finish before retiring their slots.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize, runtime: tokio::runtime::Handle) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name,
                permits: Arc::new(Semaphore::new(workers)),
                workers: Mutex::new(workers),
                runtime,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// The configured number of worker slots.
    pub fn workers(&self) -> usize {
        *self.inner.workers.lock().unwrap()
    }

    /// Changes the number of worker slots without interrupting running jobs.
    pub fn resize(&self, workers: usize) {
        let workers = workers.max(1);
        let mut current = self.inner.workers.lock().unwrap();
        if workers == *current {
            return;
        }
        tracing::info!(pool = self.inner.name, from = *current, to = workers, "Resizing worker pool");

        if workers > *current {
            self.inner.permits.add_permits(workers - *current);
        } else {
            let surplus = (*current - workers) as u32;
            let permits = Arc::clone(&self.inner.permits);
            self.inner.runtime.spawn(async move {
                if let Ok(retired) = permits.acquire_many_owned(surplus).await {
                    retired.forget();
                }
            });
        }
        *current = workers;
        metric!(gauge("pool.workers") = workers as u64, "pool" => self.inner.name);
    }

    /// Runs `job` on a worker slot once one is free.
    pub async fn run<F, T>(&self, job: F) -> CacheEntry<T>
    where
        F: Future<Output = CacheEntry<T>> + Send + 'static,
        T: Send + 'static,
    {
        let name = self.inner.name;
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(CacheError::from_std_error)?;

        let job = measure("pool.job", m::result, Some(("pool", name.into())), job);
        let task = async move {
            let _permit = permit;
            job.await
        };
        let handle = self
            .inner
            .runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                let panic = panic_message(&*payload);
                tracing::error!(pool = name, panic, "Pooled work panicked");
                Err(CacheError::InternalError)
            }
            Err(err) => Err(CacheError::from_std_error(err)),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Runs `jobs` sleeping jobs on `pool` and returns the maximum observed concurrency.
    async fn max_concurrency(pool: &WorkerPool, jobs: usize) -> usize {
        let running = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..jobs)
            .map(|_| {
                let pool = pool.clone();
                let running = Arc::clone(&running);
                let max = Arc::clone(&max);
                tokio::spawn(async move {
                    pool.run(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        max.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        mediarepo_test::setup();
        let pool = WorkerPool::new("test", 2, tokio::runtime::Handle::current());

        let max = max_concurrency(&pool, 6).await;
        assert!(max <= 2, "{max} jobs ran at the same time");
    }

    async fn explode() -> CacheEntry<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        mediarepo_test::setup();
        let pool = WorkerPool::new("test", 1, tokio::runtime::Handle::current());

        let result = pool.run(explode()).await;
        assert_eq!(result, Err(CacheError::InternalError));

        // the slot is released and the pool keeps working
        let result = pool.run(async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        mediarepo_test::setup();
        let pool = WorkerPool::new("test", 1, tokio::runtime::Handle::current());

        let result: CacheEntry<()> = pool.run(async { Err(CacheError::NotFound) }).await;
        assert_eq!(result, Err(CacheError::NotFound));
    }

    #[tokio::test]
    async fn test_resize() {
        mediarepo_test::setup();
        let pool = WorkerPool::new("test", 1, tokio::runtime::Handle::current());
        assert_eq!(max_concurrency(&pool, 4).await, 1);

        pool.resize(3);
        assert_eq!(pool.workers(), 3);
        let max = max_concurrency(&pool, 6).await;
        assert!(max > 1 && max <= 3, "{max} jobs ran at the same time");

        pool.resize(1);
        // give the retired slots a chance to be collected
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.workers(), 1);
        assert_eq!(max_concurrency(&pool, 4).await, 1);
    }
}
