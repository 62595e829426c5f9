//! Deduplication of expensive work on a [`WorkerPool`].
//!
//! A [`ResourceHandler`] guarantees that work for a [`RequestKey`] runs at most once at a time:
//! callers submitting a key that is already being computed join the running computation and
//! receive a copy of its result. Results are kept for a short grace period after completion, so
//! callers arriving right after the work finished do not compute it again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::caching::{CacheEntry, CacheError};
use crate::pool::WorkerPool;
use crate::types::RequestKey;
use crate::utils::futures::CallOnDrop;

type ResultChannel<T> = Shared<oneshot::Receiver<CacheEntry<T>>>;
type WorkMap<T> = Arc<Mutex<HashMap<RequestKey, InFlight<T>>>>;

enum WorkState<T> {
    Pending(ResultChannel<T>),
    Done(CacheEntry<T>),
}

/// The record of one computation for a key.
///
/// The generation tells records for the same key apart, so a stale purge never removes the
/// record of a newer computation.
struct InFlight<T> {
    generation: u64,
    state: WorkState<T>,
}

/// Runs work on a [`WorkerPool`], joining identical requests.
pub struct ResourceHandler<T> {
    pool: WorkerPool,
    grace_period: Duration,
    work: WorkMap<T>,
    generations: AtomicU64,
    runtime: tokio::runtime::Handle,
}

impl<T> std::fmt::Debug for ResourceHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandler")
            .field("pool", &self.pool)
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

impl<T> ResourceHandler<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        pool: WorkerPool,
        grace_period: Duration,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            pool,
            grace_period,
            work: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            runtime,
        }
    }

    pub fn name(&self) -> &'static str {
        self.pool.name()
    }

    /// The pool this handler runs its work on.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The number of keys that are either running or within their grace period.
    pub fn len(&self) -> usize {
        self.work.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the result of the work for `key`, running `work` if necessary.
    ///
    /// `work` is only invoked if there is neither a running computation nor a recent result for
    /// `key`. The computation is detached from the caller: dropping the returned future does not
    /// cancel it, since other callers may be waiting for the same result.
    pub async fn submit<W, F>(&self, key: RequestKey, work: W) -> CacheEntry<T>
    where
        W: FnOnce() -> F,
        F: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let name = self.name();
        let channel = {
            let mut entries = self.work.lock().unwrap();
            match entries.get(&key).map(|entry| &entry.state) {
                Some(WorkState::Done(result)) => {
                    metric!(counter("handler.submit") += 1, "handler" => name, "status" => "cached");
                    return result.clone();
                }
                Some(WorkState::Pending(channel)) => {
                    metric!(counter("handler.submit") += 1, "handler" => name, "status" => "joined");
                    drop(work);
                    channel.clone()
                }
                None => {
                    metric!(counter("handler.submit") += 1, "handler" => name, "status" => "new");
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let channel = self.spawn_work(key.clone(), generation, work());
                    let state = WorkState::Pending(channel.clone());
                    entries.insert(key, InFlight { generation, state });
                    channel
                }
            }
        };

        channel.await.unwrap_or_else(|_canceled| {
            tracing::error!(handler = name, "Work channel dropped before completion");
            Err(CacheError::InternalError)
        })
    }

    fn spawn_work<F>(&self, key: RequestKey, generation: u64, work: F) -> ResultChannel<T>
    where
        F: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let entries = Arc::clone(&self.work);
        let purge_key = key.clone();
        let purge_token = CallOnDrop::new(move || {
            let mut entries = entries.lock().unwrap();
            if entries
                .get(&purge_key)
                .is_some_and(|entry| entry.generation == generation)
            {
                entries.remove(&purge_key);
            }
        });

        let pool = self.pool.clone();
        let entries = Arc::clone(&self.work);
        let grace_period = self.grace_period;
        let driver = async move {
            let result = pool.run(work).await;

            let memorable = match &result {
                Ok(_) => true,
                Err(err) => err.is_memorable(),
            };
            if !memorable || grace_period.is_zero() {
                // Purge first, so callers either join this computation or start a new one.
                drop(purge_token);
                sender.send(result).ok();
                return;
            }

            {
                let mut entries = entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(&key) {
                    if entry.generation == generation {
                        entry.state = WorkState::Done(result.clone());
                    }
                }
            }
            sender.send(result).ok();

            tokio::time::sleep(grace_period).await;
            drop(purge_token);
        };

        self.runtime
            .spawn(driver.bind_hub(Hub::new_from_top(Hub::current())));

        receiver.shared()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn handler(grace_period: Duration) -> ResourceHandler<u64> {
        let runtime = tokio::runtime::Handle::current();
        let pool = WorkerPool::new("test", 4, runtime.clone());
        ResourceHandler::new(pool, grace_period, runtime)
    }

    /// Submits work for `key` that takes `delay` and counts its executions in `calls`.
    async fn submit(
        handler: &ResourceHandler<u64>,
        key: &str,
        calls: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> CacheEntry<u64> {
        let calls = Arc::clone(calls);
        handler
            .submit(RequestKey::from(key), move || async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) as u64;
                tokio::time::sleep(delay).await;
                Ok(call)
            })
            .await
    }

    async fn explode() -> CacheEntry<u64> {
        panic!("work failed")
    }

    #[tokio::test]
    async fn test_concurrent_submits_run_once() {
        mediarepo_test::setup();
        let handler = Arc::new(handler(Duration::from_secs(30)));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let handler = Arc::clone(&handler);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    submit(&handler, "k", &calls, Duration::from_millis(50)).await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(0));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_join() {
        mediarepo_test::setup();
        let handler = handler(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = futures::join!(
            submit(&handler, "a", &calls, Duration::from_millis(20)),
            submit(&handler, "b", &calls, Duration::from_millis(20)),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_ne!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_results_kept_for_grace_period() {
        mediarepo_test::setup();
        let handler = handler(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(submit(&handler, "k", &calls, Duration::ZERO).await, Ok(0));
        assert_eq!(submit(&handler, "k", &calls, Duration::ZERO).await, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handler.is_empty());
        assert_eq!(submit(&handler, "k", &calls, Duration::ZERO).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_kept() {
        mediarepo_test::setup();
        let handler = handler(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result = handler
                .submit(RequestKey::from("k"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CacheError::NotFound)
                })
                .await;
            assert_eq!(result, Err(CacheError::NotFound));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panics_are_retried() {
        mediarepo_test::setup();
        let handler = Arc::new(handler(Duration::from_secs(30)));

        let joined: Vec<_> = (0..4)
            .map(|_| {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler
                        .submit(RequestKey::from("k"), || async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            explode().await
                        })
                        .await
                })
            })
            .collect();
        for task in joined {
            assert_eq!(task.await.unwrap(), Err(CacheError::InternalError));
        }

        // the failure is not remembered, and the pool survived
        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(submit(&handler, "k", &calls, Duration::ZERO).await, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_submit_keeps_running() {
        mediarepo_test::setup();
        let handler = handler(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            submit(&handler, "k", &calls, Duration::from_millis(50)),
        )
        .await;
        assert!(abandoned.is_err());

        // joins the computation the first caller started
        assert_eq!(submit(&handler, "k", &calls, Duration::ZERO).await, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
