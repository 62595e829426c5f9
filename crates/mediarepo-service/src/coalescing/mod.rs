//! # Coalescing front door
//!
//! Controllers put a [`CoalescingGroup`] in front of everything they do for a [`RequestKey`].
//! The first caller for a key starts the work in a detached task, and every caller arriving
//! before it completes waits for the same result. Since the result of a controller usually
//! carries a byte stream that can only be read once, [`CoalescingGroup::run_multi`] hands every
//! waiter its own [`Replicate`]d copy, splitting streams with a [`Fanout`].
//!
//! Callers that give up waiting simply drop their copy. The work itself is never cancelled by a
//! caller, as other callers may still wait for it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::channel::oneshot;
use sentry::{Hub, SentryFutureExt};

use crate::caching::{CacheEntry, CacheError, Content};
use crate::types::RequestKey;
use crate::utils::futures::CallOnDrop;

mod fanout;

pub use fanout::Fanout;

/// Values that can be handed to several waiters.
pub trait Replicate: Sized {
    /// Turns `self` into `copies` independent values.
    fn replicate(self, copies: usize, fanout: &Fanout) -> Vec<Self>;
}

impl Replicate for Content {
    fn replicate(self, copies: usize, fanout: &Fanout) -> Vec<Self> {
        match self {
            Content::Bytes(bytes) => (0..copies).map(|_| Content::Bytes(bytes.clone())).collect(),
            Content::Stream(stream) => fanout
                .split(stream, copies)
                .into_iter()
                .map(Content::Stream)
                .collect(),
        }
    }
}

type Waiters<T> = Vec<oneshot::Sender<CacheEntry<T>>>;

struct Flight<T> {
    generation: u64,
    waiters: Waiters<T>,
}

type FlightMap<T> = Arc<Mutex<HashMap<RequestKey, Flight<T>>>>;

/// A singleflight group for one call site.
pub struct CoalescingGroup<T> {
    name: &'static str,
    flights: FlightMap<T>,
    generations: AtomicU64,
    fanout: Fanout,
}

impl<T> std::fmt::Debug for CoalescingGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingGroup")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> CoalescingGroup<T> {
    pub fn new(name: &'static str, fanout: Fanout) -> Self {
        Self {
            name,
            flights: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            fanout,
        }
    }

    /// The number of keys with work in flight.
    pub fn len(&self) -> usize {
        self.flights.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` for `key` unless it is already running, and returns a clone of its result.
    pub async fn run<F, Fut>(&self, key: RequestKey, f: F) -> CacheEntry<T>
    where
        T: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        self.coalesce(key, f, |value, copies, _| {
            std::iter::repeat_n(value, copies).collect()
        })
        .await
    }

    /// Runs `f` for `key` unless it is already running, and returns an independent copy of its
    /// result to every waiter.
    ///
    /// The number of copies is the number of callers still waiting when `f` completes. A single
    /// waiter receives the result as is.
    pub async fn run_multi<F, Fut>(&self, key: RequestKey, f: F) -> CacheEntry<T>
    where
        T: Replicate,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        self.coalesce(key, f, |value, copies, fanout| value.replicate(copies, fanout))
            .await
    }

    async fn coalesce<F, Fut, S>(&self, key: RequestKey, f: F, split: S) -> CacheEntry<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
        S: FnOnce(T, usize, &Fanout) -> Vec<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let started = {
            let mut flights = self.flights.lock().unwrap();
            match flights.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().waiters.push(sender);
                    None
                }
                Entry::Vacant(entry) => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    entry.insert(Flight {
                        generation,
                        waiters: vec![sender],
                    });
                    Some(generation)
                }
            }
        };

        match started {
            Some(generation) => self.spawn_flight(key, generation, f(), split),
            None => drop((f, split)),
        }

        receiver.await.unwrap_or_else(|_canceled| {
            tracing::error!(group = self.name, "Coalesced work was dropped before completion");
            Err(CacheError::InternalError)
        })
    }

    fn spawn_flight<Fut, S>(&self, key: RequestKey, generation: u64, future: Fut, split: S)
    where
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
        S: FnOnce(T, usize, &Fanout) -> Vec<T> + Send + 'static,
    {
        let name = self.name;
        let fanout = self.fanout.clone();
        let flights = Arc::clone(&self.flights);

        let land_token = CallOnDrop::new({
            let flights = Arc::clone(&flights);
            let key = key.clone();
            move || {
                land(&flights, &key, generation);
            }
        });

        let driver = async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|_panic| {
                    tracing::error!(group = name, "Coalesced work panicked");
                    Err(CacheError::InternalError)
                });

            let waiters: Waiters<T> = land(&flights, &key, generation)
                .into_iter()
                .filter(|waiter| !waiter.is_canceled())
                .collect();
            drop(land_token);
            metric!(histogram("coalescing.waiters") = waiters.len() as u64, "group" => name);

            match result {
                Ok(value) => {
                    let copies = split(value, waiters.len(), &fanout);
                    for (waiter, copy) in waiters.into_iter().zip(copies) {
                        waiter.send(Ok(copy)).ok();
                    }
                }
                Err(err) => {
                    for waiter in waiters {
                        waiter.send(Err(err.clone())).ok();
                    }
                }
            }
        };

        self.fanout
            .runtime()
            .spawn(driver.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

/// Removes the flight for `key` and returns its waiters.
///
/// Does nothing if the flight was already replaced by a newer one.
fn land<T>(flights: &FlightMap<T>, key: &RequestKey, generation: u64) -> Waiters<T> {
    let mut flights = flights.lock().unwrap();
    if flights
        .get(key)
        .is_some_and(|flight| flight.generation == generation)
    {
        if let Some(flight) = flights.remove(key) {
            return flight.waiters;
        }
    }
    Vec::new()
}
