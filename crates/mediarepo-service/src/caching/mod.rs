//! # Content caching
//!
//! Serving media, thumbnails and URL previews means reading blobs from a datastore, which is
//! slow compared to memory. This module holds the content cache that sits in front of those
//! reads, our central [`CacheError`] type, and the bookkeeping that drives cache admission.
//!
//! ## Backends
//!
//! The [`ContentCache`] is one of:
//!
//! - An in-memory [`AdaptiveCache`], bounded by an aggregate byte budget. It only admits content
//!   that is popular, as counted by the [`DownloadTracker`], and uses the [`CooldownLedger`] to
//!   enforce a minimum dwell time after each admission and eviction.
//! - A [`RemoteCache`], which writes everything that fits through to storage shared between
//!   repository instances and leaves expiry to that storage.
//! - Disabled, in which case every access is a miss.
//!
//! Callers are indifferent to which backend is active: all of them offer
//! [`get_or_fetch`](ContentCache::get_or_fetch), which returns either the cached bytes or the
//! stream produced by the fetch function. Failures of a cache backend are never surfaced, the
//! access degrades to a miss.
//!
//! ## Admission
//!
//! Downloads are counted independently of the cache state, so a miss still counts towards
//! admission. Once an item reaches `min_downloads` within the tracked window, the next access
//! reads it into memory and offers it to the cache. If there is not enough free space, an
//! eviction sweep looks for less popular items that are not under an admission cooldown. If
//! the sweep can not free enough space, nothing is evicted and the item stays uncached.
//!
//! Cached items whose popularity dropped below the threshold are demoted on their next access.
//! A background sweep additionally reclaims space from faded items every `cleanup_interval`.
//!
//! ### Metrics
//!
//! - `caches.content.access`: All accesses, tagged with an `outcome` of `hit`, `miss` or
//!   `admitted`.
//! - `caches.content.refused`: Eligible items that were not admitted, tagged with a `reason`.
//! - `caches.content.eviction`: Evicted items, tagged with a `reason`.
//! - `caches.content.bytes` / `caches.content.items`: Gauges of the in-memory cache usage.
//! - `caches.remote.fetch` / `caches.remote.store`: Accesses to the remote cache.
//!
//! ## [`CacheEntry`] / [`CacheError`]
//!
//! All fallible operations in this crate return a [`CacheEntry`], which is just an alias for a
//! [`Result`] around a [`CacheError`]. [`CacheError::InternalError`] is a catch-all for
//! unexpected errors, including panics in pooled work. It is logged when it happens and never
//! remembered, so the next request for the same resource is retried.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::config::Config;
use crate::types::{ByteStream, ContentKey};
use crate::utils::streams::bytes_stream;

mod cache_error;
mod cooldown;
mod memory;
mod remote;
mod tracker;


pub use cache_error::{CacheEntry, CacheError};
pub use cooldown::{Cooldown, CooldownLedger};
pub use memory::AdaptiveCache;
pub use remote::RemoteCache;
pub use tracker::DownloadTracker;

/// Content as served to a caller.
///
/// Cached content is handed out as a cheap, read-only view of the cached buffer, so evicting
/// it can not affect a reader.
pub enum Content {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl Content {
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Bytes(bytes) => bytes_stream(bytes),
            Self::Stream(stream) => stream,
        }
    }

    /// Reads the whole content into memory.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").finish_non_exhaustive(),
        }
    }
}

/// How a [`ContentCache`] access was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache.
    Hit,
    /// Fetched, and admitted into the cache.
    Admitted,
    /// Fetched, and not cached.
    Miss,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Admitted => "admitted",
            Self::Miss => "miss",
        }
    }
}

#[derive(Debug)]
pub struct CachedContent {
    pub outcome: CacheOutcome,
    pub content: Content,
}

impl CachedContent {
    /// Passes through to `fetch` without involving the cache.
    async fn fetched<F, Fut>(fetch: F) -> CacheEntry<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<ByteStream>>,
    {
        let stream = fetch().await?;
        metric!(counter("caches.content.access") += 1, "outcome" => "miss");
        Ok(Self {
            outcome: CacheOutcome::Miss,
            content: Content::Stream(stream),
        })
    }
}

/// The content cache in front of all datastore reads.
#[derive(Debug)]
pub enum ContentCache {
    Memory(Arc<AdaptiveCache>),
    Remote(RemoteCache),
    Disabled,
}

impl ContentCache {
    /// Creates the backend selected by `config`.
    ///
    /// The in-memory cache starts its background sweep on `runtime`.
    pub fn from_config(config: &Config, runtime: tokio::runtime::Handle) -> Self {
        if let Some(remote) = &config.remote_cache {
            tracing::info!("Using remote content cache");
            return Self::Remote(RemoteCache::new(
                remote.clone(),
                config.cache.max_file_size_bytes,
                runtime,
            ));
        }
        if !config.cache.enabled {
            tracing::info!("Content cache is disabled");
            return Self::Disabled;
        }

        let cache = Arc::new(AdaptiveCache::new(config.cache.clone()));
        cache.spawn_cleanup(&runtime);
        Self::Memory(cache)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Remote(_) => "remote",
            Self::Disabled => "disabled",
        }
    }

    /// Records one download of `key`.
    ///
    /// Each logical request should be recorded exactly once, no matter whether it is served
    /// from the cache.
    pub fn mark_download(&self, key: &ContentKey) -> u64 {
        match self {
            Self::Memory(cache) => cache.mark_download(key),
            Self::Remote(_) | Self::Disabled => 0,
        }
    }

    pub fn download_count(&self, key: &ContentKey) -> u64 {
        match self {
            Self::Memory(cache) => cache.download_count(key),
            Self::Remote(_) | Self::Disabled => 0,
        }
    }

    /// Serves `key` from the cache, or from `fetch` on a miss.
    ///
    /// `size` is the expected size of the content, if known.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &ContentKey,
        size: Option<u64>,
        fetch: F,
    ) -> CacheEntry<CachedContent>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<ByteStream>>,
    {
        match self {
            Self::Memory(cache) => cache.get_or_fetch(key, size, fetch).await,
            Self::Remote(cache) => cache.get_or_fetch(key, size, fetch).await,
            Self::Disabled => CachedContent::fetched(fetch).await,
        }
    }

    /// Applies changed cache settings at runtime.
    ///
    /// Switching between backends requires a restart.
    pub fn reconfigure(&self, config: &Config) {
        match self {
            Self::Memory(cache) => cache.reconfigure(config.cache.clone()),
            Self::Remote(_) | Self::Disabled => {
                tracing::debug!(backend = self.name(), "Content cache is not reconfigurable");
            }
        }
    }

    /// Forgets all cached content and bookkeeping.
    pub fn clear(&self) {
        if let Self::Memory(cache) = self {
            cache.clear();
        }
    }
}
