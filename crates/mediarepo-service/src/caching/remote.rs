//! A write-through content cache backed by storage shared between repository instances.
//!
//! The remote cache does no popularity tracking of its own: everything that fits is written
//! through on a miss, and expiry is left to the remote store. Errors are transparently hidden,
//! either an item is available or it is not.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs;

use crate::config::{FilesystemRemoteCacheConfig, RemoteCacheBackendConfig, RemoteCacheConfig};
use crate::types::{ByteStream, ContentKey};
use crate::utils::futures::{CancelOnDrop, m, measure};
use crate::utils::streams::{Buffered, buffer_stream};

use super::{CacheEntry, CacheOutcome, CachedContent, Content};

/// The result of an attempt to write an entry to the remote cache.
#[derive(Debug, Clone, Copy)]
enum RemoteStoreResult {
    /// Successfully written to the cache as a new entry, contains number of bytes written.
    Written(u64),
    /// Skipped writing the item as it was already on the cache.
    Skipped,
}

impl AsRef<str> for RemoteStoreResult {
    fn as_ref(&self) -> &str {
        match self {
            RemoteStoreResult::Written(_) => "written",
            RemoteStoreResult::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RemoteStoreResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// The on-disk name of a key.
///
/// Keys may contain arbitrary characters, so they are hashed and fanned out over
/// subdirectories by their first two hex digits.
fn key_path(key: &ContentKey) -> PathBuf {
    let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
    PathBuf::from(&digest[..2]).join(digest)
}

impl FilesystemRemoteCacheConfig {
    async fn fetch(self, key: PathBuf) -> io::Result<Option<Bytes>> {
        let abspath = self.path.join(key);
        tracing::debug!("Fetching content from {}", abspath.display());
        match fs::read(&abspath).await {
            Ok(content) => Ok(Some(content.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn store(self, key: PathBuf, content: Bytes) -> io::Result<RemoteStoreResult> {
        let abspath = self.path.join(key);
        let parent_dir = abspath
            .parent()
            .ok_or_else(|| io::Error::other("remote cache directory not found"))?;
        fs::create_dir_all(parent_dir).await?;
        if fs::try_exists(&abspath).await? {
            return Ok(RemoteStoreResult::Skipped);
        }

        let temp_dir = self.path.join(".tmp");
        fs::create_dir_all(&temp_dir).await?;
        let temp_file = NamedTempFile::new_in(&temp_dir)?;
        fs::write(temp_file.path(), &content).await?;
        temp_file.persist(abspath).map_err(|err| err.error)?;

        Ok(RemoteStoreResult::Written(content.len() as u64))
    }
}

#[derive(Debug, Clone)]
enum RemoteCacheBackend {
    Fs(FilesystemRemoteCacheConfig),
}

impl RemoteCacheBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::Fs(_) => "filesystem",
        }
    }
}

/// A content cache shared between repository instances.
#[derive(Debug)]
pub struct RemoteCache {
    backend: RemoteCacheBackend,
    timeout: Duration,
    max_item_bytes: u64,
    runtime: tokio::runtime::Handle,
}

impl RemoteCache {
    pub fn new(
        config: RemoteCacheConfig,
        max_item_bytes: u64,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let backend = match config.backend {
            RemoteCacheBackendConfig::Filesystem(cfg) => RemoteCacheBackend::Fs(cfg),
        };
        Self {
            backend,
            timeout: config.timeout,
            max_item_bytes,
            runtime,
        }
    }

    /// Retrieves `key` from the remote cache.
    ///
    /// Failures and timeouts are logged and reported as a miss.
    #[tracing::instrument(name = "fetch_remote_cache", skip(self))]
    pub async fn fetch(&self, key: &ContentKey) -> Option<Bytes> {
        let backend_name = self.backend.name();
        let future = match &self.backend {
            RemoteCacheBackend::Fs(cfg) => cfg.clone().fetch(key_path(key)),
        };
        let future = CancelOnDrop::new(
            self.runtime
                .spawn(future.bind_hub(Hub::new_from_top(Hub::current()))),
        )
        .map(|result| result.unwrap_or_else(|err| Err(io::Error::other(err))));
        let future = tokio::time::timeout(self.timeout, future);
        let result = measure(
            "remote_cache.fetch",
            m::timed_result,
            Some(("backend", backend_name.into())),
            future,
        )
        .await;

        match result {
            Ok(Ok(Some(content))) => {
                metric!(counter("caches.remote.fetch") += 1, "hit" => "true", "status" => "ok");
                Some(content)
            }
            Ok(Ok(None)) => {
                metric!(counter("caches.remote.fetch") += 1, "hit" => "false", "status" => "ok");
                None
            }
            Ok(Err(err)) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, "Error fetching from {} remote cache", backend_name);
                metric!(counter("caches.remote.fetch") += 1, "status" => "error");
                None
            }
            Err(_) => {
                tracing::warn!("Timed out fetching from {} remote cache", backend_name);
                metric!(counter("caches.remote.fetch") += 1, "status" => "timeout");
                None
            }
        }
    }

    /// Writes `content` to the remote cache unless it already exists there.
    ///
    /// Returns whether the entry is on the remote cache afterwards. Failures and timeouts are
    /// logged and reported as `false`.
    pub async fn store(&self, key: &ContentKey, content: Bytes) -> bool {
        let backend_name = self.backend.name();
        let future = match &self.backend {
            RemoteCacheBackend::Fs(cfg) => cfg.clone().store(key_path(key), content),
        };
        let future = CancelOnDrop::new(
            self.runtime
                .spawn(future.bind_hub(Hub::new_from_top(Hub::current()))),
        )
        .map(|result| result.unwrap_or_else(|err| Err(io::Error::other(err))));

        match tokio::time::timeout(self.timeout, future).await {
            Ok(Ok(result)) => {
                tracing::trace!(%key, "Stored content in {} remote cache: {}", backend_name, result);
                if let RemoteStoreResult::Written(bytes) = result {
                    metric!(time_raw("caches.remote.store.bytes") = bytes);
                }
                metric!(counter("caches.remote.store") += 1, "status" => result.as_ref());
                true
            }
            Ok(Err(err)) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, "Error storing content in {} remote cache", backend_name);
                metric!(counter("caches.remote.store") += 1, "status" => "error");
                false
            }
            Err(_) => {
                tracing::warn!("Timed out storing content in {} remote cache", backend_name);
                metric!(counter("caches.remote.store") += 1, "status" => "timeout");
                false
            }
        }
    }

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
        if let Some(content) = self.fetch(key).await {
            metric!(counter("caches.content.access") += 1, "outcome" => "hit");
            return Ok(CachedContent {
                outcome: CacheOutcome::Hit,
                content: Content::Bytes(content),
            });
        }
        if size.is_some_and(|size| size > self.max_item_bytes) {
            return CachedContent::fetched(fetch).await;
        }

        let stream = fetch().await?;
        let (outcome, content) = match buffer_stream(stream, self.max_item_bytes).await? {
            Buffered::Complete(content) => {
                let outcome = if self.store(key, content.clone()).await {
                    CacheOutcome::Admitted
                } else {
                    CacheOutcome::Miss
                };
                (outcome, Content::Bytes(content))
            }
            Buffered::Overflow(stream) => (CacheOutcome::Miss, Content::Stream(stream)),
        };
        metric!(counter("caches.content.access") += 1, "outcome" => outcome.as_str());
        Ok(CachedContent { outcome, content })
    }
}
