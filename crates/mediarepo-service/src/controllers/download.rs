use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::caching::{CacheEntry, CacheError, CacheOutcome, Content, ContentCache};
use crate::coalescing::{CoalescingGroup, Fanout, Replicate};
use crate::config::DownloadsConfig;
use crate::handler::ResourceHandler;
use crate::storage::{Datastore, MetadataStore, RemoteSource};
use crate::types::{MediaId, MediaRecord, RequestKey};
use crate::utils::streams::read_to_bytes;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Options for [`DownloadController::get_media`].
#[derive(Clone, Copy, Debug)]
pub struct DownloadOptions {
    /// Whether media unknown to this repository may be downloaded from their origin.
    pub fetch_remote: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self { fetch_remote: true }
    }
}

/// A piece of media, ready to be served.
#[derive(Debug)]
pub struct MediaResponse {
    pub record: MediaRecord,
    pub outcome: CacheOutcome,
    pub content: Content,
}

impl Replicate for MediaResponse {
    fn replicate(self, copies: usize, fanout: &Fanout) -> Vec<Self> {
        let Self {
            record,
            outcome,
            content,
        } = self;
        content
            .replicate(copies, fanout)
            .into_iter()
            .map(|content| Self {
                record: record.clone(),
                outcome,
                content,
            })
            .collect()
    }
}

#[derive(Debug)]
struct DownloadInner {
    config: DownloadsConfig,
    metadata: Arc<dyn MetadataStore>,
    datastore: Arc<dyn Datastore>,
    remote: Arc<dyn RemoteSource>,
    cache: Arc<ContentCache>,
    requests: CoalescingGroup<MediaResponse>,
    remote_downloads: ResourceHandler<MediaRecord>,
    failures: Cache<MediaId, CacheError>,
}

/// Serves media, downloading them from their origin if necessary.
#[derive(Clone, Debug)]
pub struct DownloadController {
    inner: Arc<DownloadInner>,
}

impl DownloadController {
    pub fn new(
        config: DownloadsConfig,
        metadata: Arc<dyn MetadataStore>,
        datastore: Arc<dyn Datastore>,
        remote: Arc<dyn RemoteSource>,
        cache: Arc<ContentCache>,
        fanout: Fanout,
        remote_downloads: ResourceHandler<MediaRecord>,
    ) -> Self {
        let failures = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(config.failure_cache_duration.max(Duration::from_millis(1)))
            .build();

        Self {
            inner: Arc::new(DownloadInner {
                config,
                metadata,
                datastore,
                remote,
                cache,
                requests: CoalescingGroup::new("download", fanout),
                remote_downloads,
                failures,
            }),
        }
    }

    /// The handler running remote downloads.
    pub fn remote_downloads(&self) -> &ResourceHandler<MediaRecord> {
        &self.inner.remote_downloads
    }

    /// Serves `media` and records one download of its content.
    #[tracing::instrument(skip_all, fields(%media))]
    pub async fn get_media(
        &self,
        media: &MediaId,
        options: DownloadOptions,
    ) -> CacheEntry<MediaResponse> {
        let known = self.inner.metadata.get_media(media).await?;
        if let Some(record) = &known {
            self.inner.cache.mark_download(&record.content_key);
        }

        let response = self.open_media(media, known.clone(), options).await;
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                metric!(counter("controllers.download") += 1, "status" => err.as_tag());
                return Err(err);
            }
        };
        if known.is_none() {
            self.inner.cache.mark_download(&response.record.content_key);
        }

        metric!(
            counter("controllers.download") += 1,
            "status" => "ok",
            "outcome" => response.outcome.as_str(),
        );
        Ok(response)
    }

    /// Serves `media` without recording a download.
    ///
    /// `known` is the record of `media` if it was already looked up.
    pub(crate) async fn open_media(
        &self,
        media: &MediaId,
        known: Option<MediaRecord>,
        options: DownloadOptions,
    ) -> CacheEntry<MediaResponse> {
        if known.is_none() && !options.fetch_remote {
            return Err(CacheError::NotFound);
        }

        let this = self.clone();
        let owned = media.clone();
        self.inner
            .requests
            .run_multi(RequestKey::download(media), move || async move {
                this.serve(owned, known).await
            })
            .await
    }

    async fn serve(&self, media: MediaId, known: Option<MediaRecord>) -> CacheEntry<MediaResponse> {
        let record = match known {
            Some(record) => record,
            None => match self.inner.metadata.get_media(&media).await? {
                Some(record) => record,
                None => self.fetch_remote(&media).await?,
            },
        };

        let datastore = &self.inner.datastore;
        let cached = self
            .inner
            .cache
            .get_or_fetch(&record.content_key, Some(record.size_bytes), || {
                datastore.download(&record.location)
            })
            .await?;

        Ok(MediaResponse {
            record,
            outcome: cached.outcome,
            content: cached.content,
        })
    }

    /// Downloads `media` from its origin into the datastore.
    async fn fetch_remote(&self, media: &MediaId) -> CacheEntry<MediaRecord> {
        if self.inner.config.local_origins.contains(&media.origin) {
            return Err(CacheError::NotFound);
        }
        if let Some(err) = self.inner.failures.get(media) {
            tracing::debug!(%media, "Remote media failed recently");
            metric!(counter("controllers.download.failure_cache") += 1, "status" => err.as_tag());
            return Err(err);
        }

        let this = self.clone();
        let owned = media.clone();
        self.inner
            .remote_downloads
            .submit(RequestKey::remote_download(media), move || async move {
                let result = this.download_remote(&owned).await;
                if let Err(err) = &result {
                    if err.is_memorable() && !this.inner.config.failure_cache_duration.is_zero() {
                        this.inner.failures.insert(owned, err.clone());
                    }
                }
                result
            })
            .await
    }

    async fn download_remote(&self, media: &MediaId) -> CacheEntry<MediaRecord> {
        let max_size = self.inner.config.max_size_bytes;
        tracing::debug!(%media, "Downloading remote media");

        let remote = self.inner.remote.fetch(media).await?;
        if remote.content_length.is_some_and(|length| length > max_size) {
            tracing::debug!(%media, "Remote media exceeds the size limit");
            return Err(CacheError::TooLarge);
        }
        let content = read_to_bytes(remote.stream, max_size).await?;

        let stored = self.inner.datastore.upload(content).await?;
        let record = MediaRecord {
            id: media.clone(),
            content_key: stored.content_key,
            size_bytes: stored.size,
            content_type: remote
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            filename: remote.filename,
            location: stored.location,
        };
        self.inner.metadata.insert_media(record.clone()).await?;

        tracing::debug!(%media, content_key = %record.content_key, "Stored remote media");
        Ok(record)
    }
}
