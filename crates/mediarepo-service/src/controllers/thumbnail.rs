use std::sync::Arc;

use crate::caching::{CacheEntry, CacheError, CacheOutcome, Content, ContentCache};
use crate::coalescing::{CoalescingGroup, Fanout, Replicate};
use crate::config::{ThumbnailSize, ThumbnailsConfig};
use crate::handler::ResourceHandler;
use crate::storage::{Datastore, MetadataStore, Thumbnailer};
use crate::types::{MediaId, RequestKey, ThumbnailMethod, ThumbnailParams, ThumbnailRecord};
use crate::utils::streams::read_to_bytes;

use super::{DownloadController, DownloadOptions};

/// A thumbnail as requested by a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThumbnailRequest {
    pub width: u32,
    pub height: u32,
    pub method: ThumbnailMethod,
    pub animated: bool,
}

/// A thumbnail, ready to be served.
#[derive(Debug)]
pub struct ThumbnailResponse {
    pub record: ThumbnailRecord,
    pub outcome: CacheOutcome,
    pub content: Content,
}

impl Replicate for ThumbnailResponse {
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

/// Picks the configured size to render for the requested dimensions.
///
/// This is the smallest configured size covering both dimensions, or the largest one if none
/// does. Without configured sizes, the request is used as is.
fn snap_size(sizes: &[ThumbnailSize], width: u32, height: u32) -> (u32, u32) {
    let area = |size: &&ThumbnailSize| u64::from(size.width) * u64::from(size.height);

    let covering = sizes
        .iter()
        .filter(|size| size.width >= width && size.height >= height)
        .min_by_key(area);
    match covering.or_else(|| sizes.iter().max_by_key(area)) {
        Some(size) => (size.width, size.height),
        None => (width, height),
    }
}

#[derive(Debug)]
struct ThumbnailInner {
    config: ThumbnailsConfig,
    downloads: DownloadController,
    metadata: Arc<dyn MetadataStore>,
    datastore: Arc<dyn Datastore>,
    thumbnailer: Arc<dyn Thumbnailer>,
    cache: Arc<ContentCache>,
    requests: CoalescingGroup<ThumbnailResponse>,
    generator: ResourceHandler<ThumbnailRecord>,
}

/// Serves thumbnails, generating them on first access.
#[derive(Clone, Debug)]
pub struct ThumbnailController {
    inner: Arc<ThumbnailInner>,
}

impl ThumbnailController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ThumbnailsConfig,
        downloads: DownloadController,
        metadata: Arc<dyn MetadataStore>,
        datastore: Arc<dyn Datastore>,
        thumbnailer: Arc<dyn Thumbnailer>,
        cache: Arc<ContentCache>,
        fanout: Fanout,
        generator: ResourceHandler<ThumbnailRecord>,
    ) -> Self {
        Self {
            inner: Arc::new(ThumbnailInner {
                config,
                downloads,
                metadata,
                datastore,
                thumbnailer,
                cache,
                requests: CoalescingGroup::new("thumbnail", fanout),
                generator,
            }),
        }
    }

    /// The handler generating thumbnails.
    pub fn generator(&self) -> &ResourceHandler<ThumbnailRecord> {
        &self.inner.generator
    }

    /// The parameters a request is served with, after snapping it to a configured size.
    pub fn params(&self, request: &ThumbnailRequest) -> CacheEntry<ThumbnailParams> {
        if request.width == 0 || request.height == 0 {
            return Err(CacheError::Malformed(
                "thumbnail dimensions must be positive".into(),
            ));
        }
        let (width, height) = snap_size(&self.inner.config.sizes, request.width, request.height);
        Ok(ThumbnailParams {
            width,
            height,
            method: request.method,
            animated: request.animated,
        })
    }

    /// Serves a thumbnail of `media` and records one download of its content.
    #[tracing::instrument(skip_all, fields(%media, width = request.width, height = request.height))]
    pub async fn get_thumbnail(
        &self,
        media: &MediaId,
        request: ThumbnailRequest,
    ) -> CacheEntry<ThumbnailResponse> {
        let params = self.params(&request)?;
        let known = self.inner.metadata.get_thumbnail(media, &params).await?;
        if let Some(record) = &known {
            self.inner.cache.mark_download(&record.content_key);
        }

        let this = self.clone();
        let owned = media.clone();
        let unknown = known.is_none();
        let response = self
            .inner
            .requests
            .run_multi(RequestKey::thumbnail(media, &params), move || async move {
                this.serve(owned, params, known).await
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                metric!(counter("controllers.thumbnail") += 1, "status" => err.as_tag());
                return Err(err);
            }
        };
        if unknown {
            self.inner.cache.mark_download(&response.record.content_key);
        }

        metric!(
            counter("controllers.thumbnail") += 1,
            "status" => "ok",
            "outcome" => response.outcome.as_str(),
        );
        Ok(response)
    }

    async fn serve(
        &self,
        media: MediaId,
        params: ThumbnailParams,
        known: Option<ThumbnailRecord>,
    ) -> CacheEntry<ThumbnailResponse> {
        let record = match known {
            Some(record) => record,
            None => self.generate(media, params).await?,
        };

        let datastore = &self.inner.datastore;
        let cached = self
            .inner
            .cache
            .get_or_fetch(&record.content_key, Some(record.size_bytes), || {
                datastore.download(&record.location)
            })
            .await?;

        Ok(ThumbnailResponse {
            record,
            outcome: cached.outcome,
            content: cached.content,
        })
    }

    async fn generate(&self, media: MediaId, params: ThumbnailParams) -> CacheEntry<ThumbnailRecord> {
        let key = RequestKey::thumbnail(&media, &params);
        let this = self.clone();
        self.inner
            .generator
            .submit(key, move || async move { this.render(media, params).await })
            .await
    }

    /// Renders a new thumbnail and stores it.
    async fn render(&self, media: MediaId, params: ThumbnailParams) -> CacheEntry<ThumbnailRecord> {
        // another request may have rendered it while this one was waiting for a worker
        if let Some(record) = self.inner.metadata.get_thumbnail(&media, &params).await? {
            return Ok(record);
        }

        let max_source_bytes = self.inner.config.max_source_bytes;
        let source = self
            .inner
            .downloads
            .open_media(&media, None, DownloadOptions::default())
            .await?;
        if source.record.size_bytes > max_source_bytes {
            tracing::debug!(%media, "Source media is too large to thumbnail");
            return Err(CacheError::TooLarge);
        }
        let bytes = match source.content {
            Content::Bytes(bytes) => bytes,
            Content::Stream(stream) => read_to_bytes(stream, max_source_bytes).await?,
        };

        let thumbnail = self
            .inner
            .thumbnailer
            .generate(bytes, &source.record.content_type, &params)
            .await?;
        let stored = self.inner.datastore.upload(thumbnail.bytes).await?;

        let record = ThumbnailRecord {
            media,
            params,
            content_key: stored.content_key,
            size_bytes: stored.size,
            content_type: thumbnail.content_type,
            location: stored.location,
        };
        self.inner.metadata.insert_thumbnail(record.clone()).await?;

        tracing::debug!(content_key = %record.content_key, "Rendered thumbnail");
        Ok(record)
    }
}
