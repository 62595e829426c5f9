use std::sync::Arc;

use bytes::Bytes;

use crate::caching::{CacheEntry, CacheError, CacheOutcome, ContentCache};
use crate::coalescing::{CoalescingGroup, Fanout};
use crate::config::UrlPreviewsConfig;
use crate::handler::ResourceHandler;
use crate::storage::UrlPreviewer;
use crate::types::{PreviewRequest, RequestKey, UrlPreview};
use crate::utils::streams::bytes_stream;

/// A URL preview, ready to be served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewResponse {
    pub preview: UrlPreview,
    pub outcome: CacheOutcome,
}

#[derive(Debug)]
struct PreviewInner {
    config: UrlPreviewsConfig,
    previewer: Arc<dyn UrlPreviewer>,
    cache: Arc<ContentCache>,
    requests: CoalescingGroup<PreviewResponse>,
    generator: ResourceHandler<UrlPreview>,
}

/// Serves previews of web pages.
///
/// Previews are shared by all requests for the same page and language within the same hour.
/// The content cache holds them in their serialized form.
#[derive(Clone, Debug)]
pub struct PreviewController {
    inner: Arc<PreviewInner>,
}

impl PreviewController {
    pub fn new(
        config: UrlPreviewsConfig,
        previewer: Arc<dyn UrlPreviewer>,
        cache: Arc<ContentCache>,
        fanout: Fanout,
        generator: ResourceHandler<UrlPreview>,
    ) -> Self {
        Self {
            inner: Arc::new(PreviewInner {
                config,
                previewer,
                cache,
                requests: CoalescingGroup::new("preview", fanout),
                generator,
            }),
        }
    }

    /// The handler generating previews.
    pub fn generator(&self) -> &ResourceHandler<UrlPreview> {
        &self.inner.generator
    }

    #[tracing::instrument(skip_all, fields(url = %request.url))]
    pub async fn get_preview(&self, request: PreviewRequest) -> CacheEntry<PreviewResponse> {
        if !self.inner.config.enabled {
            return Err(CacheError::NotFound);
        }
        self.inner.cache.mark_download(&request.content_key());

        let key = RequestKey::preview(&request);
        let this = self.clone();
        let response = self
            .inner
            .requests
            .run(key, move || async move { this.serve(request).await })
            .await;

        let status = match &response {
            Ok(_) => "ok",
            Err(err) => err.as_tag(),
        };
        metric!(counter("controllers.preview") += 1, "status" => status);
        response
    }

    async fn serve(&self, request: PreviewRequest) -> CacheEntry<PreviewResponse> {
        let content_key = request.content_key();
        let cached = self
            .inner
            .cache
            .get_or_fetch(&content_key, None, || async {
                let preview = self.generate(&request).await?;
                let serialized = serde_json::to_vec(&preview)?;
                Ok::<_, CacheError>(bytes_stream(Bytes::from(serialized)))
            })
            .await?;

        let serialized = cached.content.into_bytes().await?;
        let preview = serde_json::from_slice(&serialized).map_err(|err| {
            tracing::warn!(error = %err, %content_key, "Cached preview is unreadable");
            CacheError::Malformed(err.to_string())
        })?;

        Ok(PreviewResponse {
            preview,
            outcome: cached.outcome,
        })
    }

    async fn generate(&self, request: &PreviewRequest) -> CacheEntry<UrlPreview> {
        let this = self.clone();
        let owned = request.clone();
        self.inner
            .generator
            .submit(RequestKey::preview(request), move || async move {
                let max_page_bytes = this.inner.config.max_page_size_bytes;
                this.inner
                    .previewer
                    .preview(&owned.url, &owned.language, max_page_bytes)
                    .await
            })
            .await
    }
}
