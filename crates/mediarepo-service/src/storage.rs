//! Interfaces to the collaborators the repository is built on.
//!
//! The engine does not know how bytes are persisted, how media are fetched from other servers
//! or how thumbnails and previews are produced. It talks to those through the traits in this
//! module, which the hosting application implements.

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;

use crate::caching::CacheEntry;
use crate::types::{
    ByteStream, ContentKey, DatastoreLocation, MediaId, MediaRecord, ThumbnailParams,
    ThumbnailRecord, UrlPreview,
};

/// An object that was written to a [`Datastore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub location: DatastoreLocation,
    /// The fingerprint of the uploaded bytes.
    pub content_key: ContentKey,
    pub size: u64,
}

/// The backing store holding the bytes of all media and thumbnails.
pub trait Datastore: fmt::Debug + Send + Sync {
    /// Opens the object at `location` for reading.
    fn download<'a>(&'a self, location: &'a DatastoreLocation) -> BoxFuture<'a, CacheEntry<ByteStream>>;

    /// Persists `content`, deduplicating identical content.
    fn upload(&self, content: Bytes) -> BoxFuture<'_, CacheEntry<StoredObject>>;
}

/// The persisted records describing media and thumbnails.
pub trait MetadataStore: fmt::Debug + Send + Sync {
    fn get_media<'a>(&'a self, media: &'a MediaId) -> BoxFuture<'a, CacheEntry<Option<MediaRecord>>>;

    fn insert_media(&self, record: MediaRecord) -> BoxFuture<'_, CacheEntry<()>>;

    fn get_thumbnail<'a>(
        &'a self,
        media: &'a MediaId,
        params: &'a ThumbnailParams,
    ) -> BoxFuture<'a, CacheEntry<Option<ThumbnailRecord>>>;

    fn insert_thumbnail(&self, record: ThumbnailRecord) -> BoxFuture<'_, CacheEntry<()>>;
}

/// Media as served by the server it originates from.
pub struct RemoteMedia {
    pub content_type: Option<String>,
    pub filename: Option<String>,
    /// The size announced by the remote server, if any.
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Downloads media from other servers of the federation.
pub trait RemoteSource: fmt::Debug + Send + Sync {
    fn fetch<'a>(&'a self, media: &'a MediaId) -> BoxFuture<'a, CacheEntry<RemoteMedia>>;
}

/// A thumbnail produced by a [`Thumbnailer`].
#[derive(Clone, Debug)]
pub struct GeneratedThumbnail {
    pub content_type: String,
    pub bytes: Bytes,
}

/// Produces thumbnails from source images.
pub trait Thumbnailer: fmt::Debug + Send + Sync {
    fn generate<'a>(
        &'a self,
        source: Bytes,
        content_type: &'a str,
        params: &'a ThumbnailParams,
    ) -> BoxFuture<'a, CacheEntry<GeneratedThumbnail>>;
}

/// Fetches and summarizes web pages.
pub trait UrlPreviewer: fmt::Debug + Send + Sync {
    /// Summarizes the page at `url`, refusing pages larger than `max_page_bytes`.
    fn preview<'a>(
        &'a self,
        url: &'a Url,
        language: &'a str,
        max_page_bytes: u64,
    ) -> BoxFuture<'a, CacheEntry<UrlPreview>>;
}
