//! Identifiers and records shared by the caches, the coalescing layers and the controllers.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// A stream of bytes read from a datastore, a remote server or a cache.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Identifies a cacheable artifact by what it contains.
///
/// For media and thumbnails this is the hex encoded SHA-256 of the bytes, for URL previews a
/// composite of the URL and the request parameters. Distinct requests may share a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentKey(Arc<str>);

impl ContentKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Fingerprints `content` with SHA-256.
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self::new(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Identifies a logical operation, used as the unit of request coalescing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Serving a piece of media to a client.
    pub fn download(media: &MediaId) -> Self {
        Self::new(format!("download:{media}"))
    }

    /// Fetching a piece of media from its origin over federation.
    pub fn remote_download(media: &MediaId) -> Self {
        Self::new(format!("remote:{media}"))
    }

    pub fn thumbnail(media: &MediaId, params: &ThumbnailParams) -> Self {
        Self::new(format!(
            "thumbnail:{media}?w={}&h={}&m={}&a={}",
            params.width, params.height, params.method, params.animated
        ))
    }

    pub fn preview(request: &PreviewRequest) -> Self {
        Self::new(format!("preview:{}", request.composite()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// A piece of media as addressed by clients: the server it originated on and its id there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MediaId {
    pub origin: String,
    pub media_id: String,
}

impl MediaId {
    pub fn new(origin: impl Into<String>, media_id: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            media_id: media_id.into(),
        }
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.media_id)
    }
}

/// Where a blob lives in the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatastoreLocation {
    pub datastore_id: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    pub content_key: ContentKey,
    pub size_bytes: u64,
    pub content_type: String,
    pub filename: Option<String>,
    pub location: DatastoreLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailMethod {
    Crop,
    Scale,
}

impl fmt::Display for ThumbnailMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crop => f.write_str("crop"),
            Self::Scale => f.write_str("scale"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThumbnailParams {
    pub width: u32,
    pub height: u32,
    pub method: ThumbnailMethod,
    pub animated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    pub media: MediaId,
    pub params: ThumbnailParams,
    pub content_key: ContentKey,
    pub size_bytes: u64,
    pub content_type: String,
    pub location: DatastoreLocation,
}

/// A request to preview `url`, as seen at `timestamp_ms` by a client speaking `language`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewRequest {
    pub url: Url,
    pub timestamp_ms: i64,
    pub language: String,
}

impl PreviewRequest {
    const BUCKET_MS: i64 = 60 * 60 * 1000;

    /// The request timestamp rounded down to the hour, so previews are shared within that hour.
    pub fn bucket(&self) -> i64 {
        self.timestamp_ms - self.timestamp_ms.rem_euclid(Self::BUCKET_MS)
    }

    /// The key the serialized preview is cached under.
    pub fn content_key(&self) -> ContentKey {
        ContentKey::new(format!("preview:{}", self.composite()))
    }

    fn composite(&self) -> String {
        format!("{}?ts={}&lang={}", self.url, self.bucket(), self.language)
    }
}

/// The OpenGraph-like summary of a web page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPreview {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}
