//! Helpers for testing the repository services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test.
//!
//!  - [`Fakes`] bundles in-memory implementations of every collaborator. They count how often
//!    they are invoked, which is how tests observe coalescing and caching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

use mediarepo_service::caching::{CacheEntry, CacheError};
use mediarepo_service::services::Collaborators;
use mediarepo_service::storage::{
    Datastore, GeneratedThumbnail, MetadataStore, RemoteMedia, RemoteSource, StoredObject,
    Thumbnailer, UrlPreviewer,
};
use mediarepo_service::types::{
    ByteStream, ContentKey, DatastoreLocation, MediaId, MediaRecord, ThumbnailParams,
    ThumbnailRecord, UrlPreview,
};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `mediarepo` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("mediarepo_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Deterministic content of `size` bytes, different for every `seed`.
pub fn content(seed: &str, size: usize) -> Bytes {
    seed.bytes().cycle().take(size).collect::<Vec<_>>().into()
}

/// Yields `content` in chunks of `chunk_size` bytes.
fn chunked(content: Bytes, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<_> = (0..content.len())
        .step_by(chunk_size)
        .map(|start| Ok(content.slice(start..(start + chunk_size).min(content.len()))))
        .collect();
    stream::iter(chunks).boxed()
}

async fn delay(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// A [`Datastore`] keeping everything in memory, deduplicated by content.
#[derive(Debug)]
pub struct MemoryDatastore {
    objects: Mutex<HashMap<String, Bytes>>,
    chunk_size: usize,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self {
            objects: Default::default(),
            chunk_size: 1024,
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }
}

impl MemoryDatastore {
    pub const ID: &'static str = "memory";

    /// The number of streams opened so far.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// The number of uploads so far.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `content` directly, without counting an upload.
    pub fn insert(&self, content: Bytes) -> StoredObject {
        let content_key = ContentKey::from_content(&content);
        let stored = StoredObject {
            location: DatastoreLocation {
                datastore_id: Self::ID.to_owned(),
                location: content_key.to_string(),
            },
            content_key,
            size: content.len() as u64,
        };
        self.objects
            .lock()
            .unwrap()
            .insert(stored.location.location.clone(), content);
        stored
    }
}

impl Datastore for MemoryDatastore {
    fn download<'a>(
        &'a self,
        location: &'a DatastoreLocation,
    ) -> BoxFuture<'a, CacheEntry<ByteStream>> {
        async move {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let content = self
                .objects
                .lock()
                .unwrap()
                .get(&location.location)
                .cloned()
                .ok_or(CacheError::NotFound)?;
            Ok(chunked(content, self.chunk_size))
        }
        .boxed()
    }

    fn upload(&self, content: Bytes) -> BoxFuture<'_, CacheEntry<StoredObject>> {
        async move {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(self.insert(content))
        }
        .boxed()
    }
}

/// A [`MetadataStore`] keeping records in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    media: Mutex<HashMap<MediaId, MediaRecord>>,
    thumbnails: Mutex<HashMap<(MediaId, ThumbnailParams), ThumbnailRecord>>,
}

impl MemoryMetadataStore {
    pub fn media(&self, media: &MediaId) -> Option<MediaRecord> {
        self.media.lock().unwrap().get(media).cloned()
    }

    pub fn thumbnail_count(&self) -> usize {
        self.thumbnails.lock().unwrap().len()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get_media<'a>(
        &'a self,
        media: &'a MediaId,
    ) -> BoxFuture<'a, CacheEntry<Option<MediaRecord>>> {
        async move { Ok(self.media(media)) }.boxed()
    }

    fn insert_media(&self, record: MediaRecord) -> BoxFuture<'_, CacheEntry<()>> {
        async move {
            self.media.lock().unwrap().insert(record.id.clone(), record);
            Ok(())
        }
        .boxed()
    }

    fn get_thumbnail<'a>(
        &'a self,
        media: &'a MediaId,
        params: &'a ThumbnailParams,
    ) -> BoxFuture<'a, CacheEntry<Option<ThumbnailRecord>>> {
        async move {
            let key = (media.clone(), *params);
            Ok(self.thumbnails.lock().unwrap().get(&key).cloned())
        }
        .boxed()
    }

    fn insert_thumbnail(&self, record: ThumbnailRecord) -> BoxFuture<'_, CacheEntry<()>> {
        async move {
            let key = (record.media.clone(), record.params);
            self.thumbnails.lock().unwrap().insert(key, record);
            Ok(())
        }
        .boxed()
    }
}

#[derive(Clone, Debug)]
struct RemoteFile {
    content: Bytes,
    content_type: Option<String>,
    announce_length: bool,
}

/// A [`RemoteSource`] serving media registered with [`add`](Self::add).
#[derive(Debug)]
pub struct FakeRemoteSource {
    files: Mutex<HashMap<MediaId, RemoteFile>>,
    failures: Mutex<HashMap<MediaId, CacheError>>,
    latency: Mutex<Duration>,
    fetches: AtomicUsize,
    chunk_size: usize,
}

impl Default for FakeRemoteSource {
    fn default() -> Self {
        Self {
            files: Default::default(),
            failures: Default::default(),
            latency: Mutex::new(Duration::ZERO),
            fetches: AtomicUsize::new(0),
            chunk_size: 1024,
        }
    }
}

impl FakeRemoteSource {
    /// Serves `content` for `media`, announcing its length.
    pub fn add(&self, media: &MediaId, content: Bytes, content_type: Option<&str>) {
        self.add_file(media, content, content_type, true);
    }

    /// Serves `content` for `media` without announcing its length.
    pub fn add_unannounced(&self, media: &MediaId, content: Bytes) {
        self.add_file(media, content, None, false);
    }

    fn add_file(
        &self,
        media: &MediaId,
        content: Bytes,
        content_type: Option<&str>,
        announce_length: bool,
    ) {
        let file = RemoteFile {
            content,
            content_type: content_type.map(str::to_owned),
            announce_length,
        };
        self.files.lock().unwrap().insert(media.clone(), file);
    }

    /// Fails every fetch of `media` with `error`.
    pub fn fail(&self, media: &MediaId, error: CacheError) {
        self.failures.lock().unwrap().insert(media.clone(), error);
    }

    /// Delays every fetch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// The number of fetches so far, including failed ones.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RemoteSource for FakeRemoteSource {
    fn fetch<'a>(&'a self, media: &'a MediaId) -> BoxFuture<'a, CacheEntry<RemoteMedia>> {
        async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock().unwrap();
            delay(latency).await;

            if let Some(error) = self.failures.lock().unwrap().get(media) {
                return Err(error.clone());
            }
            let file = self
                .files
                .lock()
                .unwrap()
                .get(media)
                .cloned()
                .ok_or(CacheError::NotFound)?;

            Ok(RemoteMedia {
                content_type: file.content_type,
                filename: Some(format!("{}.bin", media.media_id)),
                content_length: file.announce_length.then_some(file.content.len() as u64),
                stream: chunked(file.content, self.chunk_size),
            })
        }
        .boxed()
    }
}

/// A [`Thumbnailer`] producing a small deterministic image description.
#[derive(Debug, Default)]
pub struct FakeThumbnailer {
    calls: AtomicUsize,
    latency: Mutex<Duration>,
}

impl FakeThumbnailer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }
}

impl Thumbnailer for FakeThumbnailer {
    fn generate<'a>(
        &'a self,
        source: Bytes,
        content_type: &'a str,
        params: &'a ThumbnailParams,
    ) -> BoxFuture<'a, CacheEntry<GeneratedThumbnail>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock().unwrap();
            delay(latency).await;

            if !content_type.starts_with("image/") {
                return Err(CacheError::Malformed(format!(
                    "cannot thumbnail {content_type}"
                )));
            }
            let description = format!(
                "thumbnail {}x{} {} animated={} of {}",
                params.width,
                params.height,
                params.method,
                params.animated,
                ContentKey::from_content(&source),
            );
            Ok(GeneratedThumbnail {
                content_type: "image/png".to_owned(),
                bytes: Bytes::from(description),
            })
        }
        .boxed()
    }
}

/// A [`UrlPreviewer`] describing every page by its url.
#[derive(Debug, Default)]
pub struct FakePreviewer {
    calls: AtomicUsize,
    latency: Mutex<Duration>,
}

impl FakePreviewer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }
}

impl UrlPreviewer for FakePreviewer {
    fn preview<'a>(
        &'a self,
        url: &'a Url,
        language: &'a str,
        _max_page_bytes: u64,
    ) -> BoxFuture<'a, CacheEntry<UrlPreview>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock().unwrap();
            delay(latency).await;

            if url.host_str() == Some("unreachable.invalid") {
                return Err(CacheError::DownloadError("connection refused".into()));
            }
            Ok(UrlPreview {
                url: url.to_string(),
                site_name: url.host_str().map(str::to_owned),
                title: Some(format!("Title of {} ({language})", url.path())),
                description: None,
                image_url: None,
            })
        }
        .boxed()
    }
}

/// In-memory fakes of all collaborators.
#[derive(Clone, Debug, Default)]
pub struct Fakes {
    pub metadata: Arc<MemoryMetadataStore>,
    pub datastore: Arc<MemoryDatastore>,
    pub remote: Arc<FakeRemoteSource>,
    pub thumbnailer: Arc<FakeThumbnailer>,
    pub previewer: Arc<FakePreviewer>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            metadata: self.metadata.clone(),
            datastore: self.datastore.clone(),
            remote: self.remote.clone(),
            thumbnailer: self.thumbnailer.clone(),
            previewer: self.previewer.clone(),
        }
    }

    /// Stores `content` as local media and returns its record.
    pub fn add_local_media(&self, media: &MediaId, content: Bytes, content_type: &str) -> MediaRecord {
        let stored = self.datastore.insert(content);
        let record = MediaRecord {
            id: media.clone(),
            content_key: stored.content_key,
            size_bytes: stored.size,
            content_type: content_type.to_owned(),
            filename: None,
            location: stored.location,
        };
        self.metadata
            .media
            .lock()
            .unwrap()
            .insert(media.clone(), record.clone());
        record
    }
}
