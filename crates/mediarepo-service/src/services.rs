//! Provides the shared services of the repository and a way to initialize them.
//!
//! [`SharedServices`] wires the content cache, the worker pools and the controllers together
//! according to the provided [`Config`]. It is constructed once at startup and handed to
//! whatever serves requests. Nothing in this crate relies on global state, so tests construct
//! fresh services whenever they need them.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use crate::caching::ContentCache;
use crate::coalescing::Fanout;
use crate::config::{Config, RemoteCacheBackendConfig};
use crate::controllers::{DownloadController, PreviewController, ThumbnailController};
use crate::handler::ResourceHandler;
use crate::pool::WorkerPool;
use crate::storage::{Datastore, MetadataStore, RemoteSource, Thumbnailer, UrlPreviewer};

/// The external collaborators the services are built on.
#[derive(Clone, Debug)]
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataStore>,
    pub datastore: Arc<dyn Datastore>,
    pub remote: Arc<dyn RemoteSource>,
    pub thumbnailer: Arc<dyn Thumbnailer>,
    pub previewer: Arc<dyn UrlPreviewer>,
}

#[derive(Debug)]
pub struct SharedServices {
    config: RwLock<Config>,
    pub cache: Arc<ContentCache>,
    pub downloads: DownloadController,
    pub thumbnails: ThumbnailController,
    pub previews: PreviewController,
}

impl SharedServices {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        if let Some(remote) = &config.remote_cache {
            let RemoteCacheBackendConfig::Filesystem(fs) = &remote.backend;
            std::fs::create_dir_all(&fs.path)
                .with_context(|| format!("failed to create remote cache at {}", fs.path.display()))?;
        }
        if config.cache.max_file_size_bytes > config.cache.max_size_bytes {
            tracing::warn!("Maximum cached file size exceeds the cache size and is capped by it");
        }

        let cache = Arc::new(ContentCache::from_config(&config, runtime.clone()));
        let fanout = Fanout::new(&config.coalescing, runtime.clone());
        let grace_period = config.coalescing.result_grace_period;

        let download_pool = WorkerPool::new("downloads", config.downloads.num_workers, runtime.clone());
        let downloads = DownloadController::new(
            config.downloads.clone(),
            Arc::clone(&collaborators.metadata),
            Arc::clone(&collaborators.datastore),
            Arc::clone(&collaborators.remote),
            Arc::clone(&cache),
            fanout.clone(),
            ResourceHandler::new(download_pool, grace_period, runtime.clone()),
        );

        let thumbnail_pool =
            WorkerPool::new("thumbnails", config.thumbnails.num_workers, runtime.clone());
        let thumbnails = ThumbnailController::new(
            config.thumbnails.clone(),
            downloads.clone(),
            Arc::clone(&collaborators.metadata),
            Arc::clone(&collaborators.datastore),
            Arc::clone(&collaborators.thumbnailer),
            Arc::clone(&cache),
            fanout.clone(),
            ResourceHandler::new(thumbnail_pool, grace_period, runtime.clone()),
        );

        let preview_pool =
            WorkerPool::new("previews", config.url_previews.num_workers, runtime.clone());
        let previews = PreviewController::new(
            config.url_previews.clone(),
            Arc::clone(&collaborators.previewer),
            Arc::clone(&cache),
            fanout,
            ResourceHandler::new(preview_pool, grace_period, runtime),
        );

        tracing::info!(cache = cache.name(), "Initialized shared services");
        Ok(Self {
            config: RwLock::new(config),
            cache,
            downloads,
            thumbnails,
            previews,
        })
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    /// Applies `config` to the running services.
    ///
    /// Worker pools are resized and the content cache picks up its new settings. Work in flight
    /// is not interrupted. Settings that shape the services themselves, like the cache backend,
    /// require a restart.
    pub fn reconfigure(&self, config: Config) {
        tracing::info!("Reconfiguring shared services");
        self.downloads
            .remote_downloads()
            .pool()
            .resize(config.downloads.num_workers);
        self.thumbnails
            .generator()
            .pool()
            .resize(config.thumbnails.num_workers);
        self.previews
            .generator()
            .pool()
            .resize(config.url_previews.num_workers);
        self.cache.reconfigure(&config);

        *self.config.write().unwrap() = config;
    }
}
