use std::time::Duration;

use mediarepo_service::caching::{CacheError, CacheOutcome};
use mediarepo_service::config::{
    FilesystemRemoteCacheConfig, RemoteCacheBackendConfig, RemoteCacheConfig,
};
use mediarepo_service::controllers::DownloadOptions;
use mediarepo_service::types::ContentKey;
use mediarepo_test as test;

use crate::{local_media, remote_media, setup_services};

#[tokio::test]
async fn test_concurrent_remote_downloads() {
    let (services, fakes) = setup_services(|_| {});
    let media = remote_media("concurrent");
    let content = test::content("concurrent", 10_000);
    fakes.remote.add(&media, content.clone(), Some("image/png"));
    fakes.remote.set_latency(Duration::from_millis(50));

    let download = || async {
        let response = services
            .downloads
            .get_media(&media, DownloadOptions::default())
            .await
            .unwrap();
        (response.record, response.content.into_bytes().await.unwrap())
    };
    let ((first, first_bytes), (second, second_bytes)) = tokio::join!(download(), download());

    assert_eq!(first, second);
    assert_eq!(first_bytes, content);
    assert_eq!(second_bytes, content);
    assert_eq!(first.content_type, "image/png");
    assert_eq!(first.size_bytes, 10_000);

    assert_eq!(fakes.remote.fetches(), 1);
    assert_eq!(fakes.datastore.uploads(), 1);
    assert_eq!(fakes.datastore.downloads(), 1);
    assert_eq!(fakes.metadata.media(&media), Some(first));

    // both requests are counted, even though the content was read only once
    let key = ContentKey::from_content(&content);
    assert_eq!(services.cache.download_count(&key), 2);
}

#[tokio::test]
async fn test_remote_media_stored_once() {
    let (services, fakes) = setup_services(|_| {});
    let media = remote_media("stored");
    let content = test::content("stored", 100);
    fakes.remote.add(&media, content.clone(), None);

    for _ in 0..3 {
        let response = services
            .downloads
            .get_media(&media, DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(response.record.content_type, "application/octet-stream");
        assert_eq!(response.record.filename.as_deref(), Some("stored.bin"));
        assert_eq!(response.content.into_bytes().await.unwrap(), content);
    }

    assert_eq!(fakes.remote.fetches(), 1);
    assert_eq!(fakes.datastore.uploads(), 1);
    assert_eq!(fakes.datastore.downloads(), 3);
}

#[tokio::test]
async fn test_admission_after_min_downloads() {
    let (services, fakes) = setup_services(|config| {
        config.cache.min_downloads = 2;
    });
    let media = local_media("popular");
    let content = test::content("popular", 4096);
    fakes.add_local_media(&media, content.clone(), "image/jpeg");

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let response = services
            .downloads
            .get_media(&media, DownloadOptions::default())
            .await
            .unwrap();
        outcomes.push(response.outcome);
        assert_eq!(response.content.into_bytes().await.unwrap(), content);
    }

    assert_eq!(
        outcomes,
        [
            CacheOutcome::Miss,
            CacheOutcome::Admitted,
            CacheOutcome::Hit
        ]
    );
    // the hit is served from memory
    assert_eq!(fakes.datastore.downloads(), 2);
}

#[tokio::test]
async fn test_disabled_cache() {
    let (services, fakes) = setup_services(|config| {
        config.cache.enabled = false;
        config.cache.min_downloads = 1;
    });
    let media = local_media("uncached");
    fakes.add_local_media(&media, test::content("uncached", 64), "image/png");

    for _ in 0..3 {
        let response = services
            .downloads
            .get_media(&media, DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(response.outcome, CacheOutcome::Miss);
    }
    assert_eq!(fakes.datastore.downloads(), 3);
}

#[tokio::test]
async fn test_failure_cache() {
    let (services, fakes) = setup_services(|config| {
        // keep the handler from serving the failure instead
        config.coalescing.result_grace_period = Duration::ZERO;
    });
    let media = remote_media("broken");
    let error = CacheError::DownloadError("502 Bad Gateway".into());
    fakes.remote.fail(&media, error.clone());

    for _ in 0..3 {
        let result = services
            .downloads
            .get_media(&media, DownloadOptions::default())
            .await;
        assert_eq!(result.unwrap_err(), error);
    }
    assert_eq!(fakes.remote.fetches(), 1);
}

#[tokio::test]
async fn test_failure_cache_disabled() {
    let (services, fakes) = setup_services(|config| {
        config.coalescing.result_grace_period = Duration::ZERO;
        config.downloads.failure_cache_duration = Duration::ZERO;
    });
    let media = remote_media("flaky");
    fakes
        .remote
        .fail(&media, CacheError::Timeout(Duration::from_secs(10)));

    for _ in 0..2 {
        let result = services
            .downloads
            .get_media(&media, DownloadOptions::default())
            .await;
        assert_eq!(result.unwrap_err(), CacheError::Timeout(Duration::from_secs(10)));
    }
    assert_eq!(fakes.remote.fetches(), 2);
}

#[tokio::test]
async fn test_remote_media_too_large() {
    let (services, fakes) = setup_services(|config| {
        config.downloads.max_size_bytes = 1000;
    });

    // rejected based on the announced length
    let announced = remote_media("announced");
    fakes
        .remote
        .add(&announced, test::content("announced", 2000), None);
    let result = services
        .downloads
        .get_media(&announced, DownloadOptions::default())
        .await;
    assert_eq!(result.unwrap_err(), CacheError::TooLarge);

    // rejected while reading
    let unannounced = remote_media("unannounced");
    fakes
        .remote
        .add_unannounced(&unannounced, test::content("unannounced", 2000));
    let result = services
        .downloads
        .get_media(&unannounced, DownloadOptions::default())
        .await;
    assert_eq!(result.unwrap_err(), CacheError::TooLarge);

    assert_eq!(fakes.datastore.uploads(), 0);
    assert!(fakes.metadata.media(&announced).is_none());
}

#[tokio::test]
async fn test_local_origin_not_fetched() {
    let (services, fakes) = setup_services(|config| {
        config.downloads.local_origins = vec!["local.example.org".into()];
    });
    let media = local_media("missing");
    fakes
        .remote
        .add(&media, test::content("missing", 10), None);

    let result = services
        .downloads
        .get_media(&media, DownloadOptions::default())
        .await;
    assert_eq!(result.unwrap_err(), CacheError::NotFound);
    assert_eq!(fakes.remote.fetches(), 0);
}

#[tokio::test]
async fn test_fetch_remote_disabled() {
    let (services, fakes) = setup_services(|_| {});
    let media = remote_media("lazy");
    let content = test::content("lazy", 512);
    fakes.remote.add(&media, content.clone(), None);

    let local_only = DownloadOptions {
        fetch_remote: false,
    };
    let result = services.downloads.get_media(&media, local_only).await;
    assert_eq!(result.unwrap_err(), CacheError::NotFound);
    assert_eq!(fakes.remote.fetches(), 0);

    services
        .downloads
        .get_media(&media, DownloadOptions::default())
        .await
        .unwrap();

    // once stored, the media is served without fetching it again
    let response = services
        .downloads
        .get_media(&media, local_only)
        .await
        .unwrap();
    assert_eq!(response.content.into_bytes().await.unwrap(), content);
    assert_eq!(fakes.remote.fetches(), 1);
}

#[tokio::test]
async fn test_remote_cache() {
    let cache_dir = test::tempdir();
    let (services, fakes) = setup_services(|config| {
        config.remote_cache = Some(RemoteCacheConfig {
            timeout: Duration::from_secs(5),
            backend: RemoteCacheBackendConfig::Filesystem(FilesystemRemoteCacheConfig {
                path: cache_dir.path().to_owned(),
            }),
        });
    });
    assert_eq!(services.cache.name(), "remote");

    let media = local_media("shared");
    let content = test::content("shared", 2048);
    fakes.add_local_media(&media, content.clone(), "video/mp4");

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let response = services
            .downloads
            .get_media(&media, DownloadOptions::default())
            .await
            .unwrap();
        outcomes.push(response.outcome);
        assert_eq!(response.content.into_bytes().await.unwrap(), content);
    }

    assert_eq!(outcomes, [CacheOutcome::Admitted, CacheOutcome::Hit]);
    assert_eq!(fakes.datastore.downloads(), 1);
}

#[tokio::test]
async fn test_reconfigure() {
    let (services, fakes) = setup_services(|_| {});
    let media = local_media("reconfigured");
    fakes.add_local_media(&media, test::content("reconfigured", 256), "image/gif");

    let response = services
        .downloads
        .get_media(&media, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(response.outcome, CacheOutcome::Miss);

    let mut config = services.config();
    config.cache.min_downloads = 1;
    config.downloads.num_workers = 2;
    services.reconfigure(config);

    assert_eq!(services.config().cache.min_downloads, 1);
    assert_eq!(services.downloads.remote_downloads().pool().workers(), 2);

    let response = services
        .downloads
        .get_media(&media, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(response.outcome, CacheOutcome::Admitted);
}
