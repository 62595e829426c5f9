use std::time::Duration;

use mediarepo_service::caching::{CacheError, CacheOutcome};
use mediarepo_service::controllers::ThumbnailRequest;
use mediarepo_service::types::{ContentKey, ThumbnailMethod};
use mediarepo_test as test;

use crate::{local_media, remote_media, setup_services};

fn crop(width: u32, height: u32) -> ThumbnailRequest {
    ThumbnailRequest {
        width,
        height,
        method: ThumbnailMethod::Crop,
        animated: false,
    }
}

#[tokio::test]
async fn test_thumbnail_generated_once() {
    let (services, fakes) = setup_services(|_| {});
    let media = local_media("picture");
    fakes.add_local_media(&media, test::content("picture", 5000), "image/png");
    fakes.thumbnailer.set_latency(Duration::from_millis(50));

    let thumbnail = || async {
        let response = services
            .thumbnails
            .get_thumbnail(&media, crop(90, 90))
            .await
            .unwrap();
        (response.record, response.content.into_bytes().await.unwrap())
    };
    let ((first, first_bytes), (second, second_bytes)) = tokio::join!(thumbnail(), thumbnail());

    assert_eq!(first, second);
    assert_eq!(first_bytes, second_bytes);
    assert_eq!((first.params.width, first.params.height), (96, 96));
    assert_eq!(first.content_type, "image/png");
    assert_eq!(fakes.thumbnailer.calls(), 1);
    assert_eq!(fakes.metadata.thumbnail_count(), 1);

    // a later request snapping to the same size reuses the stored thumbnail
    let response = services
        .thumbnails
        .get_thumbnail(&media, crop(96, 80))
        .await
        .unwrap();
    assert_eq!(response.record, first);
    assert_eq!(response.content.into_bytes().await.unwrap(), first_bytes);
    assert_eq!(fakes.thumbnailer.calls(), 1);

    let key = ContentKey::from_content(&first_bytes);
    assert_eq!(services.cache.download_count(&key), 3);
}

#[tokio::test]
async fn test_thumbnail_variants() {
    let (services, fakes) = setup_services(|_| {});
    let media = local_media("variants");
    fakes.add_local_media(&media, test::content("variants", 1000), "image/jpeg");

    let scaled = ThumbnailRequest {
        method: ThumbnailMethod::Scale,
        ..crop(32, 32)
    };
    for request in [crop(32, 32), scaled, crop(640, 480)] {
        services
            .thumbnails
            .get_thumbnail(&media, request)
            .await
            .unwrap();
    }

    assert_eq!(fakes.thumbnailer.calls(), 3);
    assert_eq!(fakes.metadata.thumbnail_count(), 3);
}

#[tokio::test]
async fn test_thumbnail_of_remote_media() {
    let (services, fakes) = setup_services(|_| {});
    let media = remote_media("avatar");
    let source = test::content("avatar", 3000);
    fakes.remote.add(&media, source.clone(), Some("image/webp"));

    let response = services
        .thumbnails
        .get_thumbnail(&media, crop(320, 240))
        .await
        .unwrap();
    assert_eq!(response.record.media, media);
    assert_eq!(fakes.remote.fetches(), 1);
    assert!(fakes.metadata.media(&media).is_some());

    // reading the source is not a download of the source
    let source_key = ContentKey::from_content(&source);
    assert_eq!(services.cache.download_count(&source_key), 0);
}

#[tokio::test]
async fn test_thumbnail_cached_after_min_downloads() {
    let (services, fakes) = setup_services(|config| {
        config.cache.min_downloads = 2;
    });
    let media = local_media("hot");
    fakes.add_local_media(&media, test::content("hot", 1000), "image/png");

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let response = services
            .thumbnails
            .get_thumbnail(&media, crop(32, 32))
            .await
            .unwrap();
        outcomes.push(response.outcome);
    }
    assert_eq!(
        outcomes,
        [
            CacheOutcome::Miss,
            CacheOutcome::Admitted,
            CacheOutcome::Hit
        ]
    );
}

#[tokio::test]
async fn test_thumbnail_unsupported_media() {
    let (services, fakes) = setup_services(|_| {});
    let media = local_media("document");
    fakes.add_local_media(&media, test::content("document", 100), "text/plain");

    let result = services
        .thumbnails
        .get_thumbnail(&media, crop(32, 32))
        .await;
    assert!(matches!(result, Err(CacheError::Malformed(_))));
    assert_eq!(fakes.metadata.thumbnail_count(), 0);
}

#[tokio::test]
async fn test_thumbnail_invalid_dimensions() {
    let (services, fakes) = setup_services(|_| {});
    let media = local_media("flat");
    fakes.add_local_media(&media, test::content("flat", 100), "image/png");

    let result = services.thumbnails.get_thumbnail(&media, crop(0, 32)).await;
    assert!(matches!(result, Err(CacheError::Malformed(_))));
    assert_eq!(fakes.thumbnailer.calls(), 0);
}

#[tokio::test]
async fn test_thumbnail_source_too_large() {
    let (services, fakes) = setup_services(|config| {
        config.thumbnails.max_source_bytes = 100;
    });
    let media = local_media("huge");
    fakes.add_local_media(&media, test::content("huge", 1000), "image/png");

    let result = services
        .thumbnails
        .get_thumbnail(&media, crop(32, 32))
        .await;
    assert_eq!(result.unwrap_err(), CacheError::TooLarge);
    assert_eq!(fakes.thumbnailer.calls(), 0);
}
