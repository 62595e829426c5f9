use std::time::Duration;

use mediarepo_service::caching::{CacheError, CacheOutcome};
use mediarepo_service::types::PreviewRequest;
use url::Url;

use crate::setup_services;

const HOUR_MS: i64 = 60 * 60 * 1000;

fn request(url: &str, timestamp_ms: i64) -> PreviewRequest {
    PreviewRequest {
        url: Url::parse(url).unwrap(),
        timestamp_ms,
        language: "en".into(),
    }
}

#[tokio::test]
async fn test_preview_coalesced() {
    let (services, fakes) = setup_services(|_| {});
    fakes.previewer.set_latency(Duration::from_millis(50));

    let (first, second) = tokio::join!(
        services.previews.get_preview(request("https://example.org/page", 1_000)),
        services.previews.get_preview(request("https://example.org/page", 2_000)),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first, second);
    assert_eq!(first.preview.title.as_deref(), Some("Title of /page (en)"));
    assert_eq!(first.preview.site_name.as_deref(), Some("example.org"));
    assert_eq!(fakes.previewer.calls(), 1);
}

#[tokio::test]
async fn test_preview_shared_within_hour() {
    let (services, fakes) = setup_services(|_| {});

    let timestamps = [10 * HOUR_MS + 1, 11 * HOUR_MS - 1, 11 * HOUR_MS];
    for timestamp in timestamps {
        services
            .previews
            .get_preview(request("https://example.org/hourly", timestamp))
            .await
            .unwrap();
    }
    assert_eq!(fakes.previewer.calls(), 2);

    let mut german = request("https://example.org/hourly", 10 * HOUR_MS);
    german.language = "de".into();
    let response = services.previews.get_preview(german).await.unwrap();
    assert_eq!(
        response.preview.title.as_deref(),
        Some("Title of /hourly (de)")
    );
    assert_eq!(fakes.previewer.calls(), 3);
}

#[tokio::test]
async fn test_preview_cached() {
    let (services, fakes) = setup_services(|config| {
        config.cache.min_downloads = 1;
        config.coalescing.result_grace_period = Duration::ZERO;
    });

    let first = services
        .previews
        .get_preview(request("https://example.org/cached", 0))
        .await
        .unwrap();
    let second = services
        .previews
        .get_preview(request("https://example.org/cached", 0))
        .await
        .unwrap();

    assert_eq!(first.outcome, CacheOutcome::Admitted);
    assert_eq!(second.outcome, CacheOutcome::Hit);
    assert_eq!(first.preview, second.preview);
    assert_eq!(fakes.previewer.calls(), 1);
}

#[tokio::test]
async fn test_preview_disabled() {
    let (services, fakes) = setup_services(|config| {
        config.url_previews.enabled = false;
    });

    let result = services
        .previews
        .get_preview(request("https://example.org/", 0))
        .await;
    assert_eq!(result.unwrap_err(), CacheError::NotFound);
    assert_eq!(fakes.previewer.calls(), 0);
}

#[tokio::test]
async fn test_preview_unreachable() {
    let (services, fakes) = setup_services(|_| {});

    let result = services
        .previews
        .get_preview(request("https://unreachable.invalid/", 0))
        .await;
    assert!(matches!(result, Err(CacheError::DownloadError(_))));

    // the failure is kept for the grace period
    let result = services
        .previews
        .get_preview(request("https://unreachable.invalid/", 0))
        .await;
    assert!(matches!(result, Err(CacheError::DownloadError(_))));
    assert_eq!(fakes.previewer.calls(), 1);
}
