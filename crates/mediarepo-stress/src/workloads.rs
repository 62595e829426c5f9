use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use mediarepo_service::caching::{CacheEntry, CacheOutcome};
use mediarepo_service::controllers::{DownloadOptions, ThumbnailRequest};
use mediarepo_service::services::SharedServices;
use mediarepo_service::types::{MediaId, PreviewRequest, ThumbnailMethod};
use mediarepo_test::{Fakes, content};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    /// Latency added to every call into the fake upstreams.
    #[serde(default, with = "humantime_serde")]
    pub upstream_latency: Duration,
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct items requested by this workload.
    #[serde(default = "default_keyspace")]
    pub keyspace: usize,
    /// How strongly requests favor a few popular items.
    ///
    /// `1.0` requests every item equally often, larger values concentrate requests on the
    /// first items of the keyspace.
    #[serde(default = "default_skew")]
    pub skew: f64,
    #[serde(flatten)]
    pub payload: Payload,
}

fn default_keyspace() -> usize {
    100
}

fn default_skew() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Download {
        size_bytes: usize,
        #[serde(default)]
        remote: bool,
    },
    Thumbnail {
        size_bytes: usize,
        width: u32,
        height: u32,
    },
    Preview {
        #[serde(default)]
        language: Option<String>,
    },
}

pub enum ParsedPayload {
    Download(Vec<MediaId>),
    Thumbnail(Vec<MediaId>, ThumbnailRequest),
    Preview(Vec<Url>, String),
}

pub struct PreparedWorkload {
    pub concurrency: usize,
    skew: f64,
    payload: ParsedPayload,
}

/// Registers the content requested by `workload` with the fake upstreams.
pub fn prepare_workload(index: usize, fakes: &Fakes, workload: Workload) -> PreparedWorkload {
    let keyspace = workload.keyspace.max(1);
    let media_ids = |origin: &str| -> Vec<MediaId> {
        (0..keyspace)
            .map(|key| MediaId::new(origin, format!("workload{index}-{key}")))
            .collect()
    };

    let payload = match workload.payload {
        Payload::Download { size_bytes, remote } => {
            let media = media_ids(if remote { "remote.stress" } else { "local.stress" });
            for id in &media {
                let bytes = content(&id.media_id, size_bytes);
                if remote {
                    fakes.remote.add(id, bytes, Some("application/octet-stream"));
                } else {
                    fakes.add_local_media(id, bytes, "application/octet-stream");
                }
            }
            ParsedPayload::Download(media)
        }
        Payload::Thumbnail {
            size_bytes,
            width,
            height,
        } => {
            let media = media_ids("local.stress");
            for id in &media {
                fakes.add_local_media(id, content(&id.media_id, size_bytes), "image/png");
            }
            let request = ThumbnailRequest {
                width,
                height,
                method: ThumbnailMethod::Scale,
                animated: false,
            };
            ParsedPayload::Thumbnail(media, request)
        }
        Payload::Preview { language } => {
            let urls = (0..keyspace)
                .filter_map(|key| {
                    Url::parse(&format!("https://stress.example.org/{index}/{key}")).ok()
                })
                .collect();
            ParsedPayload::Preview(urls, language.unwrap_or_else(|| "en".into()))
        }
    };

    PreparedWorkload {
        concurrency: workload.concurrency.max(1),
        skew: workload.skew.max(1.0),
        payload,
    }
}

/// Picks one of `items`, favoring the first ones according to `skew`.
fn pick<T>(items: &[T], skew: f64) -> &T {
    let sample: f64 = rand::rng().random();
    let index = (sample.powf(skew) * items.len() as f64) as usize;
    &items[index.min(items.len() - 1)]
}

/// Requests one item of `workload` and reads it to the end.
pub async fn process_payload(
    services: &SharedServices,
    workload: &PreparedWorkload,
) -> CacheEntry<CacheOutcome> {
    match &workload.payload {
        ParsedPayload::Download(media) => {
            let media = pick(media, workload.skew);
            let response = services
                .downloads
                .get_media(media, DownloadOptions::default())
                .await?;
            response.content.into_bytes().await?;
            Ok(response.outcome)
        }
        ParsedPayload::Thumbnail(media, request) => {
            let media = pick(media, workload.skew);
            let response = services.thumbnails.get_thumbnail(media, *request).await?;
            response.content.into_bytes().await?;
            Ok(response.outcome)
        }
        ParsedPayload::Preview(urls, language) => {
            let url = pick(urls, workload.skew);
            let timestamp_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |since| since.as_millis() as i64);
            let request = PreviewRequest {
                url: url.clone(),
                timestamp_ms,
                language: language.clone(),
            };
            let response = services.previews.get_preview(request).await?;
            Ok(response.outcome)
        }
    }
}
