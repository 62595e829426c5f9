use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use sentry::{Hub, SentryFutureExt};
use tokio::time::MissedTickBehavior;

use crate::config::ContentCacheConfig;
use crate::types::{ByteStream, ContentKey};
use crate::utils::streams::{Buffered, buffer_stream};

use super::{CacheEntry, CacheOutcome, CachedContent, Content, CooldownLedger, DownloadTracker};

/// The bytes currently held by the cache.
#[derive(Debug, Default)]
struct CacheContents {
    entries: HashMap<ContentKey, Bytes>,
    used_bytes: u64,
}

impl CacheContents {
    fn insert(&mut self, key: ContentKey, bytes: Bytes) {
        let size = bytes.len() as u64;
        if let Some(previous) = self.entries.insert(key, bytes) {
            self.used_bytes -= previous.len() as u64;
        }
        self.used_bytes += size;
    }

    fn remove(&mut self, key: &ContentKey) -> u64 {
        match self.entries.remove(key) {
            Some(bytes) => {
                let size = bytes.len() as u64;
                self.used_bytes -= size;
                size
            }
            None => 0,
        }
    }
}

/// An eviction candidate.
struct Candidate {
    key: ContentKey,
    size: u64,
    downloads: u64,
}

/// A size bounded in-memory cache admitting content based on its popularity.
///
/// Content is only cached once the [`DownloadTracker`] counts at least `min_downloads` within
/// the tracked window. Admissions and evictions place marks on the [`CooldownLedger`], which
/// keep items from flapping in and out of the cache when their popularity hovers around the
/// threshold.
///
/// All admissions and evictions are serialized by a single lock, which is never held across an
/// await point. Content is fetched without holding any lock. Locks of the tracker, the ledger
/// and the contents are never nested.
#[derive(Debug)]
pub struct AdaptiveCache {
    settings: RwLock<ContentCacheConfig>,
    tracker: DownloadTracker,
    cooldowns: CooldownLedger,
    admission: Mutex<()>,
    contents: RwLock<CacheContents>,
}

impl AdaptiveCache {
    pub fn new(config: ContentCacheConfig) -> Self {
        Self {
            tracker: DownloadTracker::new(config.tracked_window),
            cooldowns: CooldownLedger::new(),
            settings: RwLock::new(config),
            admission: Mutex::new(()),
            contents: RwLock::new(CacheContents::default()),
        }
    }

    /// Spawns the periodic background sweep.
    ///
    /// The task only holds a weak reference and ends once the cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        let cache = Arc::downgrade(self);
        let mut period = self.settings().cleanup_interval;
        if period.is_zero() {
            tracing::warn!("Background sweep of the content cache is disabled");
            return;
        }

        let task = async move {
            let mut ticker = cleanup_ticker(period);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let freed = cache.sweep();
                tracing::debug!(freed, "Swept content cache");

                let configured = cache.settings().cleanup_interval;
                if configured != period && !configured.is_zero() {
                    period = configured;
                    ticker = cleanup_ticker(period);
                }
            }
        };
        runtime.spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    fn settings(&self) -> ContentCacheConfig {
        self.settings.read().unwrap().clone()
    }

    /// Records one download of `key`, returning the updated count.
    pub fn mark_download(&self, key: &ContentKey) -> u64 {
        self.tracker.increment(key)
    }

    pub fn download_count(&self, key: &ContentKey) -> u64 {
        self.tracker.count(key)
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.contents.read().unwrap().entries.contains_key(key)
    }

    /// The aggregate size of all cached items.
    pub fn used_bytes(&self) -> u64 {
        self.contents.read().unwrap().used_bytes
    }

    pub fn len(&self) -> usize {
        self.contents.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &ContentKey) -> Option<Bytes> {
        self.contents.read().unwrap().entries.get(key).cloned()
    }

    fn fits(&self, size: u64, settings: &ContentCacheConfig) -> bool {
        size <= settings.max_size_bytes && size <= settings.max_file_size_bytes
    }

    /// Serves `key` from the cache, or from `fetch` on a miss.
    ///
    /// `size` is the expected size of the content, if known. Content that is eligible for
    /// caching is read into memory and offered for admission, anything else is returned as the
    /// stream produced by `fetch`.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &ContentKey,
        size: Option<u64>,
        fetch: F,
    ) -> CacheEntry<CachedContent>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<ByteStream>>,
    {
        let settings = self.settings();
        if !settings.enabled {
            return CachedContent::fetched(fetch).await;
        }

        let downloads = self.tracker.count(key);
        let eligible = downloads >= settings.min_downloads;

        if let Some(bytes) = self.lookup(key) {
            if eligible {
                metric!(counter("caches.content.access") += 1, "outcome" => "hit");
                return Ok(CachedContent {
                    outcome: CacheOutcome::Hit,
                    content: Content::Bytes(bytes),
                });
            }
            self.demote(key);
            return CachedContent::fetched(fetch).await;
        }

        if !eligible || !self.cooldowns.can_join(key) {
            return CachedContent::fetched(fetch).await;
        }
        if let Some(size) = size {
            if !self.fits(size, &settings) {
                metric!(counter("caches.content.refused") += 1, "reason" => "too_large");
                return CachedContent::fetched(fetch).await;
            }
        }

        let stream = fetch().await?;
        let limit = settings.max_file_size_bytes.min(settings.max_size_bytes);
        let (outcome, content) = match buffer_stream(stream, limit).await? {
            Buffered::Complete(bytes) => {
                let outcome = if self.admit(key, &bytes, downloads) {
                    CacheOutcome::Admitted
                } else {
                    CacheOutcome::Miss
                };
                (outcome, Content::Bytes(bytes))
            }
            Buffered::Overflow(stream) => {
                metric!(counter("caches.content.refused") += 1, "reason" => "too_large");
                (CacheOutcome::Miss, Content::Stream(stream))
            }
        };

        metric!(counter("caches.content.access") += 1, "outcome" => outcome.as_str());
        Ok(CachedContent { outcome, content })
    }

    /// Evicts `key` since it is no longer popular enough to stay cached.
    fn demote(&self, key: &ContentKey) {
        let _admission = self.admission.lock().unwrap();
        let settings = self.settings();
        tracing::debug!(%key, "Demoting content which is no longer popular");
        self.evict(&[key.clone()], "demoted", &settings);
        self.report_usage();
    }

    /// Tries to admit `bytes` under `key`, making room if necessary.
    ///
    /// Returns whether the content is cached once this returns.
    fn admit(&self, key: &ContentKey, bytes: &Bytes, downloads: u64) -> bool {
        let _admission = self.admission.lock().unwrap();
        let settings = self.settings();
        let size = bytes.len() as u64;

        if !self.fits(size, &settings) {
            metric!(counter("caches.content.refused") += 1, "reason" => "too_large");
            return false;
        }
        if self.contains(key) {
            return true;
        }
        // an eviction may have raced with the fetch
        if !self.cooldowns.can_join(key) {
            return false;
        }

        let free = settings.max_size_bytes.saturating_sub(self.used_bytes());
        if free < size {
            // the sweep must yield 1.25x the item, out of items smaller than that
            let target = size + size.div_ceil(4);
            let cleared = self.clear_space(target, downloads, target, false, &settings);
            if free + cleared < size {
                tracing::debug!(%key, size, free, "Not enough evictable space to cache content");
                metric!(counter("caches.content.refused") += 1, "reason" => "no_space");
                return false;
            }
        }

        self.contents
            .write()
            .unwrap()
            .insert(key.clone(), bytes.clone());
        self.cooldowns.flag_admitted(key, settings.min_cache_time);
        tracing::debug!(%key, size, downloads, "Admitted content into cache");

        let admitted = self.enforce_budget(key, &settings);
        self.report_usage();
        admitted
    }

    /// Evicts aggressively if the cache ended up over its budget after inserting `key`.
    ///
    /// This is not expected to trigger while admissions hold the admission lock, but the budget
    /// is enforced on every insert regardless. Returns whether `key` is still cached. The caller
    /// must hold the admission lock.
    fn enforce_budget(&self, key: &ContentKey, settings: &ContentCacheConfig) -> bool {
        let used = self.used_bytes();
        if used > settings.max_size_bytes {
            let overage = used - settings.max_size_bytes;
            tracing::warn!(overage, "Content cache exceeded its budget, evicting aggressively");
            self.clear_space(
                overage,
                settings.min_downloads.saturating_mul(4),
                settings.max_size_bytes,
                true,
                settings,
            );
            if self.used_bytes() > settings.max_size_bytes {
                self.evict(&[key.clone()], "overflow", settings);
                return false;
            }
        }
        self.contains(key)
    }

    /// Inserts `bytes` without making room first, then enforces the budget like an admission.
    #[cfg(test)]
    pub(super) fn insert_unchecked(&self, key: &ContentKey, bytes: Bytes) -> bool {
        let _admission = self.admission.lock().unwrap();
        let settings = self.settings();
        self.contents.write().unwrap().insert(key.clone(), bytes);
        self.cooldowns.flag_admitted(key, settings.min_cache_time);
        self.enforce_budget(key, &settings)
    }

    /// Evicts items to free up `needed` bytes.
    ///
    /// Only items smaller than `size_ceiling`, with fewer than `downloads_ceiling` downloads and
    /// not under a [`Cooldown::JustAdmitted`](super::Cooldown::JustAdmitted) mark are
    /// considered, least popular first. Unless `evict_if_short` is set, nothing is evicted when
    /// the candidates do not add up to `needed`.
    ///
    /// Returns the number of bytes freed. The caller must hold the admission lock.
    fn clear_space(
        &self,
        needed: u64,
        downloads_ceiling: u64,
        size_ceiling: u64,
        evict_if_short: bool,
        settings: &ContentCacheConfig,
    ) -> u64 {
        if needed == 0 {
            return 0;
        }

        let mut candidates: Vec<_> = self
            .candidates()
            .into_iter()
            .filter(|c| c.size < size_ceiling && c.downloads < downloads_ceiling)
            .filter(|c| self.cooldowns.can_leave(&c.key))
            .collect();
        candidates.sort_by(|a, b| {
            (a.downloads, b.size, &a.key).cmp(&(b.downloads, a.size, &b.key))
        });

        let mut prepared = 0;
        let mut keys = Vec::new();
        for candidate in candidates {
            if prepared >= needed {
                break;
            }
            prepared += candidate.size;
            keys.push(candidate.key);
        }

        if prepared < needed && !evict_if_short {
            return 0;
        }
        self.evict(&keys, "need_space", settings)
    }

    /// Evicts the least popular items, ignoring any cooldown, until the cache fits its budget.
    ///
    /// The caller must hold the admission lock.
    fn trim_to_budget(&self, settings: &ContentCacheConfig) -> u64 {
        let mut used = self.used_bytes();
        if used <= settings.max_size_bytes {
            return 0;
        }

        let mut candidates = self.candidates();
        candidates.sort_by(|a, b| (a.downloads, &a.key).cmp(&(b.downloads, &b.key)));

        let mut keys = Vec::new();
        for candidate in candidates {
            if used <= settings.max_size_bytes {
                break;
            }
            used -= candidate.size;
            keys.push(candidate.key);
        }
        self.evict(&keys, "over_budget", settings)
    }

    fn candidates(&self) -> Vec<Candidate> {
        let entries: Vec<_> = {
            let contents = self.contents.read().unwrap();
            contents
                .entries
                .iter()
                .map(|(key, bytes)| (key.clone(), bytes.len() as u64))
                .collect()
        };
        entries
            .into_iter()
            .map(|(key, size)| Candidate {
                downloads: self.tracker.count(&key),
                key,
                size,
            })
            .collect()
    }

    fn evict(&self, keys: &[ContentKey], reason: &str, settings: &ContentCacheConfig) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let freed = {
            let mut contents = self.contents.write().unwrap();
            keys.iter().map(|key| contents.remove(key)).sum()
        };
        for key in keys {
            self.cooldowns.flag_evicted(key, settings.min_evicted_time);
        }
        metric!(
            counter("caches.content.eviction") += keys.len() as i64,
            "reason" => reason
        );
        freed
    }

    /// Reclaims space from items whose popularity has faded, and trims the cache to its budget.
    ///
    /// Returns the number of bytes freed.
    pub fn sweep(&self) -> u64 {
        let _admission = self.admission.lock().unwrap();
        let settings = self.settings();
        self.tracker.prune();

        let used = self.used_bytes();
        let mut freed = self.clear_space(used, settings.min_downloads, u64::MAX, true, &settings);
        freed += self.trim_to_budget(&settings);

        self.report_usage();
        freed
    }

    /// Applies new settings without disturbing cached content more than necessary.
    ///
    /// A smaller budget evicts immediately, a disabled cache is emptied.
    pub fn reconfigure(&self, config: ContentCacheConfig) {
        let _admission = self.admission.lock().unwrap();
        let previous = std::mem::replace(&mut *self.settings.write().unwrap(), config.clone());
        if previous == config {
            return;
        }
        tracing::info!("Reconfiguring content cache");

        if previous.tracked_window != config.tracked_window {
            self.tracker.set_window(config.tracked_window);
        }
        if !config.enabled {
            *self.contents.write().unwrap() = CacheContents::default();
        }
        self.trim_to_budget(&config);
        self.report_usage();
    }

    /// Forgets all cached content, download counts and cooldowns.
    pub fn clear(&self) {
        let _admission = self.admission.lock().unwrap();
        self.tracker.clear();
        self.cooldowns.clear();
        *self.contents.write().unwrap() = CacheContents::default();
        self.report_usage();
    }

    fn report_usage(&self) {
        let (used, items) = {
            let contents = self.contents.read().unwrap();
            (contents.used_bytes, contents.entries.len())
        };
        metric!(gauge("caches.content.bytes") = used);
        metric!(gauge("caches.content.items") = items as u64);
    }
}

fn cleanup_ticker(period: Duration) -> tokio::time::Interval {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
