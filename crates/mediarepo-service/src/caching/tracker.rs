use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::ContentKey;

/// The number of buckets the tracked window is divided into.
const BUCKETS_PER_WINDOW: u64 = 30;

/// A record of a number of downloads within one bucket.
#[derive(Debug, Clone, Copy)]
struct DownloadCount {
    /// The start of the bucket, measured in milliseconds since the tracker was created.
    timestamp: u64,
    /// The number of downloads.
    downloads: u64,
}

#[derive(Debug)]
struct TrackerState {
    window_millis: u64,
    bucket_size_millis: u64,
    /// When stale keys were last pruned.
    pruned_at: u64,
    downloads: HashMap<ContentKey, VecDeque<DownloadCount>>,
}

impl TrackerState {
    fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.window_millis)
    }

    fn prune(&mut self, now: u64) {
        let cutoff = self.cutoff(now);
        self.downloads.retain(|_, queue| {
            while queue.front().is_some_and(|count| count.timestamp < cutoff) {
                queue.pop_front();
            }
            !queue.is_empty()
        });
        self.pruned_at = now;
    }

    /// Moves all counts into buckets of the current bucket size.
    fn rebucket(&mut self) {
        let bucket_size = self.bucket_size_millis;
        for queue in self.downloads.values_mut() {
            let mut merged: VecDeque<DownloadCount> = VecDeque::with_capacity(queue.len());
            for count in queue.drain(..) {
                let timestamp = count.timestamp - (count.timestamp % bucket_size);
                match merged.back_mut() {
                    Some(last) if last.timestamp == timestamp => last.downloads += count.downloads,
                    _ => merged.push_back(DownloadCount {
                        timestamp,
                        downloads: count.downloads,
                    }),
                }
            }
            *queue = merged;
        }
    }
}

/// Counts recent downloads per [`ContentKey`] over a sliding window.
///
/// Downloads are counted into fixed-size buckets, and buckets older than the window are
/// dropped. An item that is downloaded often and recently reads a high count, an item left
/// alone for longer than the window reads zero.
///
/// Counting is independent of any cache state, a cache miss counts just like a hit.
#[derive(Debug)]
pub struct DownloadTracker {
    epoch: Instant,
    state: Mutex<TrackerState>,
}

impl DownloadTracker {
    pub fn new(window: Duration) -> Self {
        let window_millis = window.as_millis() as u64;
        Self {
            epoch: Instant::now(),
            state: Mutex::new(TrackerState {
                window_millis,
                bucket_size_millis: bucket_size(window_millis),
                pruned_at: 0,
                downloads: HashMap::new(),
            }),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Records one download of `key` and returns the updated count.
    ///
    /// Keys that went stale are forgotten once per window, independent of [`prune`](Self::prune).
    pub fn increment(&self, key: &ContentKey) -> u64 {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        if now.saturating_sub(state.pruned_at) >= state.window_millis {
            state.prune(now);
        }
        let bucket = now - (now % state.bucket_size_millis);
        let cutoff = state.cutoff(now);

        let queue = state.downloads.entry(key.clone()).or_default();
        match queue.back_mut() {
            Some(last) if last.timestamp == bucket => last.downloads += 1,
            _ => queue.push_back(DownloadCount {
                timestamp: bucket,
                downloads: 1,
            }),
        }
        while queue.front().is_some_and(|count| count.timestamp < cutoff) {
            queue.pop_front();
        }

        queue.iter().map(|count| count.downloads).sum()
    }

    /// The number of downloads of `key` within the tracked window.
    pub fn count(&self, key: &ContentKey) -> u64 {
        let now = self.now();
        let state = self.state.lock().unwrap();
        let cutoff = state.cutoff(now);

        state.downloads.get(key).map_or(0, |queue| {
            queue
                .iter()
                .skip_while(|count| count.timestamp < cutoff)
                .map(|count| count.downloads)
                .sum()
        })
    }

    /// Changes the tracked window, applying to all subsequent counts.
    pub fn set_window(&self, window: Duration) {
        let window_millis = window.as_millis() as u64;
        let mut state = self.state.lock().unwrap();
        state.window_millis = window_millis;
        let bucket_size_millis = bucket_size(window_millis);
        if bucket_size_millis != state.bucket_size_millis {
            state.bucket_size_millis = bucket_size_millis;
            state.rebucket();
        }
    }

    /// Forgets every key that was not downloaded within the tracked window.
    pub fn prune(&self) {
        let now = self.now();
        self.state.lock().unwrap().prune(now);
    }

    /// The number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().downloads.clear();
    }
}

fn bucket_size(window_millis: u64) -> u64 {
    (window_millis / BUCKETS_PER_WINDOW).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_within_window() {
        let tracker = DownloadTracker::new(Duration::from_secs(60));
        let key = ContentKey::from("abc");

        assert_eq!(tracker.count(&key), 0);
        assert_eq!(tracker.increment(&key), 1);
        assert_eq!(tracker.increment(&key), 2);
        assert_eq!(tracker.increment(&key), 3);
        assert_eq!(tracker.count(&key), 3);

        // other keys are unaffected
        assert_eq!(tracker.count(&ContentKey::from("def")), 0);
    }

    #[test]
    fn test_counts_decay() {
        let tracker = DownloadTracker::new(Duration::from_millis(60));
        let key = ContentKey::from("abc");

        tracker.increment(&key);
        tracker.increment(&key);
        assert_eq!(tracker.count(&key), 2);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(tracker.count(&key), 0);

        // a fresh download starts counting from scratch
        assert_eq!(tracker.increment(&key), 1);
    }

    #[test]
    fn test_prune() {
        let tracker = DownloadTracker::new(Duration::from_millis(60));
        tracker.increment(&ContentKey::from("old"));
        assert_eq!(tracker.len(), 1);

        std::thread::sleep(Duration::from_millis(100));
        tracker.prune();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_increment_forgets_stale_keys() {
        let tracker = DownloadTracker::new(Duration::from_millis(60));
        tracker.increment(&ContentKey::from("old"));
        std::thread::sleep(Duration::from_millis(100));
        tracker.increment(&ContentKey::from("new"));

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.count(&ContentKey::from("old")), 0);
        assert_eq!(tracker.count(&ContentKey::from("new")), 1);
    }

    #[test]
    fn test_growing_window_keeps_buckets_ordered() {
        let tracker = DownloadTracker::new(Duration::from_secs(60));
        let key = ContentKey::from("abc");
        {
            // counts in two-second buckets, ahead of the tracker's clock
            let mut state = tracker.state.lock().unwrap();
            let queue = state.downloads.entry(key.clone()).or_default();
            queue.push_back(DownloadCount {
                timestamp: 4_000,
                downloads: 2,
            });
            queue.push_back(DownloadCount {
                timestamp: 6_000,
                downloads: 3,
            });
        }

        // twenty-second buckets fold both counts into the one starting at zero
        tracker.set_window(Duration::from_secs(600));
        assert_eq!(tracker.count(&key), 5);
        assert_eq!(tracker.increment(&key), 6);

        let state = tracker.state.lock().unwrap();
        let timestamps: Vec<_> = state.downloads[&key]
            .iter()
            .map(|count| count.timestamp)
            .collect();
        assert_eq!(timestamps, [0]);
    }

    #[test]
    fn test_shrinking_window() {
        let tracker = DownloadTracker::new(Duration::from_secs(60));
        let key = ContentKey::from("abc");
        tracker.increment(&key);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(tracker.count(&key), 1);

        tracker.set_window(Duration::from_millis(10));
        assert_eq!(tracker.count(&key), 0);
    }
}
