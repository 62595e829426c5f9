use std::time::{Duration, Instant};

use crate::types::ContentKey;

/// The most recent cache state change of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    /// The key was admitted and may not be evicted by demand yet.
    JustAdmitted,
    /// The key was evicted and may not be admitted again yet.
    JustEvicted,
}

#[derive(Debug, Clone, Copy)]
struct CooldownMark {
    direction: Cooldown,
    expires_at: Instant,
}

/// A struct implementing [`moka::Expiry`] that uses the absolute [`CooldownMark::expires_at`]
/// as the explicit expiration time.
struct CooldownExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed this will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<ContentKey, CooldownMark> for CooldownExpiration {
    fn expire_after_create(
        &self,
        _key: &ContentKey,
        value: &CooldownMark,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.expires_at)
    }

    fn expire_after_update(
        &self,
        _key: &ContentKey,
        value: &CooldownMark,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.expires_at)
    }
}

/// Short lived markers recording when a key last joined or left the cache.
///
/// A key holds at most one mark, a new mark replaces the previous one regardless of its
/// direction. Marks carry an absolute expiry computed when they are placed.
pub struct CooldownLedger {
    marks: moka::sync::Cache<ContentKey, CooldownMark>,
}

impl std::fmt::Debug for CooldownLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownLedger")
            .field("marks", &self.marks.entry_count())
            .finish()
    }
}

impl Default for CooldownLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self {
            marks: moka::sync::Cache::builder()
                .name("cooldowns")
                .expire_after(CooldownExpiration)
                .build(),
        }
    }

    fn mark(&self, key: &ContentKey, direction: Cooldown, dwell: Duration) {
        if dwell.is_zero() {
            self.marks.invalidate(key);
            return;
        }
        let mark = CooldownMark {
            direction,
            expires_at: Instant::now() + dwell,
        };
        self.marks.insert(key.clone(), mark);
    }

    /// Protects `key` from demand-based eviction for `dwell`.
    pub fn flag_admitted(&self, key: &ContentKey, dwell: Duration) {
        self.mark(key, Cooldown::JustAdmitted, dwell);
    }

    /// Keeps `key` from being admitted again for `dwell`.
    pub fn flag_evicted(&self, key: &ContentKey, dwell: Duration) {
        self.mark(key, Cooldown::JustEvicted, dwell);
    }

    /// The active cooldown of `key`, if any.
    pub fn get(&self, key: &ContentKey) -> Option<Cooldown> {
        self.marks
            .get(key)
            .filter(|mark| mark.expires_at > Instant::now())
            .map(|mark| mark.direction)
    }

    /// Whether `key` may be admitted into the cache.
    pub fn can_join(&self, key: &ContentKey) -> bool {
        self.get(key) != Some(Cooldown::JustEvicted)
    }

    /// Whether `key` may be evicted from the cache by a demand-based sweep.
    pub fn can_leave(&self, key: &ContentKey) -> bool {
        self.get(key) != Some(Cooldown::JustAdmitted)
    }

    pub fn clear(&self) {
        self.marks.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_expire() {
        let ledger = CooldownLedger::new();
        let key = ContentKey::from("abc");
        assert_eq!(ledger.get(&key), None);

        ledger.flag_admitted(&key, Duration::from_millis(50));
        assert_eq!(ledger.get(&key), Some(Cooldown::JustAdmitted));
        assert!(ledger.can_join(&key));
        assert!(!ledger.can_leave(&key));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(ledger.get(&key), None);
        assert!(ledger.can_leave(&key));
    }

    #[test]
    fn test_new_mark_replaces_old() {
        let ledger = CooldownLedger::new();
        let key = ContentKey::from("abc");

        ledger.flag_admitted(&key, Duration::from_secs(60));
        ledger.flag_evicted(&key, Duration::from_secs(60));
        assert_eq!(ledger.get(&key), Some(Cooldown::JustEvicted));
        assert!(!ledger.can_join(&key));
        assert!(ledger.can_leave(&key));

        // a zero dwell time clears the previous mark
        ledger.flag_admitted(&key, Duration::ZERO);
        assert_eq!(ledger.get(&key), None);
    }
}
