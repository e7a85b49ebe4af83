//! Last-known-good cache with soft expiry.
//!
//! Entries are only written with trusted samples. Lookups take the TTL as a
//! parameter so the caller can tighten it when the upstream entity set is
//! known to be incomplete. An expired entry reads as absent but stays in
//! place until the next trusted sample overwrites it.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quotawatch_core::{EntityId, Sample};

/// One cached sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_id: EntityId,
    pub last_trusted_sample: Sample,
    /// Unix timestamp (seconds) when the sample was recorded.
    pub cached_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreshnessCache {
    entries: HashMap<EntityId, CacheEntry>,
}

impl FreshnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for `entity_id`.
    pub fn record(&mut self, entity_id: &str, sample: Sample, now: u64) {
        self.entries.insert(
            entity_id.to_string(),
            CacheEntry {
                entity_id: entity_id.to_string(),
                last_trusted_sample: sample,
                cached_at: now,
            },
        );
    }

    /// Return the cached sample and its age in seconds if it is no older
    /// than `ttl`.
    pub fn lookup(&self, entity_id: &str, now: u64, ttl: Duration) -> Option<(&Sample, u64)> {
        let entry = self.entries.get(entity_id)?;
        let age = now.saturating_sub(entry.cached_at);
        (age <= ttl.as_secs()).then_some((&entry.last_trusted_sample, age))
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Load previously persisted entries.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = CacheEntry>) {
        for entry in entries {
            self.entries.insert(entry.entity_id.clone(), entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn lookup_within_ttl() {
        let mut cache = FreshnessCache::new();
        cache.record("svc", Sample::percent("svc", 95.0, 100), 100);

        let (sample, age) = cache.lookup("svc", 250, TTL).unwrap();
        assert_eq!(sample.field("percent"), Some(95.0));
        assert_eq!(age, 150);
    }

    #[test]
    fn lookup_at_exact_ttl_is_fresh() {
        let mut cache = FreshnessCache::new();
        cache.record("svc", Sample::percent("svc", 95.0, 0), 0);
        assert!(cache.lookup("svc", 300, TTL).is_some());
        assert!(cache.lookup("svc", 301, TTL).is_none());
    }

    #[test]
    fn expiry_is_soft() {
        let mut cache = FreshnessCache::new();
        cache.record("svc", Sample::percent("svc", 95.0, 0), 0);

        assert!(cache.lookup("svc", 10_000, TTL).is_none());
        // Still there for a longer TTL: expiry did not evict.
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("svc", 10_000, Duration::from_secs(20_000)).is_some());
    }

    #[test]
    fn record_overwrites() {
        let mut cache = FreshnessCache::new();
        cache.record("svc", Sample::percent("svc", 95.0, 0), 0);
        cache.record("svc", Sample::percent("svc", 80.0, 50), 50);

        let (sample, age) = cache.lookup("svc", 60, TTL).unwrap();
        assert_eq!(sample.field("percent"), Some(80.0));
        assert_eq!(age, 10);
    }

    #[test]
    fn lookup_is_side_effect_free() {
        let mut cache = FreshnessCache::new();
        cache.record("svc", Sample::percent("svc", 95.0, 0), 0);
        let before = cache.clone();
        let _ = cache.lookup("svc", 5, TTL);
        let _ = cache.lookup("svc", 50_000, TTL);
        let _ = cache.lookup("other", 5, TTL);
        assert_eq!(cache, before);
    }

    #[test]
    fn restore_replaces_by_entity() {
        let mut cache = FreshnessCache::new();
        cache.restore(vec![CacheEntry {
            entity_id: "codex".to_string(),
            last_trusted_sample: Sample::quota("codex", 10.0, 1.0, 9.0, 5),
            cached_at: 5,
        }]);
        assert_eq!(cache.lookup("codex", 6, TTL).map(|(_, age)| age), Some(1));
    }
}
