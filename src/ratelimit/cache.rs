//! Short-lived cache of limit configurations.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::key::BucketKey;
use super::limit::LimitConfig;

/// Per-instance cache that saves the distributed backends a limit lookup on
/// every `get_token`.
///
/// A zero TTL disables caching. Limits changed by another process become
/// visible once the cached entry expires.
#[derive(Debug)]
pub(crate) struct LimitCache {
    ttl: Duration,
    entries: DashMap<BucketKey, (LimitConfig, Instant)>,
}

impl LimitCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub(crate) fn get(&self, key: &BucketKey) -> Option<LimitConfig> {
        if !self.is_enabled() {
            return None;
        }

        if let Some(entry) = self.entries.get(key) {
            let (limit, cached_at) = entry.value();
            if cached_at.elapsed() < self.ttl {
                return Some(limit.clone());
            }
        }

        self.evict_if_stale(key);
        None
    }

    /// Drop the entry for `key` only if it is still expired, so a fresh
    /// insert racing with the eviction survives.
    fn evict_if_stale(&self, key: &BucketKey) {
        self.entries
            .remove_if(key, |_, (_, cached_at)| cached_at.elapsed() >= self.ttl);
    }

    pub(crate) fn insert(&self, key: BucketKey, limit: LimitConfig) {
        if self.is_enabled() {
            self.entries.insert(key, (limit, Instant::now()));
        }
    }
}
