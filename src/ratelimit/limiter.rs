//! In-process token bucket limiter.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::key::BucketKey;
use super::limit::LimitConfig;
use super::refill::{has_tokens, RefillRate};
use crate::error::{Result, TollgateError};

/// Limit and live state for one bucket.
#[derive(Debug, Clone)]
struct AccountBucket {
    limit: LimitConfig,
    rate: RefillRate,
    tokens: f64,
    last_filled: Instant,
}

impl AccountBucket {
    fn new(limit: LimitConfig, now: Instant) -> Self {
        Self {
            rate: limit.refill_rate(),
            tokens: limit.capacity as f64,
            limit,
            last_filled: now,
        }
    }

    /// Credit whole ticks elapsed since `last_filled` and try to take
    /// `requested` tokens.
    ///
    /// `last_filled` only advances by the whole ticks credited, so the
    /// fractional remainder carries into the next call.
    fn take(&mut self, requested: f64, now: Instant) -> bool {
        let delta = now.saturating_duration_since(self.last_filled);
        let (ticks, consumed) = self.rate.whole_ticks(delta);

        self.tokens = (self.tokens + ticks as f64).min(self.limit.capacity as f64);
        self.last_filled += consumed;

        let allowed = has_tokens(self.tokens, requested);
        if allowed {
            self.tokens -= requested;
        }
        allowed
    }
}

/// A token bucket limiter that keeps every bucket in process memory.
///
/// One mutex guards the whole key space, so every `set_limit` and
/// `get_token` call is serialized. That is fine for low to moderate call
/// rates; per-key striping would be the next step under heavy load.
/// Nothing survives a restart.
pub struct LocalRateLimiter {
    /// Buckets indexed by (resource, account)
    buckets: Mutex<HashMap<BucketKey, AccountBucket>>,
}

impl LocalRateLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_limit_at(&self, key: BucketKey, limit: LimitConfig, now: Instant) {
        let mut buckets = self.buckets.lock();

        match buckets.get_mut(&key) {
            Some(bucket) => {
                debug!(key = %key, capacity = limit.capacity, window_secs = limit.window_secs, "Updating limit");
                bucket.rate = limit.refill_rate();
                bucket.limit = limit;
            }
            None => {
                debug!(key = %key, capacity = limit.capacity, window_secs = limit.window_secs, "Creating bucket");
                buckets.insert(key, AccountBucket::new(limit, now));
            }
        }
    }

    pub(crate) fn get_token_at(&self, key: &BucketKey, now: Instant) -> Result<bool> {
        let mut buckets = self.buckets.lock();

        let bucket = buckets
            .get_mut(key)
            .ok_or_else(|| TollgateError::not_configured(&key.resource, &key.account))?;

        let before = bucket.tokens;
        let allowed = bucket.take(1.0, now);

        trace!(
            key = %key,
            before = before,
            after = bucket.tokens,
            allowed = allowed,
            "Local bucket checked"
        );

        if !allowed {
            debug!(key = %key, "Rate limit exceeded");
        }
        Ok(allowed)
    }

    /// Current token count of a bucket, without refilling it.
    ///
    /// Returns `None` if no limit exists for the key.
    pub fn tokens(&self, resource: &str, account: &str) -> Option<f64> {
        let buckets = self.buckets.lock();
        buckets
            .get(&BucketKey::new(resource, account))
            .map(|b| b.tokens)
    }

    /// Remove every bucket and limit.
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    /// Get the number of configured buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for LocalRateLimiter {
    async fn set_limit(
        &self,
        resource: &str,
        account: &str,
        capacity: u64,
        window_secs: f64,
    ) -> Result<()> {
        let limit = LimitConfig::new(capacity, window_secs)?;
        self.set_limit_at(BucketKey::new(resource, account), limit, Instant::now());
        Ok(())
    }

    async fn get_limit(&self, resource: &str, account: &str) -> Result<(u64, f64)> {
        let buckets = self.buckets.lock();
        buckets
            .get(&BucketKey::new(resource, account))
            .map(|b| (b.limit.capacity, b.limit.window_secs))
            .ok_or_else(|| TollgateError::not_configured(resource, account))
    }

    async fn get_token(&self, resource: &str, account: &str) -> Result<bool> {
        self.get_token_at(&BucketKey::new(resource, account), Instant::now())
    }
}
