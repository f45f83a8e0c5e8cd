//! Token bucket limiter for stores that only offer conditional writes.
//!
//! Such a store cannot read a value, compute a time-based refill and write the
//! result back in one atomic step. Each `get_token` is therefore split in two:
//!
//! 1. **Claim** - one conditional update that decrements the token count,
//!    bumps the claim counter and stamps `last_claim`. It only succeeds if the
//!    bucket is new, holds a whole token, or has gone a full token interval
//!    without a claim. This update is the admission decision and the only step
//!    that must be atomic.
//! 2. **Settle** - a second, best-effort update that writes the refilled token
//!    count and advances `last_refill`. It applies only while the claim counter
//!    still matches the one its claim returned, and never moves the timestamp
//!    backward. A settle overtaken by a later claim is dropped; that claim's
//!    own settle carries the refill. A rejected or failed settle leaves the
//!    admission in place.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, instrument, trace, warn};

use super::backend::RateLimiterBackend;
use super::cache::LimitCache;
use super::key::BucketKey;
use super::limit::LimitConfig;
use super::refill::{admit_threshold, RefillRate};
use crate::config::ConditionalConfig;
use crate::error::{Result, TollgateError};
use crate::table::{
    AttributeValue, Condition, ConditionalTable, Item, ItemKey, ReturnValues, TableError,
    UpdateRequest,
};

const RESOURCE_ATTR: &str = "resource_name";
const ACCOUNT_ATTR: &str = "account_id";
const LIMIT_ATTR: &str = "limit";
const WINDOW_ATTR: &str = "window_sec";
const SERVICE_ATTR: &str = "service_name";
const TOKENS_ATTR: &str = "tokens";
const LAST_REFILL_ATTR: &str = "last_refill";
const LAST_CLAIM_ATTR: &str = "last_claim";
const CLAIMS_ATTR: &str = "claims";

/// Tokens drawn by one `get_token` call.
const DRAW: f64 = 1.0;

/// Bucket state as stored in the token table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Token count; may sit below zero between a claim and its settle
    pub tokens: f64,
    /// Epoch milliseconds of the last applied settle, 0 if none
    pub last_refill_ms: f64,
    /// Epoch milliseconds of the last successful claim, 0 if none
    pub last_claim_ms: f64,
    /// Number of successful claims so far
    pub claims: u64,
}

impl BucketState {
    fn from_item(item: &Item) -> Self {
        let number = |name: &str| {
            item.get(name)
                .and_then(AttributeValue::as_number)
                .unwrap_or(0.0)
        };

        Self {
            tokens: number(TOKENS_ATTR),
            last_refill_ms: number(LAST_REFILL_ATTR),
            last_claim_ms: number(LAST_CLAIM_ATTR),
            claims: number(CLAIMS_ATTR) as u64,
        }
    }
}

/// A token bucket limiter backed by a [`ConditionalTable`].
///
/// Limits live in one table and bucket state in another, both keyed by
/// (resource, account). The store is the only arbiter between concurrent
/// callers; no client-side locking is involved.
pub struct ConditionalRateLimiter<T> {
    /// The backing store.
    table: T,
    /// Table names and service tag.
    config: ConditionalConfig,
    /// Recently read limits.
    limits: LimitCache,
}

impl<T: ConditionalTable> ConditionalRateLimiter<T> {
    /// Create a limiter over `table`.
    pub fn new(table: T, config: ConditionalConfig) -> Self {
        Self {
            limits: LimitCache::new(config.limit_cache_ttl()),
            table,
            config,
        }
    }

    /// Get the backing table.
    pub fn table(&self) -> &T {
        &self.table
    }

    /// Get the configuration.
    pub fn config(&self) -> &ConditionalConfig {
        &self.config
    }

    /// Read the full limit for a (resource, account) pair, including the
    /// owning service tag.
    pub async fn limit(&self, resource: &str, account: &str) -> Result<LimitConfig> {
        self.load_limit(&BucketKey::new(resource, account)).await
    }

    /// Read the stored bucket state, if the bucket has been touched yet.
    pub async fn bucket(&self, resource: &str, account: &str) -> Result<Option<BucketState>> {
        let key = item_key(&BucketKey::new(resource, account));
        let item = self.table.get_item(&self.config.token_table, &key).await?;
        Ok(item.as_ref().map(BucketState::from_item))
    }

    async fn load_limit(&self, key: &BucketKey) -> Result<LimitConfig> {
        if let Some(limit) = self.limits.get(key) {
            return Ok(limit);
        }

        let item = self
            .table
            .get_item(&self.config.limit_table, &item_key(key))
            .await?
            .ok_or_else(|| TollgateError::not_configured(&key.resource, &key.account))?;

        let limit = parse_limit(&item)?;
        self.limits.insert(key.clone(), limit.clone());
        Ok(limit)
    }

    /// Atomically take a token. Returns the post-claim state, or `None` when
    /// the bucket is exhausted.
    pub(crate) async fn claim(
        &self,
        key: &BucketKey,
        rate: &RefillRate,
        now_ms: f64,
    ) -> Result<Option<BucketState>> {
        let condition = Condition::Or(vec![
            Condition::AttributeNotExists(TOKENS_ATTR.to_string()),
            Condition::GreaterThanOrEqual(TOKENS_ATTR.to_string(), admit_threshold(DRAW)),
            Condition::LessThan(LAST_CLAIM_ATTR.to_string(), now_ms - rate.ms_per_token),
        ]);

        let request = UpdateRequest::new(&self.config.token_table, item_key(key))
            .add(TOKENS_ATTR, -DRAW)
            .add(CLAIMS_ATTR, 1.0)
            .set(LAST_CLAIM_ATTR, AttributeValue::N(now_ms))
            .set(RESOURCE_ATTR, AttributeValue::S(key.resource.clone()))
            .set(ACCOUNT_ATTR, AttributeValue::S(key.account.clone()))
            .condition(condition)
            .returning(ReturnValues::AllNew);

        match self.table.update_item(request).await {
            Ok(item) => Ok(Some(
                item.as_ref()
                    .map(BucketState::from_item)
                    .unwrap_or(BucketState {
                        tokens: -DRAW,
                        last_refill_ms: 0.0,
                        last_claim_ms: now_ms,
                        claims: 1,
                    }),
            )),
            Err(TableError::ConditionalCheckFailed) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the refilled token count for a claim made at `now_ms`.
    ///
    /// The refill starts from the count the claim saw, is capped at
    /// capacity, and then has the claimed token taken off. Fails with
    /// `ConditionalCheckFailed` if another claim has landed since `claimed`
    /// or a settle at or after `now_ms` has already been applied.
    pub(crate) async fn settle(
        &self,
        key: &BucketKey,
        limit: &LimitConfig,
        rate: &RefillRate,
        claimed: &BucketState,
        now_ms: f64,
    ) -> Result<f64> {
        let elapsed_ms = now_ms - claimed.last_refill_ms;
        let before_draw = claimed.tokens + DRAW;
        let tokens = rate.refill(before_draw, elapsed_ms, limit.capacity as f64) - DRAW;

        let condition = Condition::And(vec![
            Condition::Equals(CLAIMS_ATTR.to_string(), claimed.claims as f64),
            Condition::Or(vec![
                Condition::AttributeNotExists(LAST_REFILL_ATTR.to_string()),
                Condition::LessThan(LAST_REFILL_ATTR.to_string(), now_ms),
            ]),
        ]);

        let request = UpdateRequest::new(&self.config.token_table, item_key(key))
            .set(TOKENS_ATTR, AttributeValue::N(tokens))
            .set(LAST_REFILL_ATTR, AttributeValue::N(now_ms))
            .condition(condition);

        self.table.update_item(request).await?;
        Ok(tokens)
    }

    pub(crate) async fn get_token_at(&self, key: &BucketKey, now_ms: f64) -> Result<bool> {
        let limit = self.load_limit(key).await?;
        let rate = limit.refill_rate();

        let claimed = match self.claim(key, &rate, now_ms).await? {
            Some(claimed) => claimed,
            None => {
                debug!(key = %key, "Capacity exhausted");
                return Ok(false);
            }
        };

        trace!(
            key = %key,
            tokens = claimed.tokens,
            last_refill_ms = claimed.last_refill_ms,
            "Token claimed"
        );

        match self.settle(key, &limit, &rate, &claimed, now_ms).await {
            Ok(tokens) => trace!(key = %key, tokens = tokens, "Bucket settled"),
            Err(TollgateError::Table(TableError::ConditionalCheckFailed)) => {
                debug!(key = %key, "Settle superseded by a later claim or refill");
            }
            Err(e) => warn!(key = %key, error = %e, "Settle failed, admission stands"),
        }

        Ok(true)
    }
}

#[async_trait]
impl<T: ConditionalTable> RateLimiterBackend for ConditionalRateLimiter<T> {
    async fn set_limit(
        &self,
        resource: &str,
        account: &str,
        capacity: u64,
        window_secs: f64,
    ) -> Result<()> {
        let key = BucketKey::new(resource, account);
        let limit = LimitConfig::new(capacity, window_secs)?
            .with_service(self.config.service_name.clone());

        let mut item = Item::new();
        item.insert(RESOURCE_ATTR.to_string(), AttributeValue::S(key.resource.clone()));
        item.insert(ACCOUNT_ATTR.to_string(), AttributeValue::S(key.account.clone()));
        item.insert(LIMIT_ATTR.to_string(), AttributeValue::N(capacity as f64));
        item.insert(WINDOW_ATTR.to_string(), AttributeValue::N(window_secs));
        if let Some(service) = &limit.service {
            item.insert(SERVICE_ATTR.to_string(), AttributeValue::S(service.clone()));
        }

        trace!(key = %key, item = ?item, "Storing limit");
        self.table
            .put_item(&self.config.limit_table, &item_key(&key), item)
            .await?;

        self.limits.insert(key, limit);
        Ok(())
    }

    async fn get_limit(&self, resource: &str, account: &str) -> Result<(u64, f64)> {
        let limit = self.load_limit(&BucketKey::new(resource, account)).await?;
        Ok((limit.capacity, limit.window_secs))
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_token(&self, resource: &str, account: &str) -> Result<bool> {
        self.get_token_at(&BucketKey::new(resource, account), epoch_millis())
            .await
    }
}

fn item_key(key: &BucketKey) -> ItemKey {
    ItemKey::new(&key.resource, &key.account)
}

fn parse_limit(item: &Item) -> Result<LimitConfig> {
    let capacity = item
        .get(LIMIT_ATTR)
        .and_then(AttributeValue::as_number)
        .filter(|c| c.fract() == 0.0 && *c > 0.0)
        .ok_or_else(|| {
            TollgateError::InvalidConfiguration(format!("stored {} is not a positive integer", LIMIT_ATTR))
        })?;
    let window_secs = item
        .get(WINDOW_ATTR)
        .and_then(AttributeValue::as_number)
        .ok_or_else(|| {
            TollgateError::InvalidConfiguration(format!("stored {} is not a number", WINDOW_ATTR))
        })?;
    let service = item
        .get(SERVICE_ATTR)
        .and_then(AttributeValue::as_str)
        .map(str::to_string);

    Ok(LimitConfig::new(capacity as u64, window_secs)?.with_service(service))
}

fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTable;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    const T0: f64 = 1_700_000_000_000.0;

    fn key() -> BucketKey {
        BucketKey::new("search", "acct-1")
    }

    async fn limiter_with(capacity: u64, window_secs: f64) -> ConditionalRateLimiter<MemoryTable> {
        let limiter = ConditionalRateLimiter::new(MemoryTable::new(), ConditionalConfig::default());
        limiter
            .set_limit("search", "acct-1", capacity, window_secs)
            .await
            .unwrap();
        limiter
    }

    /// A table that fails every update not asking for the new item back,
    /// which is every settle.
    struct FailingSettles {
        inner: MemoryTable,
    }

    #[async_trait]
    impl ConditionalTable for FailingSettles {
        async fn get_item(&self, table: &str, key: &ItemKey) -> std::result::Result<Option<Item>, TableError> {
            self.inner.get_item(table, key).await
        }

        async fn put_item(&self, table: &str, key: &ItemKey, item: Item) -> std::result::Result<(), TableError> {
            self.inner.put_item(table, key, item).await
        }

        async fn update_item(&self, request: UpdateRequest) -> std::result::Result<Option<Item>, TableError> {
            if request.return_values == ReturnValues::None {
                return Err(TableError::Backend("connection reset".to_string()));
            }
            self.inner.update_item(request).await
        }
    }

    #[tokio::test]
    async fn test_set_and_get_limit() {
        let limiter = limiter_with(5, 1.5).await;
        let (capacity, window) = limiter.get_limit("search", "acct-1").await.unwrap();
        assert_eq!(capacity, 5);
        assert_eq!(window, 1.5);
    }

    #[tokio::test]
    async fn test_service_tag_is_stored() {
        let config = ConditionalConfig {
            service_name: Some("billing".to_string()),
            ..Default::default()
        };
        let limiter = ConditionalRateLimiter::new(MemoryTable::new(), config);
        limiter.set_limit("search", "acct-1", 3, 1.0).await.unwrap();

        let limit = limiter.limit("search", "acct-1").await.unwrap();
        assert_eq!(limit.service.as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn test_unconfigured_key() {
        let limiter = ConditionalRateLimiter::new(MemoryTable::new(), ConditionalConfig::default());
        let err = assert_err!(limiter.get_limit("search", "nobody").await);
        assert!(matches!(err, TollgateError::NotConfigured { .. }));
        let err = assert_err!(limiter.get_token("search", "nobody").await);
        assert!(matches!(err, TollgateError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_invalid_limit_rejected() {
        let limiter = ConditionalRateLimiter::new(MemoryTable::new(), ConditionalConfig::default());
        let err = assert_err!(limiter.set_limit("search", "acct-1", 0, 1.0).await);
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
        assert!(limiter.table().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_stored_limit() {
        let limiter = ConditionalRateLimiter::new(MemoryTable::new(), ConditionalConfig::default());
        let mut item = Item::new();
        item.insert(LIMIT_ATTR.to_string(), AttributeValue::S("lots".to_string()));
        item.insert(WINDOW_ATTR.to_string(), AttributeValue::N(1.0));
        limiter
            .table()
            .put_item("limit", &item_key(&key()), item)
            .await
            .unwrap();

        let err = assert_err!(limiter.get_limit("search", "acct-1").await);
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_fresh_bucket_admits_capacity_then_denies() {
        let limiter = limiter_with(5, 1.0).await;

        for i in 0..5 {
            let now = T0 + i as f64 * 2.0;
            assert!(limiter.get_token_at(&key(), now).await.unwrap(), "call {}", i);
        }
        assert!(!limiter.get_token_at(&key(), T0 + 10.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_first_settle_fills_to_capacity_minus_draw() {
        let limiter = limiter_with(5, 1.0).await;
        assert!(limiter.get_token_at(&key(), T0).await.unwrap());

        let state = limiter.bucket("search", "acct-1").await.unwrap().unwrap();
        assert_eq!(state.tokens, 4.0);
        assert_eq!(state.last_refill_ms, T0);
        assert_eq!(state.last_claim_ms, T0);
    }

    #[tokio::test]
    async fn test_partial_refill_admits_exactly_one() {
        let limiter = limiter_with(5, 1.0).await;
        for i in 0..5 {
            assert!(limiter.get_token_at(&key(), T0 + i as f64).await.unwrap());
        }
        assert!(!limiter.get_token_at(&key(), T0 + 6.0).await.unwrap());

        let later = T0 + 216.0;
        assert!(limiter.get_token_at(&key(), later).await.unwrap());
        assert!(!limiter.get_token_at(&key(), later + 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_full_window_refills_capacity() {
        let limiter = limiter_with(3, 1.0).await;
        for _ in 0..3 {
            assert!(limiter.get_token_at(&key(), T0).await.unwrap());
        }

        let later = T0 + 5_000.0;
        for i in 0..3 {
            assert!(limiter.get_token_at(&key(), later + i as f64).await.unwrap());
        }
        assert!(!limiter.get_token_at(&key(), later + 3.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_settle_never_exceeds_capacity() {
        let limiter = limiter_with(3, 1.0).await;
        let limit = limiter.limit("search", "acct-1").await.unwrap();
        let rate = limit.refill_rate();

        let claimed = limiter.claim(&key(), &rate, T0).await.unwrap().unwrap();
        assert_eq!(claimed.tokens, -1.0);
        assert_eq!(claimed.claims, 1);

        let tokens = limiter.settle(&key(), &limit, &rate, &claimed, T0).await.unwrap();
        assert_eq!(tokens, 2.0);

        let state = limiter.bucket("search", "acct-1").await.unwrap().unwrap();
        assert!(state.tokens <= limit.capacity as f64);
    }

    #[tokio::test]
    async fn test_stale_settle_is_rejected() {
        let limiter = limiter_with(5, 1.0).await;
        let limit = limiter.limit("search", "acct-1").await.unwrap();
        let rate = limit.refill_rate();
        let claimed = limiter.claim(&key(), &rate, T0).await.unwrap().unwrap();

        assert_ok!(limiter.settle(&key(), &limit, &rate, &claimed, T0 + 100.0).await);
        let err = assert_err!(limiter.settle(&key(), &limit, &rate, &claimed, T0 + 50.0).await);
        assert!(matches!(err, TollgateError::Table(TableError::ConditionalCheckFailed)));
        let err = assert_err!(limiter.settle(&key(), &limit, &rate, &claimed, T0 + 100.0).await);
        assert!(matches!(err, TollgateError::Table(TableError::ConditionalCheckFailed)));

        let state = limiter.bucket("search", "acct-1").await.unwrap().unwrap();
        assert_eq!(state.last_refill_ms, T0 + 100.0);
    }

    #[tokio::test]
    async fn test_settle_overtaken_by_later_claim_is_dropped() {
        let limiter = limiter_with(3, 60.0).await;
        let limit = limiter.limit("search", "acct-1").await.unwrap();
        let rate = limit.refill_rate();
        assert!(limiter.get_token_at(&key(), T0).await.unwrap());

        // Two claims land before either settles.
        let first = limiter.claim(&key(), &rate, T0 + 1.0).await.unwrap().unwrap();
        let second = limiter.claim(&key(), &rate, T0 + 1.0).await.unwrap().unwrap();
        assert_eq!(first.tokens, 1.0);
        assert_eq!(second.tokens, 0.0);

        let err = assert_err!(limiter.settle(&key(), &limit, &rate, &first, T0 + 1.0).await);
        assert!(matches!(err, TollgateError::Table(TableError::ConditionalCheckFailed)));
        assert_ok!(limiter.settle(&key(), &limit, &rate, &second, T0 + 1.0).await);

        let state = limiter.bucket("search", "acct-1").await.unwrap().unwrap();
        assert!(state.tokens < 1.0);

        // All three tokens of the window are spent.
        for i in 2..7 {
            assert!(!limiter.get_token_at(&key(), T0 + i as f64).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_concurrent_settles_keep_invariants() {
        let limiter = Arc::new(limiter_with(4, 1.0).await);
        let limit = limiter.limit("search", "acct-1").await.unwrap();
        let rate = limit.refill_rate();
        let claimed = limiter.claim(&key(), &rate, T0).await.unwrap().unwrap();

        let mut handles = Vec::new();
        for i in 0..32u32 {
            let limiter = limiter.clone();
            let limit = limit.clone();
            handles.push(tokio::spawn(async move {
                let now = T0 + ((i * 7919) % 32) as f64;
                let _ = limiter.settle(&key(), &limit, &rate, &claimed, now).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let state = limiter.bucket("search", "acct-1").await.unwrap().unwrap();
        assert!(state.tokens <= limit.capacity as f64);
        // The largest timestamp offered wins, whatever order the settles ran in.
        assert_eq!(state.last_refill_ms, T0 + 31.0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_for_last_token() {
        let limiter = Arc::new(limiter_with(2, 60.0).await);
        assert!(limiter.get_token_at(&key(), T0).await.unwrap());

        let a = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.get_token_at(&key(), T0 + 1.0).await.unwrap() })
        };
        let b = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.get_token_at(&key(), T0 + 1.0).await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b, "exactly one caller should get the last token");
    }

    #[tokio::test]
    async fn test_settle_failure_does_not_undo_admission() {
        let table = FailingSettles {
            inner: MemoryTable::new(),
        };
        let limiter = ConditionalRateLimiter::new(table, ConditionalConfig::default());
        limiter.set_limit("search", "acct-1", 2, 1.0).await.unwrap();

        assert!(limiter.get_token_at(&key(), T0).await.unwrap());
        // The first claim saw a missing counter; without a settle the
        // counter sits at -1 and only the time-based path can admit.
        assert!(!limiter.get_token_at(&key(), T0 + 1.0).await.unwrap());
        assert!(limiter.get_token_at(&key(), T0 + 600.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_limit_cache_serves_reads() {
        let config = ConditionalConfig {
            limit_cache_ttl_ms: 60_000,
            ..Default::default()
        };
        let limiter = ConditionalRateLimiter::new(MemoryTable::new(), config);
        limiter.set_limit("search", "acct-1", 5, 1.0).await.unwrap();

        // Overwrite the stored limit behind the limiter's back.
        let mut item = Item::new();
        item.insert(LIMIT_ATTR.to_string(), AttributeValue::N(9.0));
        item.insert(WINDOW_ATTR.to_string(), AttributeValue::N(2.0));
        limiter
            .table()
            .put_item("limit", &item_key(&key()), item)
            .await
            .unwrap();

        assert_eq!(limiter.get_limit("search", "acct-1").await.unwrap(), (5, 1.0));
    }

    #[tokio::test]
    async fn test_acquire_reports_capacity_reached() {
        let limiter = limiter_with(1, 60.0).await;
        assert_ok!(limiter.acquire("search", "acct-1").await);
        let err = assert_err!(limiter.acquire("search", "acct-1").await);
        assert!(matches!(err, TollgateError::CapacityReached));
    }
}
