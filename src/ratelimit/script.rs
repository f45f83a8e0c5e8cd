//! Token bucket limiter backed by a Redis Lua script.
//!
//! Redis runs a script in isolation, so reading the bucket, refilling it,
//! deciding and writing back happen in one round trip with no window for
//! another caller to interleave. The server clock (`TIME`) is used, so callers
//! on different hosts agree on elapsed time.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use tracing::{debug, instrument, trace};

use super::backend::RateLimiterBackend;
use super::cache::LimitCache;
use super::key::BucketKey;
use super::limit::LimitConfig;
use super::refill::admit_threshold;
use crate::config::ScriptConfig;
use crate::error::{Result, TollgateError};

const TOKEN_SUFFIX: &str = "token";
const TIMESTAMP_SUFFIX: &str = "timestamp";
const LIMIT_SUFFIX: &str = "limit";
const LIMIT_FIELD: &str = "limit";
const WINDOW_FIELD: &str = "window_sec";

/// Tokens drawn by one `get_token` call.
const DRAW: f64 = 1.0;

/// KEYS: token count, last refresh timestamp.
/// ARGV: tokens per ms, capacity, requested, admit threshold.
///
/// The bucket state is written back on every run, admitted or not.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local tokens_key = KEYS[1]
local timestamp_key = KEYS[2]

local tokens_per_ms = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local threshold = tonumber(ARGV[4])

local time_array = redis.call("TIME")
local now = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

local last_tokens = tonumber(redis.call("GET", tokens_key))
if last_tokens == nil then
  last_tokens = capacity
end

local last_refreshed = tonumber(redis.call("GET", timestamp_key))
if last_refreshed == nil then
  last_refreshed = 0
end

local delta = math.max(0, now - last_refreshed)
local filled_tokens = math.min(capacity, last_tokens + (delta * tokens_per_ms))
local allowed = filled_tokens >= threshold
local new_tokens = filled_tokens
if allowed then
  new_tokens = filled_tokens - requested
end

redis.call("SET", tokens_key, tostring(new_tokens))
redis.call("SET", timestamp_key, now)

local allowed_flag = 0
if allowed then
  allowed_flag = 1
end

return { allowed_flag, tostring(last_tokens), tostring(filled_tokens), tostring(new_tokens), now }
"#;

/// What one script run saw and decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptOutcome {
    /// Whether a token was taken
    pub allowed: bool,
    /// Token count before refill
    pub last_tokens: f64,
    /// Token count after refill, before the draw
    pub filled_tokens: f64,
    /// Token count written back
    pub new_tokens: f64,
    /// Server time of the run, epoch milliseconds
    pub now_ms: i64,
}

/// A token bucket limiter backed by Redis.
///
/// Per key it keeps two plain values (`<resource>.<account>.token` and
/// `.timestamp`) plus a hash (`.limit`) holding the capacity and window.
pub struct RedisRateLimiter {
    connection_manager: ConnectionManager,
    /// Compiled once per limiter; invoked by hash after the first load.
    script: redis::Script,
    config: ScriptConfig,
    limits: LimitCache,
}

impl RedisRateLimiter {
    /// Create a limiter over an existing connection manager.
    pub fn new(connection_manager: ConnectionManager, config: ScriptConfig) -> Self {
        Self {
            connection_manager,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            limits: LimitCache::new(config.limit_cache_ttl()),
            config,
        }
    }

    /// Create a limiter from a [`redis::Client`], opening a managed connection.
    pub async fn from_client(client: Client, config: ScriptConfig) -> Result<Self> {
        let connection_manager = client.get_connection_manager().await?;
        Ok(Self::new(connection_manager, config))
    }

    /// Get the configuration.
    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    fn redis_key(&self, key: &BucketKey, suffix: &str) -> String {
        key.storage_key(self.config.key_prefix.as_deref(), suffix)
    }

    async fn load_limit(&self, key: &BucketKey) -> Result<LimitConfig> {
        if let Some(limit) = self.limits.get(key) {
            return Ok(limit);
        }

        let mut connection_manager = self.connection_manager.clone();
        let fields: HashMap<String, String> = connection_manager
            .hgetall(self.redis_key(key, LIMIT_SUFFIX))
            .await?;

        trace!(key = %key, fields = ?fields, "Loaded limit hash");

        let limit = parse_limit_fields(&fields)?
            .ok_or_else(|| TollgateError::not_configured(&key.resource, &key.account))?;
        self.limits.insert(key.clone(), limit.clone());
        Ok(limit)
    }

    /// Run the bucket script once for `key` under `limit`.
    pub async fn run_script(&self, key: &BucketKey, limit: &LimitConfig) -> Result<ScriptOutcome> {
        let rate = limit.refill_rate();
        let mut connection_manager = self.connection_manager.clone();

        let (allowed, last_tokens, filled_tokens, new_tokens, now_ms): (i64, String, String, String, i64) =
            self.script
                .key(self.redis_key(key, TOKEN_SUFFIX))
                .key(self.redis_key(key, TIMESTAMP_SUFFIX))
                .arg(rate.tokens_per_ms)
                .arg(limit.capacity)
                .arg(DRAW)
                .arg(admit_threshold(DRAW))
                .invoke_async(&mut connection_manager)
                .await?;

        Ok(ScriptOutcome {
            allowed: allowed == 1,
            last_tokens: parse_count(&last_tokens)?,
            filled_tokens: parse_count(&filled_tokens)?,
            new_tokens: parse_count(&new_tokens)?,
            now_ms,
        })
    }
}

#[async_trait]
impl RateLimiterBackend for RedisRateLimiter {
    async fn set_limit(
        &self,
        resource: &str,
        account: &str,
        capacity: u64,
        window_secs: f64,
    ) -> Result<()> {
        let key = BucketKey::new(resource, account);
        let limit = LimitConfig::new(capacity, window_secs)?;

        let fields = [
            (LIMIT_FIELD, capacity.to_string()),
            (WINDOW_FIELD, window_secs.to_string()),
        ];
        let mut connection_manager = self.connection_manager.clone();
        let _: () = connection_manager
            .hset_multiple(self.redis_key(&key, LIMIT_SUFFIX), &fields)
            .await?;

        debug!(key = %key, capacity = capacity, window_secs = window_secs, "Limit stored");
        self.limits.insert(key, limit);
        Ok(())
    }

    async fn get_limit(&self, resource: &str, account: &str) -> Result<(u64, f64)> {
        let limit = self.load_limit(&BucketKey::new(resource, account)).await?;
        Ok((limit.capacity, limit.window_secs))
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_token(&self, resource: &str, account: &str) -> Result<bool> {
        let key = BucketKey::new(resource, account);
        let limit = self.load_limit(&key).await?;
        let outcome = self.run_script(&key, &limit).await?;

        trace!(
            key = %key,
            last_tokens = outcome.last_tokens,
            filled_tokens = outcome.filled_tokens,
            new_tokens = outcome.new_tokens,
            now_ms = outcome.now_ms,
            "Bucket script ran"
        );

        if !outcome.allowed {
            debug!(key = %key, "Capacity exhausted");
        }
        Ok(outcome.allowed)
    }
}

/// Parse the `.limit` hash. An empty hash means no limit was set.
fn parse_limit_fields(fields: &HashMap<String, String>) -> Result<Option<LimitConfig>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let capacity = fields
        .get(LIMIT_FIELD)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            TollgateError::InvalidConfiguration(format!("stored {} is not a positive integer", LIMIT_FIELD))
        })?;
    let window_secs = fields
        .get(WINDOW_FIELD)
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| {
            TollgateError::InvalidConfiguration(format!("stored {} is not a number", WINDOW_FIELD))
        })?;

    LimitConfig::new(capacity, window_secs).map(Some)
}

fn parse_count(value: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| {
        RedisError::from((ErrorKind::TypeError, "bucket script returned a non-numeric count")).into()
    })
}
