//! Token bucket rate limiting and the backends that keep it atomic.

mod backend;
mod cache;
mod conditional;
mod key;
mod limit;
mod limiter;
mod refill;
#[cfg(feature = "redis")]
mod script;

pub use backend::RateLimiterBackend;
pub use conditional::{BucketState, ConditionalRateLimiter};
pub use key::BucketKey;
pub use limit::LimitConfig;
pub use limiter::LocalRateLimiter;
pub use refill::{has_tokens, RefillRate, TOKEN_EPSILON};
#[cfg(feature = "redis")]
pub use script::{RedisRateLimiter, ScriptOutcome};
