//! Tollgate - per-account token bucket admission control
//!
//! Each (resource, account) pair gets a token bucket with a configured
//! capacity and refill window. Three interchangeable backends implement
//! [`ratelimit::RateLimiterBackend`], differing in how they keep the
//! refill-and-consume step atomic when many callers share a bucket:
//!
//! - [`ratelimit::LocalRateLimiter`] - one in-process lock.
//! - [`ratelimit::ConditionalRateLimiter`] - a claim/settle protocol over a
//!   store that only offers conditional writes.
//! - `ratelimit::RedisRateLimiter` - a single Lua script run by Redis
//!   (`redis` feature).
//!
//! The conditional backend runs over any [`table::ConditionalTable`]; the
//! `dynamo` feature adds one backed by DynamoDB.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod table;

pub use error::{Result, TollgateError};
