//! Token refill arithmetic shared by every backend.

use std::time::Duration;

/// Slack applied when comparing a fractional token count against a request.
///
/// Token counts are kept as `f64` end to end, so a bucket that has accrued
/// exactly one token may read as `0.9999999999`. This is the only place a
/// count is rounded.
pub const TOKEN_EPSILON: f64 = 1e-9;

/// Returns `true` when `tokens` is enough to cover `requested`.
pub fn has_tokens(tokens: f64, requested: f64) -> bool {
    tokens >= admit_threshold(requested)
}

/// The smallest token count that admits `requested` tokens.
pub fn admit_threshold(requested: f64) -> f64 {
    requested - TOKEN_EPSILON
}

/// Refill constants derived from a capacity and a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefillRate {
    /// Tokens the bucket gains per millisecond.
    pub tokens_per_ms: f64,
    /// Milliseconds needed to accrue one token, never below 1.
    pub ms_per_token: f64,
}

impl RefillRate {
    /// Derive the refill constants for `capacity` tokens per `window_secs`.
    ///
    /// Callers validate the limit first; a zero capacity or window would make
    /// the rate meaningless.
    pub fn new(capacity: u64, window_secs: f64) -> Self {
        let window_ms = window_secs * 1000.0;
        let capacity = capacity as f64;

        Self {
            tokens_per_ms: capacity / window_ms,
            ms_per_token: (window_ms / capacity).max(1.0),
        }
    }

    /// Compute the token count after `elapsed_ms` of accrual on top of
    /// `baseline`, saturating at `bound`.
    ///
    /// Negative baselines are treated as an empty bucket and negative elapsed
    /// times (clock skew between callers) as no time at all.
    pub fn refill(&self, baseline: f64, elapsed_ms: f64, bound: f64) -> f64 {
        let gained = self.tokens_per_ms * elapsed_ms.max(0.0);
        (baseline.max(0.0) + gained).min(bound)
    }

    /// The interval after which one whole token accrues, at nanosecond
    /// resolution.
    ///
    /// Unlike `ms_per_token` this is not floored at a millisecond, so rates
    /// above 1000 tokens per second still credit every token they earn.
    pub fn tick(&self) -> Duration {
        let nanos = (1_000_000.0 / self.tokens_per_ms).round().max(1.0);
        Duration::from_nanos(nanos as u64)
    }

    /// Number of whole ticks contained in `elapsed`, plus the time those
    /// ticks span. The remainder stays unconsumed.
    pub fn whole_ticks(&self, elapsed: Duration) -> (u64, Duration) {
        let tick = self.tick().as_nanos().max(1);
        let ticks = elapsed.as_nanos() / tick;
        let consumed = ticks * tick;

        (
            u64::try_from(ticks).unwrap_or(u64::MAX),
            Duration::from_nanos(u64::try_from(consumed).unwrap_or(u64::MAX)),
        )
    }
}
