//! Per-(resource, account) limit configuration.

use serde::{Deserialize, Serialize};

use super::refill::RefillRate;
use crate::error::{Result, TollgateError};

/// The capacity and refill window configured for one bucket.
///
/// Capacity and window always travel together; a limit is only ever built
/// through [`LimitConfig::new`], which rejects zero or non-finite values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum number of tokens the bucket holds
    pub capacity: u64,
    /// Seconds needed to refill an empty bucket
    pub window_secs: f64,
    /// Service that owns this limit, when the backend records one
    #[serde(default)]
    pub service: Option<String>,
}

impl LimitConfig {
    /// Create a validated limit.
    pub fn new(capacity: u64, window_secs: f64) -> Result<Self> {
        let limit = Self {
            capacity,
            window_secs,
            service: None,
        };
        limit.validate()?;
        Ok(limit)
    }

    /// Attach an owning service tag.
    pub fn with_service(mut self, service: Option<String>) -> Self {
        self.service = service;
        self
    }

    /// Check the capacity and window constraints.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TollgateError::InvalidConfiguration(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if !self.window_secs.is_finite() || self.window_secs <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "window must be a positive number of seconds, got {}",
                self.window_secs
            )));
        }
        Ok(())
    }

    /// Refill constants for this limit.
    pub fn refill_rate(&self) -> RefillRate {
        RefillRate::new(self.capacity, self.window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_limit() {
        let limit = LimitConfig::new(5, 1.0).unwrap();
        assert_eq!(limit.capacity, 5);
        assert_eq!(limit.window_secs, 1.0);
        assert!(limit.service.is_none());
    }

    #[test]
    fn test_huge_window_is_usable() {
        // Larger than any Duration can hold.
        let limit = LimitConfig::new(5, 1e30).unwrap();
        let rate = limit.refill_rate();
        assert!(rate.tokens_per_ms > 0.0);
        assert!(rate.tick() > std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = LimitConfig::new(0, 1.0).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_bad_window_rejected() {
        for window in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = LimitConfig::new(5, window).unwrap_err();
            assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
        }
    }

    #[test]
    fn test_limit_from_yaml() {
        let limit: LimitConfig = serde_yaml::from_str("capacity: 10\nwindow_secs: 2.5\n").unwrap();
        assert_eq!(limit.capacity, 10);
        assert_eq!(limit.window_secs, 2.5);
        assert!(limit.validate().is_ok());
    }
}
