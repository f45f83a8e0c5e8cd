//! Rate limiter trait for abstracting the local and distributed implementations.

use async_trait::async_trait;

use crate::error::{Result, TollgateError};

/// Trait for rate limiter implementations.
///
/// Every backend exposes the same three operations; they differ only in how
/// the refill-and-consume step is made atomic. Dropping the returned future
/// abandons the call. No backend retries, backs off or applies its own
/// timeout.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Store the capacity and window for a (resource, account) pair,
    /// overwriting any previous limit. Bucket state is left untouched.
    async fn set_limit(
        &self,
        resource: &str,
        account: &str,
        capacity: u64,
        window_secs: f64,
    ) -> Result<()>;

    /// Read back the capacity and window for a (resource, account) pair.
    ///
    /// Fails with [`TollgateError::NotConfigured`] when no limit was set.
    async fn get_limit(&self, resource: &str, account: &str) -> Result<(u64, f64)>;

    /// Try to take one token from the bucket.
    ///
    /// Returns `Ok(true)` if a token was consumed and `Ok(false)` if the
    /// bucket was empty.
    async fn get_token(&self, resource: &str, account: &str) -> Result<bool>;

    /// Like [`get_token`](Self::get_token), but reports a denial as
    /// [`TollgateError::CapacityReached`].
    async fn acquire(&self, resource: &str, account: &str) -> Result<()> {
        if self.get_token(resource, account).await? {
            Ok(())
        } else {
            Err(TollgateError::CapacityReached)
        }
    }
}
