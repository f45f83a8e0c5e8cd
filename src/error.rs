//! Error types for tollgate operations.

use thiserror::Error;

use crate::table::TableError;

/// Main error type for tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The bucket held no token at decision time. This is a denial, not a fault.
    #[error("resource usage is at capacity")]
    CapacityReached,

    /// No limit has been stored for the (resource, account) pair.
    #[error("limit has not been set for {resource}.{account}")]
    NotConfigured { resource: String, account: String },

    /// A limit violates its constraints or could not be parsed from storage.
    #[error("limit configuration is invalid: {0}")]
    InvalidConfiguration(String),

    /// Redis errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Conditional table errors
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    pub(crate) fn not_configured(resource: &str, account: &str) -> Self {
        Self::NotConfigured {
            resource: resource.to_string(),
            account: account.to_string(),
        }
    }

    /// Whether the error came from the storage layer rather than from the
    /// limiter's own decision or configuration checks.
    pub fn is_storage_fault(&self) -> bool {
        match self {
            Self::Table(_) | Self::Io(_) => true,
            #[cfg(feature = "redis")]
            Self::Redis(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
