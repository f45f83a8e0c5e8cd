//! Bucket key generation and handling.

/// Separator used when joining key parts for storage.
const KEY_SEPARATOR: &str = ".";

/// A key that uniquely identifies a token bucket.
///
/// Limits and bucket state are both addressed by the pair of resource name
/// and account ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The resource being protected
    pub resource: String,
    /// The account consuming the resource
    pub account: String,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(resource: &str, account: &str) -> Self {
        Self {
            resource: resource.to_string(),
            account: account.to_string(),
        }
    }

    /// Render a flat storage key with the given suffix, e.g.
    /// `api.acct-1.token`, optionally namespaced by `prefix`.
    pub fn storage_key(&self, prefix: Option<&str>, suffix: &str) -> String {
        let parts = [self.resource.as_str(), self.account.as_str(), suffix];
        let joined = parts.join(KEY_SEPARATOR);

        match prefix {
            Some(prefix) => format!("{}{}{}", prefix, KEY_SEPARATOR, joined),
            None => joined,
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.resource, KEY_SEPARATOR, self.account)
    }
}
