//! Cache key management utilities.

use crate::error::Result;
use crate::sampler::canonical_hash;
use serde::Serialize;

/// Builder for cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Build cache key with a prefix: `"{prefix}:{key}"`.
    pub fn build_with_prefix(prefix: &str, key: &dyn std::fmt::Display) -> String {
        format!("{}:{}", prefix, key)
    }

    /// Build composite key from multiple parts.
    pub fn build_composite(parts: &[&str]) -> String {
        parts.join(":")
    }

    /// Digest of a query's arguments.
    ///
    /// The arguments go through `serde_json::Value` first, so object keys
    /// are sorted and equal arguments always hash the same.
    ///
    /// # Errors
    /// `Error::SerializationError` if the arguments cannot be represented
    /// as JSON.
    pub fn hash_args<A: Serialize + ?Sized>(args: &A) -> Result<String> {
        canonical_hash(args)
    }

    /// Key of a named query call: `"{name}:{hash(args)}"`.
    ///
    /// ```
    /// use tagged_cache::key::CacheKeyBuilder;
    ///
    /// let a = CacheKeyBuilder::query_key("get_user", &("u1",)).unwrap();
    /// let b = CacheKeyBuilder::query_key("get_user", &("u1",)).unwrap();
    /// assert_eq!(a, b);
    /// assert!(a.starts_with("get_user:"));
    /// assert_eq!(a.len(), "get_user:".len() + 16);
    /// ```
    pub fn query_key<A: Serialize + ?Sized>(name: &str, args: &A) -> Result<String> {
        Ok(format!("{}:{}", name, Self::hash_args(args)?))
    }
}
