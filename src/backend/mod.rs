//! Storage adapters.

use crate::entry::CacheEntry;
use crate::error::Result;
use crate::tag::Tag;
use std::future::Future;

pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::InMemoryAdapter;
#[cfg(feature = "redis")]
pub use redis::{PoolStats, RedisAdapter, RedisConfig};

/// Outcome of one background re-verification of a fresh hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationReport {
    pub key: String,
    /// The cached value no longer matches what the fetch returns.
    pub is_stale: bool,
    pub cached_hash: String,
    pub fresh_hash: String,
    /// Unix timestamp, ms.
    pub checked_at: i64,
}

/// Trait for storage adapter implementations.
///
/// An adapter persists [`CacheEntry`] values under string keys and one
/// invalidation timestamp per [`Tag`]. It is the only source of truth for
/// both; the engine keeps no copy.
///
/// **IMPORTANT:** All methods take `&self`. Adapters are shared between the
/// caller's task and background refresh tasks, so they must be safe for
/// concurrent use (DashMap, a connection pool, ...).
///
/// **ASYNC:** Methods return `Send` futures so the engine can run them on
/// spawned tasks. Implementations write plain `async fn`.
pub trait StorageAdapter: Send + Sync {
    /// Retrieve the entry stored at `key`.
    ///
    /// # Returns
    /// - `Ok(Some(entry))` - Entry found
    /// - `Ok(None)` - Miss
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry>>> + Send;

    /// Store `entry` at `key`, replacing any previous entry.
    ///
    /// Adapters may drop the entry once `entry.usable_until()` has passed.
    fn set(&self, key: &str, entry: CacheEntry) -> impl Future<Output = Result<()>> + Send;

    /// Remove the entry at `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Invalidation timestamp recorded for exactly this tag, if any.
    fn get_tag_invalidation_time(
        &self,
        tag: &Tag,
    ) -> impl Future<Output = Result<Option<i64>>> + Send;

    /// Record `timestamp` as the invalidation time of `tag`, overwriting any
    /// previous value.
    fn set_tag_invalidation_time(
        &self,
        tag: &Tag,
        timestamp: i64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove every cached entry. Whether tag timestamps survive is up to the
    /// adapter.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release connections. Calling it twice is fine.
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Adapters that can record verification outcomes.
///
/// Verification sampling is opt-in per engine and only available over
/// adapters implementing this trait (see
/// [`QueryEngine::with_verification`](crate::QueryEngine::with_verification)).
pub trait VerifiableAdapter: StorageAdapter {
    /// Record the outcome of one verification run.
    fn report_verification(
        &self,
        report: VerificationReport,
    ) -> impl Future<Output = Result<()>> + Send;
}
