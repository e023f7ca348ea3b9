//! Blocking execution style.
//!
//! Same semantics as the async engine: the fetch runs on the calling thread,
//! a mutex guards the in-flight registry, and background refreshes and
//! verifications run on detached worker threads.

use crate::backend::VerificationReport;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::tag::Tag;

pub mod coalesce;
pub mod engine;

pub use coalesce::Coalescer;
pub use engine::QueryEngine;

/// Blocking counterpart of [`StorageAdapter`](crate::backend::StorageAdapter).
///
/// Same contract, plain methods. Implementations must be safe to call from
/// several threads at once.
pub trait BlockingStorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn get_tag_invalidation_time(&self, tag: &Tag) -> Result<Option<i64>>;

    fn set_tag_invalidation_time(&self, tag: &Tag, timestamp: i64) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;
}

/// Blocking counterpart of
/// [`VerifiableAdapter`](crate::backend::VerifiableAdapter).
pub trait BlockingVerifiableAdapter: BlockingStorageAdapter {
    fn report_verification(&self, report: VerificationReport) -> Result<()>;
}
