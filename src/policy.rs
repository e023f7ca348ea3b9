//! What to do with a lookup result.
//!
//! Pure decision shared by the async and blocking engines.

use crate::entry::CacheEntry;
use crate::staleness::Freshness;

/// Next step for a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Return the cached value; may be sampled for verification.
    ServeFresh,
    /// Return the cached value and refresh it in the background.
    ServeStale,
    /// Fetch synchronously (through the coalescer) and store the result.
    Fetch,
}

/// Decide from the stored entry (if any) and its evaluated freshness.
///
/// Stale and expired entries are handled identically: served while inside
/// their grace window, refetched otherwise.
pub fn decide(entry: Option<&CacheEntry>, freshness: Option<Freshness>, now: i64) -> Decision {
    match (entry, freshness) {
        (Some(_), Some(Freshness::Fresh)) => Decision::ServeFresh,
        (Some(entry), Some(Freshness::Stale | Freshness::Expired)) if entry.within_grace(now) => {
            Decision::ServeStale
        }
        _ => Decision::Fetch,
    }
}
