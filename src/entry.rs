//! Stored cache entries.

use crate::tag::Tag;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A cached value with its freshness metadata.
///
/// `value` holds the envelope-encoded payload (see `crate::serialization`);
/// the engine decodes it into the caller's type on the way out. Adapters
/// treat it as opaque bytes.
///
/// Invariants: `expires_at >= created_at`, and `grace_until >= expires_at`
/// when present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub tags: Vec<Tag>,
    /// Unix timestamp, ms.
    pub created_at: i64,
    /// End of the TTL window.
    pub expires_at: i64,
    /// End of the grace window; `None` when no grace period applies.
    pub grace_until: Option<i64>,
}

impl CacheEntry {
    /// Build an entry created at `now`.
    ///
    /// Negative `ttl_ms` is treated as zero. A `grace_ms` that is absent, zero
    /// or negative yields no grace window.
    pub fn new(value: Vec<u8>, tags: Vec<Tag>, now: i64, ttl_ms: i64, grace_ms: Option<i64>) -> Self {
        let expires_at = now.saturating_add(ttl_ms.max(0));
        let grace_until = grace_ms
            .filter(|g| *g > 0)
            .map(|g| expires_at.saturating_add(g));

        CacheEntry {
            value,
            tags,
            created_at: now,
            expires_at,
            grace_until,
        }
    }

    /// TTL has passed.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Still usable as a stale fallback.
    pub fn within_grace(&self, now: i64) -> bool {
        self.grace_until.is_some_and(|until| now <= until)
    }

    /// Latest instant at which this entry is of any use; backends may drop it
    /// afterwards.
    pub fn usable_until(&self) -> i64 {
        self.grace_until.unwrap_or(self.expires_at)
    }
}
