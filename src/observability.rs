//! Metrics hooks for engine events.
//!
//! Implement [`CacheMetrics`] to feed your monitoring system:
//!
//! ```ignore
//! use tagged_cache::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str, _duration: Duration) {
//!         // counter!("cache_hits").inc();
//!     }
//!     // ... other hooks
//! }
//!
//! // let engine = QueryEngine::new(adapter)?.with_metrics(PrometheusMetrics);
//! ```
//!
//! Every hook has a default body that logs through the `log` crate, so
//! [`LogMetrics`] is just the trait with nothing overridden. The engine uses
//! [`NoOpMetrics`] unless told otherwise; swallowed background failures are
//! logged by the engine itself either way.
//!
//! | Hook | Fired when |
//! |------|------------|
//! | `record_hit` | fresh entry served |
//! | `record_stale` | stale or expired entry served inside its grace window |
//! | `record_miss` | value fetched synchronously |
//! | `record_set` | entry stored |
//! | `record_delete` | entry deleted |
//! | `record_invalidate` | tag invalidated |
//! | `record_error` | any failure, including swallowed background ones |

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for engine metrics collection.
pub trait CacheMetrics: Send + Sync {
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    fn record_stale(&self, key: &str, duration: Duration) {
        debug!("Cache STALE: {} took {:?}", key, duration);
    }

    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    fn record_invalidate(&self, tag: &str) {
        debug!("Cache INVALIDATE: {}", tag);
    }

    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_stale(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_invalidate(&self, _tag: &str) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Logs every event at debug level (errors at warn).
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}

/// In-process event counters.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    hits: AtomicU64,
    stale: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`CountingMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub stale: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub errors: u64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl CacheMetrics for CountingMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stale(&self, _key: &str, _duration: Duration) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self, _key: &str, _duration: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_set(&self, _key: &str, _duration: Duration) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delete(&self, _key: &str, _duration: Duration) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_invalidate(&self, _tag: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, key: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

impl<M: CacheMetrics + ?Sized> CacheMetrics for std::sync::Arc<M> {
    fn record_hit(&self, key: &str, duration: Duration) {
        (**self).record_hit(key, duration)
    }

    fn record_stale(&self, key: &str, duration: Duration) {
        (**self).record_stale(key, duration)
    }

    fn record_miss(&self, key: &str, duration: Duration) {
        (**self).record_miss(key, duration)
    }

    fn record_set(&self, key: &str, duration: Duration) {
        (**self).record_set(key, duration)
    }

    fn record_delete(&self, key: &str, duration: Duration) {
        (**self).record_delete(key, duration)
    }

    fn record_invalidate(&self, tag: &str) {
        (**self).record_invalidate(tag)
    }

    fn record_error(&self, key: &str, error: &str) {
        (**self).record_error(key, error)
    }
}
