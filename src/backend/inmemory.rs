//! In-memory storage adapter (default, thread-safe).
//!
//! Uses DashMap for lock-free concurrent access with per-key sharding.
//! Entries past their grace window are dropped on access. With `max_items`
//! set, the least recently used entry is evicted once the limit is exceeded.

use super::{StorageAdapter, VerifiableAdapter, VerificationReport};
use crate::blocking::{BlockingStorageAdapter, BlockingVerifiableAdapter};
use crate::entry::{now_millis, CacheEntry};
use crate::error::Result;
use crate::tag::Tag;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Slot {
    entry: CacheEntry,
    touched: AtomicU64,
}

/// Thread-safe in-memory storage adapter.
///
/// Implements both [`StorageAdapter`] and [`BlockingStorageAdapter`]; clones
/// share the same store. `clear()` drops entries but keeps tag invalidation
/// timestamps, so an invalidation is never forgotten.
///
/// # Example
///
/// ```
/// use tagged_cache::backend::InMemoryAdapter;
/// use tagged_cache::QueryEngine;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> tagged_cache::Result<()> {
/// let adapter = InMemoryAdapter::new().with_max_items(10_000);
/// let engine = QueryEngine::new(adapter)?;
/// engine.set("greeting", &"hello", &[], "5m", None).await?;
/// assert_eq!(engine.get::<String>("greeting").await?, Some("hello".to_string()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryAdapter {
    store: Arc<DashMap<String, Slot>>,
    invalidations: Arc<DashMap<String, i64>>,
    tick: Arc<AtomicU64>,
    max_items: Option<usize>,
    verification_log: Option<Arc<Mutex<Vec<VerificationReport>>>>,
}

impl InMemoryAdapter {
    /// Create an unbounded adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of entries; the least recently used one is evicted
    /// on overflow. Zero means unbounded.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = (max_items > 0).then_some(max_items);
        self
    }

    /// Keep every verification report in memory (see
    /// [`InMemoryAdapter::verification_reports`]). Without it reports are
    /// only logged.
    pub fn with_verification_log(mut self) -> Self {
        self.verification_log = Some(Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Reports received so far, oldest first.
    pub fn verification_reports(&self) -> Vec<VerificationReport> {
        self.verification_log
            .as_ref()
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Memory statistics.
    pub fn stats(&self) -> AdapterStats {
        let now = now_millis();
        let total_bytes: usize = self.store.iter().map(|slot| slot.entry.value.len()).sum();
        let expired_count = self
            .store
            .iter()
            .filter(|slot| slot.entry.is_expired(now))
            .count();

        AdapterStats {
            total_entries: self.store.len(),
            expired_entries: expired_count,
            tag_invalidations: self.invalidations.len(),
            total_bytes,
        }
    }

    /// Print adapter statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Adapter Stats: {} entries ({} expired), {} tag invalidations, {} bytes",
            stats.total_entries, stats.expired_entries, stats.tag_invalidations, stats.total_bytes
        );
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = now_millis();
        if let Some(slot) = self.store.get(key) {
            if now <= slot.entry.usable_until() {
                slot.touched.store(self.next_tick(), Ordering::Relaxed);
                debug!("✓ InMemory GET {} -> HIT", key);
                return Some(slot.entry.clone());
            }
        }

        // Drop the entry if it outlived its grace window
        self.store
            .remove_if(key, |_, slot| now > slot.entry.usable_until());
        debug!("✓ InMemory GET {} -> MISS", key);
        None
    }

    fn set_entry(&self, key: &str, entry: CacheEntry) {
        let slot = Slot {
            entry,
            touched: AtomicU64::new(self.next_tick()),
        };
        self.store.insert(key.to_string(), slot);
        debug!("✓ InMemory SET {}", key);

        if let Some(max) = self.max_items {
            while self.store.len() > max {
                if !self.evict_one(key) {
                    break;
                }
            }
        }
    }

    /// Evict the least recently touched entry other than `keep`.
    fn evict_one(&self, keep: &str) -> bool {
        let victim = self
            .store
            .iter()
            .filter(|slot| slot.key() != keep)
            .min_by_key(|slot| slot.touched.load(Ordering::Relaxed))
            .map(|slot| slot.key().clone());

        match victim {
            Some(victim) => {
                self.store.remove(&victim);
                debug!("✓ InMemory EVICT {}", victim);
                true
            }
            None => false,
        }
    }

    fn delete_entry(&self, key: &str) {
        self.store.remove(key);
        debug!("✓ InMemory DELETE {}", key);
    }

    fn tag_time(&self, tag: &Tag) -> Option<i64> {
        self.invalidations.get(&tag.to_key()).map(|t| *t)
    }

    fn set_tag_time(&self, tag: &Tag, timestamp: i64) {
        self.invalidations.insert(tag.to_key(), timestamp);
        debug!("✓ InMemory INVALIDATE {} @ {}", tag, timestamp);
    }

    fn clear_entries(&self) {
        self.store.clear();
        warn!("⚠ InMemory CLEAR executed - all entries dropped!");
    }

    fn record_report(&self, report: VerificationReport) {
        debug!(
            "✓ InMemory VERIFY {} -> {}",
            report.key,
            if report.is_stale { "STALE" } else { "OK" }
        );
        if let Some(log) = &self.verification_log {
            log.lock().push(report);
        }
    }
}

impl StorageAdapter for InMemoryAdapter {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.get_entry(key))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.set_entry(key, entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_entry(key);
        Ok(())
    }

    async fn get_tag_invalidation_time(&self, tag: &Tag) -> Result<Option<i64>> {
        Ok(self.tag_time(tag))
    }

    async fn set_tag_invalidation_time(&self, tag: &Tag, timestamp: i64) -> Result<()> {
        self.set_tag_time(tag, timestamp);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.clear_entries();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

impl VerifiableAdapter for InMemoryAdapter {
    async fn report_verification(&self, report: VerificationReport) -> Result<()> {
        self.record_report(report);
        Ok(())
    }
}

impl BlockingStorageAdapter for InMemoryAdapter {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.get_entry(key))
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.set_entry(key, entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.delete_entry(key);
        Ok(())
    }

    fn get_tag_invalidation_time(&self, tag: &Tag) -> Result<Option<i64>> {
        Ok(self.tag_time(tag))
    }

    fn set_tag_invalidation_time(&self, tag: &Tag, timestamp: i64) -> Result<()> {
        self.set_tag_time(tag, timestamp);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.clear_entries();
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

impl BlockingVerifiableAdapter for InMemoryAdapter {
    fn report_verification(&self, report: VerificationReport) -> Result<()> {
        self.record_report(report);
        Ok(())
    }
}

/// Adapter statistics.
#[derive(Clone, Debug)]
pub struct AdapterStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub tag_invalidations: usize,
    pub total_bytes: usize,
}
