//! Async query engine.
//!
//! Per query:
//! 1. Look the key up in the adapter.
//! 2. Evaluate the entry (fresh, stale, expired) and [`decide`].
//! 3. Serve fresh values directly, sampling some for background verification.
//! 4. Serve stale values inside their grace window and refresh in the
//!    background.
//! 5. Otherwise fetch through the [`Coalescer`], store, and return.
//!
//! Background work (refreshes, verifications) runs on spawned tokio tasks
//! whose handles are kept in a bounded list. Failures there are logged and
//! reported to [`CacheMetrics::record_error`], never to the caller.

use crate::backend::{StorageAdapter, VerifiableAdapter, VerificationReport};
use crate::coalesce::Coalescer;
use crate::config::EngineConfig;
use crate::duration::DurationSpec;
use crate::entry::{now_millis, CacheEntry};
use crate::error::Result;
use crate::key::CacheKeyBuilder;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::policy::{decide, Decision};
use crate::query::{MutationResult, QueryOptions};
use crate::sampler::{canonical_hash, RandomSource, VerificationSampler};
use crate::serialization::{deserialize_from_cache, serialize_for_cache};
use crate::staleness::{evaluate, Freshness};
use crate::tag::Tag;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

type ReportFn = Arc<dyn Fn(VerificationReport) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Tag-addressable query cache over a [`StorageAdapter`].
///
/// Cloning is cheap; clones share the adapter, the in-flight registry and
/// the background task list.
///
/// Background tasks are detached: dropping the last clone does not cancel
/// refreshes or verifications already running. Call
/// [`QueryEngine::drain`] to wait for them.
///
/// ```
/// use tagged_cache::{QueryEngine, QueryOptions, Tag};
/// use tagged_cache::backend::InMemoryAdapter;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> tagged_cache::Result<()> {
/// let engine = QueryEngine::new(InMemoryAdapter::new())?;
/// let tags = [Tag::new(["user", "1"])?];
///
/// let name: String = engine
///     .query("user:1", &tags, QueryOptions::new().ttl("10s"), || async {
///         Ok("Alice".to_string())
///     })
///     .await?;
/// assert_eq!(name, "Alice");
///
/// engine.invalidate(&[Tag::new(["user"])?], false).await?;
/// # Ok(())
/// # }
/// ```
pub struct QueryEngine<A> {
    adapter: Arc<A>,
    prefix: String,
    default_ttl: i64,
    default_grace: Option<i64>,
    max_background_tasks: usize,
    sampler: Arc<VerificationSampler>,
    metrics: Arc<dyn CacheMetrics>,
    coalescer: Arc<Coalescer<Vec<u8>>>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
    last_invalidation: Arc<AtomicI64>,
    verifier: Option<ReportFn>,
}

impl<A> Clone for QueryEngine<A> {
    fn clone(&self) -> Self {
        QueryEngine {
            adapter: Arc::clone(&self.adapter),
            prefix: self.prefix.clone(),
            default_ttl: self.default_ttl,
            default_grace: self.default_grace,
            max_background_tasks: self.max_background_tasks,
            sampler: Arc::clone(&self.sampler),
            metrics: Arc::clone(&self.metrics),
            coalescer: Arc::clone(&self.coalescer),
            background: Arc::clone(&self.background),
            last_invalidation: Arc::clone(&self.last_invalidation),
            verifier: self.verifier.clone(),
        }
    }
}

impl<A: VerifiableAdapter + 'static> QueryEngine<A> {
    /// Sample fresh hits for verification and send the outcomes to the
    /// adapter's [`VerifiableAdapter::report_verification`].
    ///
    /// The share of sampled hits is `verify_percent` from the config.
    pub fn with_verification(mut self) -> Self {
        let adapter = Arc::clone(&self.adapter);
        let report: ReportFn = Arc::new(
            move |report: VerificationReport| -> BoxFuture<'static, Result<()>> {
                let adapter = Arc::clone(&adapter);
                Box::pin(async move { adapter.report_verification(report).await })
            },
        );
        self.verifier = Some(report);
        self
    }
}

impl<A: StorageAdapter + 'static> QueryEngine<A> {
    /// Engine with [`EngineConfig::default`].
    ///
    /// # Errors
    /// See [`QueryEngine::with_config`].
    pub fn new(adapter: A) -> Result<Self> {
        Self::with_config(adapter, EngineConfig::default())
    }

    /// # Errors
    /// `Error::ValidationError` when the configuration does not validate.
    pub fn with_config(adapter: A, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let default_ttl = config.default_ttl_ms()?;
        let default_grace = config.default_grace_ms()?;

        info!(
            "✓ Query engine initialized (prefix: {}, ttl: {}, grace: {:?}, verify: {})",
            config.prefix, config.default_ttl, default_grace, config.verify_percent
        );

        Ok(QueryEngine {
            adapter: Arc::new(adapter),
            prefix: config.prefix,
            default_ttl,
            default_grace,
            max_background_tasks: config.max_background_tasks,
            sampler: Arc::new(VerificationSampler::new(config.verify_percent)),
            metrics: Arc::new(NoOpMetrics),
            coalescer: Arc::new(Coalescer::new()),
            background: Arc::new(Mutex::new(Vec::new())),
            last_invalidation: Arc::new(AtomicI64::new(i64::MIN)),
            verifier: None,
        })
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: impl CacheMetrics + 'static) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }

    /// Draw verification samples from `random` instead of the thread RNG.
    pub fn with_random_source(mut self, random: impl RandomSource + 'static) -> Self {
        let percent = self.sampler.percent();
        self.sampler = Arc::new(VerificationSampler::with_random(percent, random));
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of background tasks still running.
    pub fn background_tasks(&self) -> usize {
        self.background
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn full_key(&self, key: &str) -> String {
        CacheKeyBuilder::build_with_prefix(&self.prefix, &key)
    }

    /// Cached read-through query.
    ///
    /// `fetch` runs at most once per call: synchronously on a miss (shared
    /// with concurrent callers of the same key), or in the background to
    /// refresh a stale value or verify a fresh one.
    ///
    /// # Errors
    /// - The fetch error, verbatim, when this call (or the in-flight fetch it
    ///   joined) had to fetch
    /// - Adapter errors on the synchronous path
    /// - `Error::ValidationError` for malformed durations in `options`
    pub async fn query<T, F, Fut>(
        &self,
        key: &str,
        tags: &[Tag],
        options: QueryOptions,
        fetch: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let (ttl, grace) = options.resolve(self.default_ttl, self.default_grace)?;
        let full_key = self.full_key(key);

        let entry = self.adapter.get(&full_key).await?;
        let now = now_millis();
        let freshness = match &entry {
            Some(entry) => Some(evaluate(entry, now, &*self.adapter).await?),
            None => None,
        };

        match (decide(entry.as_ref(), freshness, now), entry) {
            (Decision::ServeFresh, Some(entry)) => match deserialize_from_cache::<T>(&entry.value) {
                Ok(value) => {
                    self.metrics.record_hit(&full_key, started.elapsed());
                    if self.sampler.should_verify(self.verifier.is_some()) {
                        self.spawn_verification(full_key, &value, fetch);
                    }
                    return Ok(value);
                }
                Err(e) => warn!("⚠ Unreadable entry for {}, refetching: {}", full_key, e),
            },
            (Decision::ServeStale, Some(entry)) => match deserialize_from_cache::<T>(&entry.value) {
                Ok(value) => {
                    debug!(
                        "✓ Serving {} entry for {} within grace",
                        freshness_label(freshness),
                        full_key
                    );
                    self.metrics.record_stale(&full_key, started.elapsed());
                    self.spawn_refresh(full_key, tags.to_vec(), ttl, grace, fetch);
                    return Ok(value);
                }
                Err(e) => warn!("⚠ Unreadable entry for {}, refetching: {}", full_key, e),
            },
            _ => {}
        }

        let value = self.fetch_and_store(&full_key, tags, ttl, grace, fetch).await?;
        self.metrics.record_miss(&full_key, started.elapsed());
        Ok(value)
    }

    async fn fetch_and_store<T, F, Fut>(
        &self,
        full_key: &str,
        tags: &[Tag],
        ttl: i64,
        grace: Option<i64>,
        fetch: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        let metrics = Arc::clone(&self.metrics);
        let store_key = full_key.to_string();
        let tags = tags.to_vec();

        let outcome = self
            .coalescer
            .run(full_key, move || async move {
                let bytes = serialize_for_cache(&fetch().await?)?;
                let started = Instant::now();
                let entry = CacheEntry::new(bytes.clone(), tags, now_millis(), ttl, grace);
                adapter.set(&store_key, entry).await?;
                metrics.record_set(&store_key, started.elapsed());
                Ok(bytes)
            })
            .await;

        match outcome {
            Ok(bytes) => deserialize_from_cache(&bytes),
            Err(e) => {
                debug!("✗ Fetch for {} failed: {}", full_key, e);
                self.metrics.record_error(full_key, &e.to_string());
                Err(e)
            }
        }
    }

    fn spawn_refresh<T, F, Fut>(
        &self,
        full_key: String,
        tags: Vec<Tag>,
        ttl: i64,
        grace: Option<i64>,
        fetch: F,
    ) where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        let metrics = Arc::clone(&self.metrics);
        let key = full_key.clone();

        self.spawn_background("refresh", full_key, async move {
            let bytes = serialize_for_cache(&fetch().await?)?;
            let started = Instant::now();
            adapter
                .set(&key, CacheEntry::new(bytes, tags, now_millis(), ttl, grace))
                .await?;
            metrics.record_set(&key, started.elapsed());
            debug!("✓ Background refresh stored {}", key);
            Ok(())
        });
    }

    fn spawn_verification<T, F, Fut>(&self, full_key: String, cached: &T, fetch: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Some(report) = self.verifier.clone() else {
            return;
        };
        let cached_hash = match canonical_hash(cached) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("⚠ Verification of {} skipped: {}", full_key, e);
                return;
            }
        };
        let key = full_key.clone();

        self.spawn_background("verification", full_key, async move {
            let fresh_hash = canonical_hash(&fetch().await?)?;
            let is_stale = cached_hash != fresh_hash;

            if is_stale {
                warn!(
                    "⚠ Verification {} -> STALE (cached {}, fresh {})",
                    key, cached_hash, fresh_hash
                );
            } else {
                debug!("✓ Verification {} -> OK", key);
            }

            report(VerificationReport {
                key,
                is_stale,
                cached_hash,
                fresh_hash,
                checked_at: now_millis(),
            })
            .await
        });
    }

    fn spawn_background<Fut>(&self, label: &'static str, key: String, task: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = self.background.lock();
        tasks.retain(|handle| !handle.is_finished());

        if tasks.len() >= self.max_background_tasks {
            warn!(
                "⚠ Background {} for {} skipped: {} tasks already running",
                label,
                key,
                tasks.len()
            );
            return;
        }

        let metrics = Arc::clone(&self.metrics);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!("✗ Background {} for {} failed: {}", label, key, e);
                metrics.record_error(&key, &e.to_string());
            }
        }));
    }

    /// Wait for every background task spawned so far (and any spawned while
    /// waiting).
    pub async fn drain(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.background.lock());
            if tasks.is_empty() {
                return;
            }
            for handle in tasks {
                if let Err(e) = handle.await {
                    error!("✗ Background task aborted: {}", e);
                }
            }
        }
    }

    /// Value at `key` if present, fresh and readable as `T`.
    ///
    /// Stale, expired and unreadable entries read as `None`; nothing is
    /// fetched.
    ///
    /// # Errors
    /// Adapter errors.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let started = Instant::now();
        let full_key = self.full_key(key);

        let Some(entry) = self.adapter.get(&full_key).await? else {
            self.metrics.record_miss(&full_key, started.elapsed());
            return Ok(None);
        };

        if evaluate(&entry, now_millis(), &*self.adapter).await? != Freshness::Fresh {
            self.metrics.record_miss(&full_key, started.elapsed());
            return Ok(None);
        }

        match deserialize_from_cache(&entry.value) {
            Ok(value) => {
                self.metrics.record_hit(&full_key, started.elapsed());
                Ok(Some(value))
            }
            Err(e) => {
                warn!("⚠ Unreadable entry for {}: {}", full_key, e);
                self.metrics.record_miss(&full_key, started.elapsed());
                Ok(None)
            }
        }
    }

    /// Store `value` at `key` directly.
    ///
    /// # Errors
    /// `Error::ValidationError` for malformed durations, serialization and
    /// adapter errors.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tags: &[Tag],
        ttl: impl Into<DurationSpec>,
        grace: Option<DurationSpec>,
    ) -> Result<()> {
        let started = Instant::now();
        let ttl = ttl.into().to_millis()?;
        let grace = match grace {
            Some(grace) => Some(grace.to_millis()?),
            None => self.default_grace,
        };
        let full_key = self.full_key(key);

        let entry = CacheEntry::new(serialize_for_cache(value)?, tags.to_vec(), now_millis(), ttl, grace);
        self.adapter.set(&full_key, entry).await?;
        self.metrics.record_set(&full_key, started.elapsed());
        Ok(())
    }

    /// # Errors
    /// Adapter errors.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let full_key = self.full_key(key);
        self.adapter.delete(&full_key).await?;
        self.metrics.record_delete(&full_key, started.elapsed());
        Ok(())
    }

    /// Current time, never earlier than a stamp handed out before.
    ///
    /// After the wall clock steps back, stamps stay at the highest value
    /// seen until the clock catches up. Entries written in that window are
    /// stale as soon as one of their tags is invalidated again.
    fn invalidation_stamp(&self) -> i64 {
        let now = now_millis();
        let previous = self.last_invalidation.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    /// Mark every entry carrying one of `tags`, or a descendant of one, as
    /// stale.
    ///
    /// `exact` is accepted for compatibility and has no distinct effect:
    /// invalidation is always hierarchical. Stamps never go backwards (see
    /// `invalidation_stamp`), so a later call always wins over an earlier one.
    ///
    /// # Errors
    /// Adapter errors; tags before the failing one stay invalidated.
    pub async fn invalidate(&self, tags: &[Tag], exact: bool) -> Result<()> {
        if exact {
            debug!("exact invalidation requested; treated as hierarchical");
        }

        let at = self.invalidation_stamp();
        for tag in tags {
            let key = tag.to_key();
            if let Err(e) = self.adapter.set_tag_invalidation_time(tag, at).await {
                self.metrics.record_error(&key, &e.to_string());
                return Err(e);
            }
            self.metrics.record_invalidate(&key);
        }

        debug!("✓ Invalidated {} tag(s) at {}", tags.len(), at);
        Ok(())
    }

    /// Run a side-effecting `action`, then invalidate the tags it reports.
    ///
    /// Nothing is invalidated when the action fails.
    ///
    /// # Errors
    /// The action's error, or adapter errors from invalidation.
    pub async fn mutate<R, F, Fut>(&self, action: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MutationResult<R>>>,
    {
        let MutationResult {
            result,
            invalidates,
        } = action().await?;
        self.invalidate(&invalidates, false).await?;
        Ok(result)
    }

    /// Drop every cached entry.
    ///
    /// # Errors
    /// Adapter errors.
    pub async fn clear(&self) -> Result<()> {
        self.adapter.clear().await?;
        info!("✓ Query engine cleared ({})", self.prefix);
        Ok(())
    }

    /// Drain background work, then disconnect the adapter.
    ///
    /// # Errors
    /// Adapter errors.
    pub async fn disconnect(&self) -> Result<()> {
        self.drain().await;
        self.adapter.disconnect().await?;
        info!("✓ Query engine disconnected ({})", self.prefix);
        Ok(())
    }
}

fn freshness_label(freshness: Option<Freshness>) -> &'static str {
    match freshness {
        Some(Freshness::Stale) => "stale",
        Some(Freshness::Expired) => "expired",
        _ => "fresh",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryAdapter;
    use crate::error::Error;
    use crate::observability::CountingMetrics;
    use crate::sampler::tests::FixedRandom;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine() -> QueryEngine<InMemoryAdapter> {
        QueryEngine::new(InMemoryAdapter::new()).unwrap()
    }

    fn tag(parts: &[&str]) -> Tag {
        Tag::new(parts.iter().copied()).unwrap()
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    async fn counted_query(
        engine: &QueryEngine<InMemoryAdapter>,
        calls: &Arc<AtomicUsize>,
        options: QueryOptions,
    ) -> Result<usize> {
        let calls = Arc::clone(calls);
        engine
            .query("k", &[tag(&["t"])], options, move || async move {
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .await
    }

    #[test]
    fn test_rejects_bad_config() {
        let config = EngineConfig::default().with_verify_percent(2.0);
        assert!(matches!(
            QueryEngine::with_config(InMemoryAdapter::new(), config),
            Err(Error::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let adapter = InMemoryAdapter::new();
        let engine = QueryEngine::with_config(
            adapter.clone(),
            EngineConfig::default().with_prefix("app"),
        )
        .unwrap();

        engine.set("user:1", &"x", &[], "1m", None).await.unwrap();
        assert!(StorageAdapter::get(&adapter, "app:user:1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let engine = engine();
        let calls = counter();
        let options = QueryOptions::new().ttl("10s");

        assert_eq!(counted_query(&engine, &calls, options.clone()).await, Ok(1));
        assert_eq!(counted_query(&engine, &calls, options).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_not_cached() {
        let engine = engine();

        let result: Result<u32> = engine
            .query("k", &[], QueryOptions::new(), || async { Err(Error::fetch("down")) })
            .await;
        assert_eq!(result, Err(Error::FetchError("down".to_string())));

        let value: u32 = engine
            .query("k", &[], QueryOptions::new(), || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_unreadable_entry_refetched() {
        let engine = engine();
        // A u64 whose varint reads as an impossible string length
        engine.set("k", &9_999u64, &[], "1m", None).await.unwrap();
        assert_eq!(engine.get::<String>("k").await.unwrap(), None);

        let value: String = engine
            .query("k", &[], QueryOptions::new(), || async { Ok("nine".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "nine");
        assert_eq!(engine.get::<String>("k").await.unwrap(), Some("nine".to_string()));
    }

    #[tokio::test]
    async fn test_get_only_returns_fresh() {
        let engine = engine();
        engine
            .set("k", &1u8, &[tag(&["a", "b"])], "1m", None)
            .await
            .unwrap();
        assert_eq!(engine.get::<u8>("k").await.unwrap(), Some(1));

        tokio::time::sleep(Duration::from_millis(2)).await;
        engine.invalidate(&[tag(&["a"])], false).await.unwrap();
        assert_eq!(engine.get::<u8>("k").await.unwrap(), None);
        assert_eq!(engine.get::<u8>("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let engine = engine();
        engine.set("k", &1u8, &[], "1m", None).await.unwrap();
        engine.delete("k").await.unwrap();
        assert_eq!(engine.get::<u8>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidation_clock_is_monotonic() {
        let engine = engine();
        engine.last_invalidation.store(i64::MAX - 1, Ordering::SeqCst);
        assert_eq!(engine.invalidation_stamp(), i64::MAX - 1);

        let fresh = super::QueryEngine::new(InMemoryAdapter::new()).unwrap();
        let a = fresh.invalidation_stamp();
        let b = fresh.invalidation_stamp();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_future_stamp_holds_until_clock_catches_up() {
        let engine = engine();
        let ahead = now_millis() + 60_000;
        engine.last_invalidation.store(ahead, Ordering::SeqCst);

        engine.invalidate(&[tag(&["a"])], false).await.unwrap();
        let stored = StorageAdapter::get_tag_invalidation_time(engine.adapter(), &tag(&["a"]))
            .await
            .unwrap();
        assert_eq!(stored, Some(ahead));

        // Written after the invalidation, still older than its stamp
        engine
            .set("k", &1u8, &[tag(&["a", "b"])], "1m", None)
            .await
            .unwrap();
        assert_eq!(engine.get::<u8>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_accepts_unsized_values() {
        let engine = engine();
        engine.set("greeting", "hello", &[], "1m", None).await.unwrap();
        engine
            .set("ids", &[1u32, 2, 3][..], &[], "1m", None)
            .await
            .unwrap();

        assert_eq!(
            engine.get::<String>("greeting").await.unwrap(),
            Some("hello".to_string())
        );
        assert_eq!(engine.get::<Vec<u32>>("ids").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_exact_flag_still_hierarchical() {
        let engine = engine();
        engine
            .set("k", &1u8, &[tag(&["user", "1"])], "1m", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        engine.invalidate(&[tag(&["user"])], true).await.unwrap();
        assert_eq!(engine.get::<u8>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mutation_failure_invalidates_nothing() {
        let adapter = InMemoryAdapter::new();
        let engine = QueryEngine::new(adapter.clone()).unwrap();

        let result: Result<()> = engine
            .mutate(|| async { Err(Error::fetch("write failed")) })
            .await;
        assert!(result.is_err());
        assert_eq!(adapter.stats().tag_invalidations, 0);

        let n = engine
            .mutate(|| async { Ok(MutationResult::new(1, [tag(&["user", "1"])])) })
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(adapter.stats().tag_invalidations, 1);
    }

    #[tokio::test]
    async fn test_background_limit_skips_refresh() {
        let engine = QueryEngine::with_config(
            InMemoryAdapter::new(),
            EngineConfig::default().with_max_background_tasks(0),
        )
        .unwrap();
        let calls = counter();
        let options = QueryOptions::new().ttl(1).grace("1m");

        assert_eq!(counted_query(&engine, &calls, options.clone()).await, Ok(1));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Stale value served, refresh skipped
        assert_eq!(counted_query(&engine, &calls, options).await, Ok(1));
        engine.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_failure_reported_to_metrics() {
        let metrics = Arc::new(CountingMetrics::new());
        let engine = engine().with_metrics(Arc::clone(&metrics));
        let options = QueryOptions::new().ttl(1).grace("1m");

        let first: u32 = engine
            .query("k", &[], options.clone(), || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(first, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stale: u32 = engine
            .query("k", &[], options, || async { Err(Error::fetch("refresh failed")) })
            .await
            .unwrap();
        assert_eq!(stale, 1);
        engine.drain().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stale, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(engine.background_tasks(), 0);
    }

    #[tokio::test]
    async fn test_refresh_survives_engine_drop() {
        let adapter = InMemoryAdapter::new();
        let engine = QueryEngine::new(adapter.clone()).unwrap();
        let options = QueryOptions::new().ttl(1).grace("1m");

        let first: u32 = engine
            .query("k", &[], options.clone(), || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(first, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stale: u32 = engine
            .query("k", &[], options, || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(stale, 1);
        drop(engine);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reader = QueryEngine::new(adapter).unwrap();
        assert_eq!(reader.get::<u32>("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_verification_ignores_map_order() {
        let adapter = InMemoryAdapter::new().with_verification_log();
        let engine = QueryEngine::with_config(
            adapter.clone(),
            EngineConfig::default().with_verify_percent(1.0),
        )
        .unwrap()
        .with_verification();

        let scores: HashMap<String, u32> = (0..32).map(|i| (format!("user{}", i), i)).collect();
        engine.set("scores", &scores, &[], "1m", None).await.unwrap();

        for _ in 0..5 {
            let value: HashMap<String, u32> = engine
                .query("scores", &[], QueryOptions::new().ttl("1m"), || async {
                    Ok((0..32).rev().map(|i| (format!("user{}", i), i)).collect())
                })
                .await
                .unwrap();
            assert_eq!(value.len(), 32);
        }
        engine.drain().await;

        let reports = adapter.verification_reports();
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|report| !report.is_stale));
    }

    #[tokio::test]
    async fn test_verification_sampling_draws() {
        let draws = counter();
        let adapter = InMemoryAdapter::new().with_verification_log();
        let engine = QueryEngine::with_config(
            adapter.clone(),
            EngineConfig::default().with_verify_percent(0.5),
        )
        .unwrap()
        .with_verification()
        .with_random_source(FixedRandom {
            value: 0.9,
            draws: Arc::clone(&draws),
        });

        let calls = counter();
        let options = QueryOptions::new().ttl("1m");
        counted_query(&engine, &calls, options.clone()).await.unwrap();
        counted_query(&engine, &calls, options).await.unwrap();
        engine.drain().await;

        // One fresh hit, one draw, above the threshold: nothing verified
        assert_eq!(draws.load(Ordering::SeqCst), 1);
        assert!(adapter.verification_reports().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_verification_skipped_unless_enabled() {
        let adapter = InMemoryAdapter::new().with_verification_log();
        let engine = QueryEngine::with_config(
            adapter.clone(),
            EngineConfig::default().with_verify_percent(1.0),
        )
        .unwrap();
        let calls = counter();
        let options = QueryOptions::new().ttl("1m");

        counted_query(&engine, &calls, options.clone()).await.unwrap();
        counted_query(&engine, &calls, options).await.unwrap();
        engine.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(adapter.verification_reports().is_empty());
    }
}
