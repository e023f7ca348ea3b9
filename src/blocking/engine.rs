//! Blocking query engine.

use super::{BlockingStorageAdapter, BlockingVerifiableAdapter, Coalescer};
use crate::backend::VerificationReport;
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
use crate::staleness::{evaluate_blocking, Freshness};
use crate::tag::Tag;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

type ReportFn = Arc<dyn Fn(VerificationReport) -> Result<()> + Send + Sync>;

/// Thread-based [`crate::QueryEngine`].
///
/// Background work runs on named worker threads. Dropping the engine
/// leaves them running; [`QueryEngine::drain`] joins them.
///
/// ```
/// use tagged_cache::blocking::QueryEngine;
/// use tagged_cache::backend::InMemoryAdapter;
/// use tagged_cache::{QueryOptions, Tag};
///
/// let engine = QueryEngine::new(InMemoryAdapter::new()).unwrap();
/// let tags = [Tag::new(["user", "1"]).unwrap()];
/// let name: String = engine
///     .query("user:1", &tags, QueryOptions::new(), || Ok("Alice".to_string()))
///     .unwrap();
/// assert_eq!(name, "Alice");
/// engine.disconnect().unwrap();
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
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
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
            workers: Arc::clone(&self.workers),
            last_invalidation: Arc::clone(&self.last_invalidation),
            verifier: self.verifier.clone(),
        }
    }
}

impl<A: BlockingVerifiableAdapter + 'static> QueryEngine<A> {
    /// Blocking counterpart of [`crate::QueryEngine::with_verification`].
    pub fn with_verification(mut self) -> Self {
        let adapter = Arc::clone(&self.adapter);
        let report: ReportFn =
            Arc::new(move |report: VerificationReport| adapter.report_verification(report));
        self.verifier = Some(report);
        self
    }
}

impl<A: BlockingStorageAdapter + 'static> QueryEngine<A> {
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
            "✓ Blocking query engine initialized (prefix: {}, ttl: {}, grace: {:?}, verify: {})",
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
            workers: Arc::new(Mutex::new(Vec::new())),
            last_invalidation: Arc::new(AtomicI64::new(i64::MIN)),
            verifier: None,
        })
    }

    pub fn with_metrics(mut self, metrics: impl CacheMetrics + 'static) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }

    pub fn with_random_source(mut self, random: impl RandomSource + 'static) -> Self {
        let percent = self.sampler.percent();
        self.sampler = Arc::new(VerificationSampler::with_random(percent, random));
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Worker threads not yet joined.
    pub fn background_tasks(&self) -> usize {
        self.workers.lock().len()
    }

    fn full_key(&self, key: &str) -> String {
        CacheKeyBuilder::build_with_prefix(&self.prefix, &key)
    }

    /// Blocking counterpart of [`crate::QueryEngine::query`].
    ///
    /// # Errors
    /// The fetch error verbatim, adapter errors, malformed durations.
    pub fn query<T, F>(&self, key: &str, tags: &[Tag], options: QueryOptions, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let started = Instant::now();
        let (ttl, grace) = options.resolve(self.default_ttl, self.default_grace)?;
        let full_key = self.full_key(key);

        let entry = self.adapter.get(&full_key)?;
        let now = now_millis();
        let freshness = match &entry {
            Some(entry) => Some(evaluate_blocking(entry, now, &*self.adapter)?),
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
                    self.metrics.record_stale(&full_key, started.elapsed());
                    self.spawn_refresh(full_key, tags.to_vec(), ttl, grace, fetch);
                    return Ok(value);
                }
                Err(e) => warn!("⚠ Unreadable entry for {}, refetching: {}", full_key, e),
            },
            _ => {}
        }

        let outcome = self.coalescer.run(&full_key, || {
            let bytes = serialize_for_cache(&fetch()?)?;
            let entry = CacheEntry::new(bytes.clone(), tags.to_vec(), now_millis(), ttl, grace);
            self.adapter.set(&full_key, entry)?;
            self.metrics.record_set(&full_key, started.elapsed());
            Ok(bytes)
        });

        match outcome {
            Ok(bytes) => {
                self.metrics.record_miss(&full_key, started.elapsed());
                deserialize_from_cache(&bytes)
            }
            Err(e) => {
                self.metrics.record_error(&full_key, &e.to_string());
                Err(e)
            }
        }
    }

    fn spawn_refresh<T, F>(&self, full_key: String, tags: Vec<Tag>, ttl: i64, grace: Option<i64>, fetch: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        let key = full_key.clone();

        self.spawn_background("refresh", full_key, move || {
            let bytes = serialize_for_cache(&fetch()?)?;
            adapter.set(&key, CacheEntry::new(bytes, tags, now_millis(), ttl, grace))?;
            debug!("✓ Background refresh stored {}", key);
            Ok(())
        });
    }

    fn spawn_verification<T, F>(&self, full_key: String, cached: &T, fetch: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
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

        self.spawn_background("verification", full_key, move || {
            let fresh_hash = canonical_hash(&fetch()?)?;
            let is_stale = cached_hash != fresh_hash;
            if is_stale {
                warn!(
                    "⚠ Verification {} -> STALE (cached {}, fresh {})",
                    key, cached_hash, fresh_hash
                );
            }

            report(VerificationReport {
                key,
                is_stale,
                cached_hash,
                fresh_hash,
                checked_at: now_millis(),
            })
        });
    }

    fn spawn_background<F>(&self, label: &'static str, key: String, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut workers = self.workers.lock();
        let (finished, running): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(|handle| handle.is_finished());
        *workers = running;
        for handle in finished {
            if handle.join().is_err() {
                error!("✗ Background worker panicked");
            }
        }

        if workers.len() >= self.max_background_tasks {
            warn!(
                "⚠ Background {} for {} skipped: {} workers already running",
                label,
                key,
                workers.len()
            );
            return;
        }

        let metrics = Arc::clone(&self.metrics);
        let spawned = thread::Builder::new()
            .name(format!("tagged-cache-{}", label))
            .spawn(move || {
                if let Err(e) = task() {
                    warn!("✗ Background {} for {} failed: {}", label, key, e);
                    metrics.record_error(&key, &e.to_string());
                }
            });

        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                error!("✗ Failed to spawn background {} worker: {}", label, e);
                self.metrics.record_error(label, &e.to_string());
            }
        }
    }

    /// Join every background worker spawned so far.
    pub fn drain(&self) {
        loop {
            let workers = std::mem::take(&mut *self.workers.lock());
            if workers.is_empty() {
                return;
            }
            for handle in workers {
                if handle.join().is_err() {
                    error!("✗ Background worker panicked");
                }
            }
        }
    }

    /// # Errors
    /// Adapter errors.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.full_key(key);
        let Some(entry) = self.adapter.get(&full_key)? else {
            return Ok(None);
        };
        if evaluate_blocking(&entry, now_millis(), &*self.adapter)? != Freshness::Fresh {
            return Ok(None);
        }
        match deserialize_from_cache(&entry.value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("⚠ Unreadable entry for {}: {}", full_key, e);
                Ok(None)
            }
        }
    }

    /// # Errors
    /// Malformed durations, serialization and adapter errors.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tags: &[Tag],
        ttl: impl Into<DurationSpec>,
        grace: Option<DurationSpec>,
    ) -> Result<()> {
        let ttl = ttl.into().to_millis()?;
        let grace = match grace {
            Some(grace) => Some(grace.to_millis()?),
            None => self.default_grace,
        };
        let entry = CacheEntry::new(serialize_for_cache(value)?, tags.to_vec(), now_millis(), ttl, grace);
        self.adapter.set(&self.full_key(key), entry)
    }

    /// # Errors
    /// Adapter errors.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.adapter.delete(&self.full_key(key))
    }

    /// Same clock as the async engine: never moves backwards.
    fn invalidation_stamp(&self) -> i64 {
        let now = now_millis();
        self.last_invalidation.fetch_max(now, Ordering::SeqCst).max(now)
    }

    /// Blocking counterpart of [`crate::QueryEngine::invalidate`]; `exact`
    /// has no distinct effect.
    ///
    /// # Errors
    /// Adapter errors.
    pub fn invalidate(&self, tags: &[Tag], exact: bool) -> Result<()> {
        if exact {
            debug!("exact invalidation requested; treated as hierarchical");
        }
        let at = self.invalidation_stamp();
        for tag in tags {
            self.adapter.set_tag_invalidation_time(tag, at)?;
            self.metrics.record_invalidate(&tag.to_key());
        }
        debug!("✓ Invalidated {} tag(s) at {}", tags.len(), at);
        Ok(())
    }

    /// # Errors
    /// The action's error, or adapter errors from invalidation.
    pub fn mutate<R, F>(&self, action: F) -> Result<R>
    where
        F: FnOnce() -> Result<MutationResult<R>>,
    {
        let MutationResult {
            result,
            invalidates,
        } = action()?;
        self.invalidate(&invalidates, false)?;
        Ok(result)
    }

    /// # Errors
    /// Adapter errors.
    pub fn clear(&self) -> Result<()> {
        self.adapter.clear()
    }

    /// Join background workers, then disconnect the adapter.
    ///
    /// # Errors
    /// Adapter errors.
    pub fn disconnect(&self) -> Result<()> {
        self.drain();
        self.adapter.disconnect()?;
        info!("✓ Blocking query engine disconnected ({})", self.prefix);
        Ok(())
    }
}
