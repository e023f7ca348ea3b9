//! Per-call options, registered queries and mutations.

use crate::backend::StorageAdapter;
use crate::duration::DurationSpec;
use crate::engine::QueryEngine;
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::schema::TagPattern;
use crate::tag::Tag;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;

/// Freshness policy for one call. Unset fields fall back to the engine
/// defaults.
///
/// ```
/// use tagged_cache::QueryOptions;
///
/// let options = QueryOptions::new().ttl("10s").grace("5m");
/// assert_eq!(options.resolve(30_000, None).unwrap(), (10_000, Some(300_000)));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub ttl: Option<DurationSpec>,
    /// A grace of zero disables stale serving even when the engine has a
    /// default grace.
    pub grace: Option<DurationSpec>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: impl Into<DurationSpec>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn grace(mut self, grace: impl Into<DurationSpec>) -> Self {
        self.grace = Some(grace.into());
        self
    }

    /// TTL and grace in milliseconds.
    ///
    /// # Errors
    /// `Error::ValidationError` for malformed durations.
    pub fn resolve(&self, default_ttl: i64, default_grace: Option<i64>) -> Result<(i64, Option<i64>)> {
        let ttl = match &self.ttl {
            Some(ttl) => ttl.to_millis()?,
            None => default_ttl,
        };
        let grace = match &self.grace {
            Some(grace) => Some(grace.to_millis()?),
            None => default_grace,
        };
        Ok((ttl, grace))
    }
}

/// Outcome of a mutation: its result plus the tags it made stale.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult<R> {
    pub result: R,
    pub invalidates: Vec<Tag>,
}

impl<R> MutationResult<R> {
    pub fn new(result: R, invalidates: impl IntoIterator<Item = Tag>) -> Self {
        MutationResult {
            result,
            invalidates: invalidates.into_iter().collect(),
        }
    }
}

/// A named query whose tags are derived from its arguments.
///
/// Registration checks that the widest tag pattern consumes exactly as many
/// arguments as the query takes. Each pattern is filled from the leading
/// arguments it needs, using their `Display` form. The cache key hashes the
/// arguments' JSON form, so `42u64` and `"42"` share tags but not a key.
///
/// ```
/// use tagged_cache::{CachedQuery, schema::TagPattern};
///
/// let comment = CachedQuery::new(
///     "get_comment",
///     2,
///     [
///         TagPattern::new("posts").wild(),
///         TagPattern::new("posts").wild().literal("comments").wild(),
///     ],
/// )
/// .unwrap();
///
/// let tags = comment.tags(&["p1", "c9"]).unwrap();
/// assert_eq!(tags[0].to_key(), "posts:p1");
/// assert_eq!(tags[1].to_key(), "posts:p1:comments:c9");
///
/// // Pattern/arity mismatch is rejected up front
/// assert!(CachedQuery::new("bad", 1, [TagPattern::new("a").wild().wild()]).is_err());
/// ```
#[derive(Clone, Debug)]
pub struct CachedQuery {
    name: String,
    arity: usize,
    patterns: Vec<TagPattern>,
    options: QueryOptions,
}

impl CachedQuery {
    /// # Errors
    /// `Error::ValidationError` when the largest wildcard count among
    /// `patterns` differs from `arity`.
    pub fn new(
        name: impl Into<String>,
        arity: usize,
        patterns: impl IntoIterator<Item = TagPattern>,
    ) -> Result<Self> {
        let name = name.into();
        let patterns: Vec<TagPattern> = patterns.into_iter().collect();
        let wilds = patterns.iter().map(TagPattern::wild_count).max().unwrap_or(0);

        if wilds != arity {
            return Err(Error::ValidationError(format!(
                "Query {}: tag patterns have {} wildcard(s) but the query takes {} argument(s)",
                name, wilds, arity
            )));
        }

        Ok(CachedQuery {
            name,
            arity,
            patterns,
            options: QueryOptions::default(),
        })
    }

    pub fn with_ttl(mut self, ttl: impl Into<DurationSpec>) -> Self {
        self.options.ttl = Some(ttl.into());
        self
    }

    pub fn with_grace(mut self, grace: impl Into<DurationSpec>) -> Self {
        self.options.grace = Some(grace.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    fn check_args<S>(&self, args: &[S]) -> Result<()> {
        if args.len() != self.arity {
            return Err(Error::ValidationError(format!(
                "Query {} takes {} argument(s), got {}",
                self.name,
                self.arity,
                args.len()
            )));
        }
        Ok(())
    }

    /// Concrete tags for one call.
    ///
    /// # Errors
    /// `Error::ValidationError` for a wrong argument count.
    pub fn tags<S: Display>(&self, args: &[S]) -> Result<Vec<Tag>> {
        self.check_args(args)?;
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.patterns.iter().map(|p| p.build(&args)).collect()
    }

    /// Cache key for one call: `"{name}:{hash(args)}"` (before the engine
    /// prefix is applied).
    ///
    /// # Errors
    /// `Error::ValidationError` for a wrong argument count, serialization
    /// errors from the arguments.
    pub fn key<S: Serialize>(&self, args: &[S]) -> Result<String> {
        self.check_args(args)?;
        CacheKeyBuilder::query_key(&self.name, args)
    }

    /// Run the query through `engine`.
    ///
    /// # Errors
    /// As [`QueryEngine::query`], plus `Error::ValidationError` for a wrong
    /// argument count.
    pub async fn call<A, S, T, F, Fut>(&self, engine: &QueryEngine<A>, args: &[S], fetch: F) -> Result<T>
    where
        A: StorageAdapter + 'static,
        S: Serialize + Display,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = self.key(args)?;
        let tags = self.tags(args)?;
        engine.query(&key, &tags, self.options.clone(), fetch).await
    }
}
