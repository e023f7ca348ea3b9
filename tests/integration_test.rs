//! Integration tests for tagged-cache
//!
//! These tests drive the async engine end to end over the in-memory adapter.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagged_cache::backend::InMemoryAdapter;
use tagged_cache::observability::CountingMetrics;
use tagged_cache::{
    CachedQuery, EngineConfig, Error, MutationResult, QueryEngine, QueryOptions, Result, Tag,
    TagPattern,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct User {
    id: String,
    name: String,
}

fn tag(parts: &[&str]) -> Tag {
    Tag::new(parts.iter().copied()).unwrap()
}

fn engine() -> QueryEngine<InMemoryAdapter> {
    let _ = env_logger::builder().is_test(true).try_init();
    QueryEngine::new(InMemoryAdapter::new()).unwrap()
}

/// Same-millisecond writes and invalidations count as stale.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(2)).await;
}

/// Query `key` with a fetch that counts its calls and returns the new count.
async fn counted(
    engine: &QueryEngine<InMemoryAdapter>,
    key: &str,
    tags: &[Tag],
    calls: &Arc<AtomicUsize>,
) -> Result<usize> {
    let calls = Arc::clone(calls);
    engine
        .query(key, tags, QueryOptions::new().ttl("10s"), move || async move {
            Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
        })
        .await
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));

    let queries = (0..10).map(|_| {
        let calls = Arc::clone(&calls);
        engine.query(
            "user:1",
            &[],
            QueryOptions::new().ttl("10s"),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(User {
                    id: "1".to_string(),
                    name: "Alice".to_string(),
                })
            },
        )
    });

    let results: Vec<Result<User>> = join_all(queries).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap().name, "Alice");
    }
}

#[tokio::test]
async fn test_concurrent_failure_shared() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));

    let queries = (0..5).map(|_| {
        let calls = Arc::clone(&calls);
        engine.query("k", &[], QueryOptions::new(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<u32, _>(Error::fetch("database down"))
        })
    });

    for result in join_all(queries).await {
        assert_eq!(result, Err(Error::FetchError("database down".to_string())));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Failures are not cached
    let calls = Arc::new(AtomicUsize::new(0));
    assert_eq!(counted(&engine, "k", &[], &calls).await, Ok(1));
}

#[tokio::test]
async fn test_back_to_back_queries_hit() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));

    assert_eq!(counted(&engine, "k", &[], &calls).await, Ok(1));
    assert_eq!(counted(&engine, "k", &[], &calls).await, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Invalidation
// ============================================================================

#[tokio::test]
async fn test_prefix_invalidation() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));

    counted(&engine, "user:1", &[tag(&["users", "1"])], &calls).await.unwrap();
    counted(&engine, "user:2", &[tag(&["users", "2"])], &calls).await.unwrap();
    counted(&engine, "post:1", &[tag(&["posts", "1"])], &calls).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    tick().await;

    engine.invalidate(&[tag(&["users"])], false).await.unwrap();
    tick().await;

    assert_eq!(counted(&engine, "user:1", &[tag(&["users", "1"])], &calls).await, Ok(4));
    assert_eq!(counted(&engine, "user:2", &[tag(&["users", "2"])], &calls).await, Ok(5));
    assert_eq!(counted(&engine, "post:1", &[tag(&["posts", "1"])], &calls).await, Ok(3));
}

#[tokio::test]
async fn test_invalidation_isolation() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));

    counted(&engine, "one", &[tag(&["users", "1"])], &calls).await.unwrap();
    counted(&engine, "two", &[tag(&["users", "2"])], &calls).await.unwrap();
    counted(&engine, "all", &[tag(&["users"])], &calls).await.unwrap();
    counted(&engine, "similar", &[tag(&["users2"])], &calls).await.unwrap();
    tick().await;

    engine.invalidate(&[tag(&["users", "1"])], false).await.unwrap();
    tick().await;

    // Only the invalidated tag (and its descendants) go stale
    assert_eq!(counted(&engine, "one", &[tag(&["users", "1"])], &calls).await, Ok(5));
    assert_eq!(counted(&engine, "two", &[tag(&["users", "2"])], &calls).await, Ok(2));
    assert_eq!(counted(&engine, "all", &[tag(&["users"])], &calls).await, Ok(3));
    assert_eq!(counted(&engine, "similar", &[tag(&["users2"])], &calls).await, Ok(4));
}

#[tokio::test]
async fn test_any_matching_tag_invalidates() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    let tags = [tag(&["users", "1"]), tag(&["teams", "7"])];

    counted(&engine, "member", &tags, &calls).await.unwrap();
    tick().await;
    engine.invalidate(&[tag(&["teams"])], false).await.unwrap();
    tick().await;

    assert_eq!(counted(&engine, "member", &tags, &calls).await, Ok(2));
}

#[tokio::test]
async fn test_mutation_invalidates_reported_tags() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    let user_tags = [tag(&["users", "1"])];

    counted(&engine, "user:1", &user_tags, &calls).await.unwrap();
    tick().await;

    let renamed = engine
        .mutate(|| async { Ok(MutationResult::new("renamed", [tag(&["users", "1"])])) })
        .await
        .unwrap();
    assert_eq!(renamed, "renamed");
    tick().await;

    assert_eq!(counted(&engine, "user:1", &user_tags, &calls).await, Ok(2));
    assert_eq!(counted(&engine, "user:1", &user_tags, &calls).await, Ok(2));
}

// ============================================================================
// Expiry and grace
// ============================================================================

#[tokio::test]
async fn test_ttl_expiry_refetches() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    let short = QueryOptions::new().ttl(1);

    for expected in [1, 2] {
        let calls = Arc::clone(&calls);
        let value: usize = engine
            .query("k", &[], short.clone(), move || async move {
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .await
            .unwrap();
        assert_eq!(value, expected);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_grace_serves_stale_then_refreshes() {
    let engine = engine();
    let options = QueryOptions::new().ttl(1).grace("1s");
    let calls = Arc::new(AtomicUsize::new(0));

    let versioned = |calls: &Arc<AtomicUsize>| {
        let calls = Arc::clone(calls);
        move || async move { Ok(format!("v{}", calls.fetch_add(1, Ordering::SeqCst) + 1)) }
    };

    let first: String = engine
        .query("k", &[], options.clone(), versioned(&calls))
        .await
        .unwrap();
    assert_eq!(first, "v1");
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Expired but inside grace: old value now, refresh behind the scenes
    let stale: String = engine
        .query("k", &[], options.clone(), versioned(&calls))
        .await
        .unwrap();
    assert_eq!(stale, "v1");

    engine.drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let refreshed: String = engine
        .query("k", &[], options, versioned(&calls))
        .await
        .unwrap();
    assert_eq!(refreshed, "v2");
    engine.drain().await;
}

#[tokio::test]
async fn test_invalidated_entry_within_grace_served_stale() {
    let engine = engine();
    let options = QueryOptions::new().ttl("1m").grace("1m");
    let tags = [tag(&["posts", "1"])];

    let _: u32 = engine
        .query("post", &tags, options.clone(), || async { Ok(1) })
        .await
        .unwrap();
    tick().await;
    engine.invalidate(&[tag(&["posts"])], false).await.unwrap();
    tick().await;

    let stale: u32 = engine
        .query("post", &tags, options, || async { Ok(2) })
        .await
        .unwrap();
    assert_eq!(stale, 1);

    engine.drain().await;
    assert_eq!(engine.get::<u32>("post").await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_engine_default_grace() {
    let engine = QueryEngine::with_config(
        InMemoryAdapter::new(),
        EngineConfig::default().with_default_ttl(1).with_default_grace("1m"),
    )
    .unwrap();

    let _: u8 = engine
        .query("k", &[], QueryOptions::new(), || async { Ok(1) })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let stale: u8 = engine
        .query("k", &[], QueryOptions::new(), || async { Ok(2) })
        .await
        .unwrap();
    assert_eq!(stale, 1);
    engine.disconnect().await.unwrap();
}

// ============================================================================
// Raw operations
// ============================================================================

#[tokio::test]
async fn test_clear_forces_refetch() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));

    counted(&engine, "a", &[], &calls).await.unwrap();
    counted(&engine, "b", &[], &calls).await.unwrap();
    engine.clear().await.unwrap();

    assert_eq!(counted(&engine, "a", &[], &calls).await, Ok(3));
    assert_eq!(counted(&engine, "b", &[], &calls).await, Ok(4));
}

#[tokio::test]
async fn test_set_then_query_hits() {
    let engine = engine();
    let user = User {
        id: "9".to_string(),
        name: "Bob".to_string(),
    };
    engine
        .set("user:9", &user, &[tag(&["users", "9"])], "1m", None)
        .await
        .unwrap();

    let cached: User = engine
        .query("user:9", &[], QueryOptions::new(), || async {
            Err(Error::fetch("should not fetch"))
        })
        .await
        .unwrap();
    assert_eq!(cached, user);
}

#[tokio::test]
async fn test_metrics_counts() {
    let metrics = Arc::new(CountingMetrics::new());
    let engine = engine().with_metrics(Arc::clone(&metrics));
    let calls = Arc::new(AtomicUsize::new(0));

    counted(&engine, "k", &[tag(&["a"])], &calls).await.unwrap();
    counted(&engine, "k", &[tag(&["a"])], &calls).await.unwrap();
    engine.invalidate(&[tag(&["a"]), tag(&["b"])], false).await.unwrap();
    engine.delete("k").await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.misses, 1);
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.sets, 1);
    assert_eq!(snapshot.invalidations, 2);
    assert_eq!(snapshot.deletes, 1);
    assert_eq!(snapshot.errors, 0);
}

// ============================================================================
// Registered queries
// ============================================================================

#[tokio::test]
async fn test_cached_query_tags_and_keys() {
    let engine = engine();
    let get_comment = CachedQuery::new(
        "get_comment",
        2,
        [
            TagPattern::new("posts").wild(),
            TagPattern::new("posts").wild().literal("comments").wild(),
        ],
    )
    .unwrap()
    .with_ttl("1m");
    let calls = Arc::new(AtomicUsize::new(0));

    let call = |post: &'static str, comment: &'static str| {
        let calls = Arc::clone(&calls);
        let engine = engine.clone();
        let query = get_comment.clone();
        async move {
            query
                .call(&engine, &[post, comment], move || async move {
                    Ok(format!("{}/{}#{}", post, comment, calls.fetch_add(1, Ordering::SeqCst)))
                })
                .await
        }
    };

    assert_eq!(call("p1", "c1").await.unwrap(), "p1/c1#0");
    assert_eq!(call("p1", "c2").await.unwrap(), "p1/c2#1");
    assert_eq!(call("p2", "c1").await.unwrap(), "p2/c1#2");
    assert_eq!(call("p1", "c1").await.unwrap(), "p1/c1#0");
    tick().await;

    engine.invalidate(&[tag(&["posts", "p1"])], false).await.unwrap();
    tick().await;

    assert_eq!(call("p1", "c1").await.unwrap(), "p1/c1#3");
    assert_eq!(call("p2", "c1").await.unwrap(), "p2/c1#2");

    let wrong: Result<String> = get_comment
        .call(&engine, &["p1"], || async { Ok(String::new()) })
        .await;
    assert!(matches!(wrong, Err(Error::ValidationError(_))));
}

// ============================================================================
// Verification sampling
// ============================================================================

#[tokio::test]
async fn test_verification_reports_drift() {
    let adapter = InMemoryAdapter::new().with_verification_log();
    let engine = QueryEngine::with_config(
        adapter.clone(),
        EngineConfig::default().with_verify_percent(1.0),
    )
    .unwrap()
    .with_verification();
    let options = QueryOptions::new().ttl("1m");

    let _: u32 = engine
        .query("same", &[], options.clone(), || async { Ok(1) })
        .await
        .unwrap();
    let _: u32 = engine
        .query("same", &[], options.clone(), || async { Ok(1) })
        .await
        .unwrap();

    let _: u32 = engine
        .query("drift", &[], options.clone(), || async { Ok(1) })
        .await
        .unwrap();
    let served: u32 = engine
        .query("drift", &[], options, || async { Ok(2) })
        .await
        .unwrap();
    assert_eq!(served, 1);
    engine.drain().await;

    let mut reports = adapter.verification_reports();
    reports.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(reports.len(), 2);

    assert_eq!(reports[0].key, "cache:drift");
    assert!(reports[0].is_stale);
    assert_ne!(reports[0].cached_hash, reports[0].fresh_hash);

    assert_eq!(reports[1].key, "cache:same");
    assert!(!reports[1].is_stale);
    assert_eq!(reports[1].cached_hash.len(), 16);
}

#[tokio::test]
async fn test_verification_disabled_at_zero() {
    let adapter = InMemoryAdapter::new().with_verification_log();
    let engine = QueryEngine::with_config(
        adapter.clone(),
        EngineConfig::default().with_verify_percent(0.0),
    )
    .unwrap()
    .with_verification();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        counted(&engine, "k", &[], &calls).await.unwrap();
    }
    engine.drain().await;
    assert!(adapter.verification_reports().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
