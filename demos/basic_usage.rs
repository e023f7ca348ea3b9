//! Basic usage of the tag-addressable query cache.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagged_cache::backend::InMemoryAdapter;
use tagged_cache::observability::CountingMetrics;
use tagged_cache::{
    CachedQuery, EngineConfig, MutationResult, QueryEngine, Result, Tag, TagPattern,
};

/// Example record: Employment
#[derive(Clone, Serialize, Deserialize, Debug)]
struct Employment {
    id: String,
    employer_name: String,
    salary: f64,
}

/// Mock repository that counts database round trips
#[derive(Clone, Default)]
struct EmploymentRepository {
    reads: Arc<AtomicUsize>,
}

impl EmploymentRepository {
    async fn fetch_by_id(&self, id: String) -> Result<Employment> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        println!("  [DB] Fetching employment: {}", id);
        tokio::time::sleep(Duration::from_millis(20)).await;

        Ok(Employment {
            employer_name: "Acme Corp".to_string(),
            salary: 75000.0,
            id,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let metrics = Arc::new(CountingMetrics::new());
    let engine = QueryEngine::with_config(
        InMemoryAdapter::new().with_max_items(1_000),
        EngineConfig::default().with_prefix("demo").with_default_grace("1m"),
    )?
    .with_metrics(Arc::clone(&metrics));
    let repo = EmploymentRepository::default();

    let get_employment = CachedQuery::new(
        "get_employment",
        1,
        [TagPattern::new("employments").wild()],
    )?
    .with_ttl("5m");

    println!("\n=== First call (miss) ===");
    let repo_a = repo.clone();
    let employment = get_employment
        .call(&engine, &["emp_001"], move || async move {
            repo_a.fetch_by_id("emp_001".to_string()).await
        })
        .await?;
    println!("  {:?}", employment);

    println!("\n=== Second call (hit) ===");
    let repo_b = repo.clone();
    let employment = get_employment
        .call(&engine, &["emp_001"], move || async move {
            repo_b.fetch_by_id("emp_001".to_string()).await
        })
        .await?;
    println!("  {:?}", employment);

    println!("\n=== Raise salary, invalidate ['employments'] ===");
    tokio::time::sleep(Duration::from_millis(2)).await;
    let everyone = Tag::new(["employments"])?;
    engine
        .mutate(move || async move { Ok(MutationResult::new((), [everyone])) })
        .await?;

    println!("\n=== Third call (stale served, refreshed in background) ===");
    let repo_c = repo.clone();
    let employment = get_employment
        .call(&engine, &["emp_001"], move || async move {
            repo_c.fetch_by_id("emp_001".to_string()).await
        })
        .await?;
    println!("  {:?}", employment);

    engine.disconnect().await?;

    println!("\n=== Summary ===");
    println!("  database reads: {}", repo.reads.load(Ordering::SeqCst));
    println!("  metrics: {:?}", metrics.snapshot());
    Ok(())
}
