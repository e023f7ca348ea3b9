//! # tagged-cache
//!
//! A read-through query cache whose entries are addressed by hierarchical
//! tags.
//!
//! ## Features
//!
//! - **Hierarchical invalidation:** invalidating `["users"]` makes every entry
//!   tagged `["users", ..]` stale, without touching the entries themselves
//! - **Request coalescing:** concurrent misses on one key share a single fetch
//! - **Stale-while-revalidate:** expired entries inside their grace window are
//!   served immediately and refreshed in the background
//! - **Verification sampling:** a fraction of fresh hits is re-fetched in the
//!   background and compared against the cached value
//! - **Backend agnostic:** in-memory and Redis adapters, or your own
//!   [`StorageAdapter`](backend::StorageAdapter)
//! - **Async or blocking:** [`QueryEngine`] on tokio, [`blocking::QueryEngine`]
//!   on plain threads
//!
//! ## Quick Start
//!
//! ```
//! use tagged_cache::{QueryEngine, QueryOptions, MutationResult, Tag};
//! use tagged_cache::backend::InMemoryAdapter;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tagged_cache::Result<()> {
//! let engine = QueryEngine::new(InMemoryAdapter::new())?;
//! let user_tag = Tag::new(["users", "42"])?;
//!
//! // 1. Read through the cache
//! let name: String = engine
//!     .query("user:42", &[user_tag.clone()], QueryOptions::new().ttl("5m"), || async {
//!         Ok("Alice".to_string())
//!     })
//!     .await?;
//! assert_eq!(name, "Alice");
//!
//! // 2. Write, then invalidate everything under ["users"]
//! let users = Tag::new(["users"])?;
//! let renamed = engine
//!     .mutate(move || async move { Ok(MutationResult::new(true, [users])) })
//!     .await?;
//! assert!(renamed);
//!
//! engine.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Registered queries
//!
//! [`CachedQuery`] derives the key and tags of a call from its arguments:
//!
//! ```
//! use tagged_cache::{CachedQuery, schema::TagPattern};
//!
//! let get_post = CachedQuery::new("get_post", 1, [TagPattern::new("posts").wild()])
//!     .unwrap()
//!     .with_ttl("1m");
//! assert_eq!(get_post.tags(&["7"]).unwrap()[0].to_key(), "posts:7");
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod blocking;
pub mod coalesce;
pub mod config;
pub mod duration;
pub mod engine;
pub mod entry;
pub mod error;
pub mod key;
pub mod observability;
pub mod policy;
pub mod query;
pub mod sampler;
pub mod schema;
pub mod serialization;
pub mod staleness;
pub mod tag;

// Re-exports for convenience
pub use backend::{InMemoryAdapter, StorageAdapter, VerifiableAdapter, VerificationReport};
pub use config::EngineConfig;
pub use duration::{parse_duration, DurationSpec};
pub use engine::QueryEngine;
pub use entry::CacheEntry;
pub use error::{Error, Result};
pub use observability::CacheMetrics;
pub use query::{CachedQuery, MutationResult, QueryOptions};
pub use schema::{TagPattern, TagSchema};
pub use staleness::Freshness;
pub use tag::Tag;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
