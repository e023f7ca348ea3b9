//! Staleness evaluation.
//!
//! An entry is **expired** once its TTL has passed and **stale** once any of
//! its tags, or any ancestor of one of its tags, was invalidated at or after
//! the entry was created. The policy treats both the same way; they are kept
//! apart for logging and metrics.

use crate::backend::StorageAdapter;
use crate::blocking::BlockingStorageAdapter;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::tag::Tag;

/// Verdict for a stored entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Invalidated through one of its tags.
    Stale,
    /// TTL has passed.
    Expired,
}

impl Freshness {
    pub fn is_fresh(self) -> bool {
        self == Freshness::Fresh
    }
}

/// Evaluate `entry` at `now`, reading tag invalidation times from `adapter`.
///
/// Expiry is checked first; expired entries cost no adapter lookups. Otherwise
/// one lookup is made per ancestor of every tag, stopping at the first hit.
///
/// # Errors
/// Propagates adapter failures.
pub async fn evaluate<A>(entry: &CacheEntry, now: i64, adapter: &A) -> Result<Freshness>
where
    A: StorageAdapter + ?Sized,
{
    if entry.is_expired(now) {
        return Ok(Freshness::Expired);
    }

    for tag in &entry.tags {
        for ancestor in tag.ancestors() {
            let invalidated_at = adapter.get_tag_invalidation_time(&ancestor).await?;
            if is_invalidated(entry, &ancestor, invalidated_at) {
                return Ok(Freshness::Stale);
            }
        }
    }

    Ok(Freshness::Fresh)
}

/// Blocking counterpart of [`evaluate`].
///
/// # Errors
/// Propagates adapter failures.
pub fn evaluate_blocking<A>(entry: &CacheEntry, now: i64, adapter: &A) -> Result<Freshness>
where
    A: BlockingStorageAdapter + ?Sized,
{
    if entry.is_expired(now) {
        return Ok(Freshness::Expired);
    }

    for tag in &entry.tags {
        for ancestor in tag.ancestors() {
            let invalidated_at = adapter.get_tag_invalidation_time(&ancestor)?;
            if is_invalidated(entry, &ancestor, invalidated_at) {
                return Ok(Freshness::Stale);
            }
        }
    }

    Ok(Freshness::Fresh)
}

fn is_invalidated(entry: &CacheEntry, tag: &Tag, invalidated_at: Option<i64>) -> bool {
    match invalidated_at {
        Some(at) if at >= entry.created_at => {
            trace!(
                "Entry created at {} invalidated through {} at {}",
                entry.created_at,
                tag,
                at
            );
            true
        }
        _ => false,
    }
}

/// `grace_until` is set and has not passed.
pub fn within_grace(entry: &CacheEntry, now: i64) -> bool {
    entry.within_grace(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryAdapter;

    fn tag(parts: &[&str]) -> Tag {
        Tag::new(parts.iter().copied()).unwrap()
    }

    fn entry(tags: Vec<Tag>, created_at: i64) -> CacheEntry {
        CacheEntry::new(vec![], tags, created_at, 1_000, Some(500))
    }

    async fn invalidate(adapter: &InMemoryAdapter, t: &Tag, at: i64) {
        StorageAdapter::set_tag_invalidation_time(adapter, t, at)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_without_invalidations() {
        let adapter = InMemoryAdapter::new();
        let e = entry(vec![tag(&["user", "1"])], 100);
        assert_eq!(evaluate(&e, 200, &adapter).await.unwrap(), Freshness::Fresh);
    }

    #[tokio::test]
    async fn test_expired_after_ttl() {
        let adapter = InMemoryAdapter::new();
        let e = entry(vec![], 100);
        assert_eq!(evaluate(&e, 1_100, &adapter).await.unwrap(), Freshness::Fresh);
        assert_eq!(evaluate(&e, 1_101, &adapter).await.unwrap(), Freshness::Expired);
    }

    #[tokio::test]
    async fn test_ancestor_invalidation_marks_stale() {
        let adapter = InMemoryAdapter::new();
        invalidate(&adapter, &tag(&["user"]), 150).await;

        let profile = entry(vec![tag(&["user", "123"])], 100);
        let posts = entry(vec![tag(&["user", "123", "posts"])], 100);
        let other = entry(vec![tag(&["post", "1"])], 100);

        assert_eq!(evaluate(&profile, 200, &adapter).await.unwrap(), Freshness::Stale);
        assert_eq!(evaluate(&posts, 200, &adapter).await.unwrap(), Freshness::Stale);
        assert_eq!(evaluate(&other, 200, &adapter).await.unwrap(), Freshness::Fresh);
    }

    #[tokio::test]
    async fn test_descendant_invalidation_does_not_reach_parent() {
        let adapter = InMemoryAdapter::new();
        invalidate(&adapter, &tag(&["user", "123"]), 150).await;

        let all_users = entry(vec![tag(&["user"])], 100);
        assert_eq!(evaluate(&all_users, 200, &adapter).await.unwrap(), Freshness::Fresh);
    }

    #[tokio::test]
    async fn test_invalidation_before_creation_ignored() {
        let adapter = InMemoryAdapter::new();
        invalidate(&adapter, &tag(&["user"]), 99).await;

        let e = entry(vec![tag(&["user", "1"])], 100);
        assert_eq!(evaluate(&e, 200, &adapter).await.unwrap(), Freshness::Fresh);

        // Same instant counts as stale
        invalidate(&adapter, &tag(&["user"]), 100).await;
        assert_eq!(evaluate(&e, 200, &adapter).await.unwrap(), Freshness::Stale);
    }

    #[tokio::test]
    async fn test_any_tag_suffices() {
        let adapter = InMemoryAdapter::new();
        invalidate(&adapter, &tag(&["b"]), 150).await;

        let e = entry(vec![tag(&["a", "1"]), tag(&["b", "2"])], 100);
        assert_eq!(evaluate(&e, 200, &adapter).await.unwrap(), Freshness::Stale);
    }

    #[tokio::test]
    async fn test_expiry_checked_first() {
        let adapter = InMemoryAdapter::new();
        invalidate(&adapter, &tag(&["a"]), 150).await;

        let e = entry(vec![tag(&["a"])], 100);
        assert_eq!(evaluate(&e, 5_000, &adapter).await.unwrap(), Freshness::Expired);
    }

    #[test]
    fn test_blocking_matches_async() {
        let adapter = InMemoryAdapter::new();
        BlockingStorageAdapter::set_tag_invalidation_time(&adapter, &tag(&["user"]), 150).unwrap();

        let stale = entry(vec![tag(&["user", "9"])], 100);
        let fresh = entry(vec![tag(&["post", "9"])], 100);
        assert_eq!(evaluate_blocking(&stale, 200, &adapter).unwrap(), Freshness::Stale);
        assert_eq!(evaluate_blocking(&fresh, 200, &adapter).unwrap(), Freshness::Fresh);
        assert_eq!(evaluate_blocking(&fresh, 9_999, &adapter).unwrap(), Freshness::Expired);
    }

    #[test]
    fn test_within_grace() {
        let e = entry(vec![], 100);
        assert!(within_grace(&e, 1_500));
        assert!(within_grace(&e, 1_600));
        assert!(!within_grace(&e, 1_601));

        let no_grace = CacheEntry::new(vec![], vec![], 100, 1_000, None);
        assert!(!within_grace(&no_grace, 200));
    }
}
