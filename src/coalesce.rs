//! Request coalescing (stampede protection).
//!
//! At most one fetch per key is in flight. The first caller for a key becomes
//! the leader and runs its fetch on its own task; callers arriving meanwhile
//! subscribe to a `watch` channel and receive a clone of the leader's outcome,
//! value or error.
//!
//! If the leader is cancelled before publishing, its registration is removed
//! and the waiters race to register again; one of them becomes the new leader
//! and runs its own fetch.

use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use tokio::sync::watch;

type Outcome<V> = Option<Result<V>>;

enum Role<V> {
    Leader,
    Waiter(watch::Receiver<Outcome<V>>),
}

/// In-flight registry keyed by cache key.
pub struct Coalescer<V> {
    inflight: DashMap<String, watch::Sender<Outcome<V>>>,
}

impl<V> Default for Coalescer<V> {
    fn default() -> Self {
        Coalescer {
            inflight: DashMap::new(),
        }
    }
}

impl<V: Clone + Send + Sync> Coalescer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Run `fetch` for `key` unless a fetch for `key` is already running, in
    /// which case wait for and return that fetch's outcome.
    ///
    /// `fetch` is called at most once, and only when this caller leads.
    ///
    /// # Errors
    /// Returns the leader's error verbatim.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut fetch = Some(fetch);

        loop {
            let role = match self.inflight.entry(key.to_string()) {
                Entry::Occupied(slot) => Role::Waiter(slot.get().subscribe()),
                Entry::Vacant(slot) => {
                    let (tx, _) = watch::channel(None);
                    slot.insert(tx);
                    Role::Leader
                }
            };

            match role {
                Role::Leader => {
                    let fetch = fetch.take().ok_or_else(|| {
                        Error::Other(format!("Fetch for {} already consumed", key))
                    })?;
                    let mut guard = InflightGuard {
                        inflight: &self.inflight,
                        key,
                        published: false,
                    };

                    debug!("✓ Coalesce {} -> LEADER", key);
                    let outcome = fetch().await;
                    guard.publish(outcome.clone());
                    return outcome;
                }
                Role::Waiter(mut rx) => {
                    debug!("✓ Coalesce {} -> WAIT", key);
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(current) => (*current).clone(),
                        Err(_) => None,
                    };

                    match outcome {
                        Some(outcome) => return outcome,
                        None => {
                            debug!("⚠ Coalesce {} -> leader gone, retrying", key);
                        }
                    }
                }
            }
        }
    }
}

/// Removes the registration when the leader finishes or is dropped mid-fetch.
struct InflightGuard<'a, V> {
    inflight: &'a DashMap<String, watch::Sender<Outcome<V>>>,
    key: &'a str,
    published: bool,
}

impl<V> InflightGuard<'_, V> {
    fn publish(&mut self, outcome: Result<V>) {
        self.published = true;
        if let Some((_, tx)) = self.inflight.remove(self.key) {
            tx.send_replace(Some(outcome));
        }
    }
}

impl<V> Drop for InflightGuard<'_, V> {
    fn drop(&mut self) {
        if !self.published {
            self.inflight.remove(self.key);
        }
    }
}
