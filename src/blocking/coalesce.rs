//! Thread-based request coalescing.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

enum FlightState<V> {
    Running,
    Done(Result<V>),
    /// The leader panicked before producing an outcome.
    Abandoned,
}

struct Flight<V> {
    state: Mutex<FlightState<V>>,
    finished: Condvar,
}

/// In-flight registry for blocking callers.
///
/// The first thread to ask for a key runs the fetch; threads arriving while
/// it runs block on a condition variable and receive a clone of its outcome.
/// If the leader panics, waiters retry and one of them takes over.
pub struct Coalescer<V> {
    inflight: Mutex<HashMap<String, Arc<Flight<V>>>>,
}

impl<V> Default for Coalescer<V> {
    fn default() -> Self {
        Coalescer {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Coalescer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Blocking counterpart of [`crate::coalesce::Coalescer::run`].
    ///
    /// # Errors
    /// Returns the leader's error verbatim.
    pub fn run<F>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut fetch = Some(fetch);

        loop {
            let (flight, leader) = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(flight) => (Arc::clone(flight), false),
                    None => {
                        let flight = Arc::new(Flight {
                            state: Mutex::new(FlightState::Running),
                            finished: Condvar::new(),
                        });
                        inflight.insert(key.to_string(), Arc::clone(&flight));
                        (flight, true)
                    }
                }
            };

            if leader {
                let fetch = fetch
                    .take()
                    .ok_or_else(|| Error::Other(format!("Fetch for {} already consumed", key)))?;
                let mut guard = FlightGuard {
                    coalescer: self,
                    key,
                    flight: &flight,
                    finished: false,
                };

                debug!("✓ Coalesce {} -> LEADER", key);
                let outcome = fetch();
                guard.finish(outcome.clone());
                return outcome;
            }

            debug!("✓ Coalesce {} -> WAIT", key);
            let mut state = flight.state.lock();
            while matches!(*state, FlightState::Running) {
                flight.finished.wait(&mut state);
            }
            if let FlightState::Done(outcome) = &*state {
                return outcome.clone();
            }
            debug!("⚠ Coalesce {} -> leader gone, retrying", key);
        }
    }
}

struct FlightGuard<'a, V> {
    coalescer: &'a Coalescer<V>,
    key: &'a str,
    flight: &'a Flight<V>,
    finished: bool,
}

impl<V> FlightGuard<'_, V> {
    fn settle(&self, state: FlightState<V>) {
        self.coalescer.inflight.lock().remove(self.key);
        *self.flight.state.lock() = state;
        self.flight.finished.notify_all();
    }

    fn finish(&mut self, outcome: Result<V>) {
        self.finished = true;
        self.settle(FlightState::Done(outcome));
    }
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        if !self.finished {
            self.settle(FlightState::Abandoned);
        }
    }
}
