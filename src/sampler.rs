//! Verification sampling.
//!
//! A configurable share of fresh hits re-runs the fetch in the background and
//! compares the result with what was cached. The comparison is made on short
//! SHA-256 digests of each value's canonical JSON form.

use crate::error::Result;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of the hex digests reported for verification.
pub const HASH_LEN: usize = 16;

/// Source of uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Seeded, reproducible draws.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        SeededRandom {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().random::<f64>()
    }
}

/// Decides which fresh hits get verified.
pub struct VerificationSampler {
    percent: f64,
    random: Box<dyn RandomSource>,
}

impl VerificationSampler {
    /// `percent` is a fraction in `[0, 1]`; range checks happen in
    /// [`EngineConfig::validate`](crate::config::EngineConfig::validate).
    pub fn new(percent: f64) -> Self {
        Self::with_random(percent, ThreadRandom)
    }

    pub fn with_random(percent: f64, random: impl RandomSource + 'static) -> Self {
        VerificationSampler {
            percent,
            random: Box::new(random),
        }
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    /// Whether this fresh hit should be verified.
    ///
    /// Never samples when verification is not enabled on the engine. No
    /// draw is made at the `0` and `1` extremes.
    pub fn should_verify(&self, enabled: bool) -> bool {
        if !enabled || self.percent <= 0.0 {
            return false;
        }
        if self.percent >= 1.0 {
            return true;
        }
        self.random.next_f64() < self.percent
    }
}

impl std::fmt::Debug for VerificationSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationSampler")
            .field("percent", &self.percent)
            .finish_non_exhaustive()
    }
}

/// First [`HASH_LEN`] hex chars of SHA-256 over `bytes`.
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

/// [`short_hash`] of `value` as canonical JSON.
///
/// The value goes through `serde_json::Value` first, so map keys come out
/// sorted and equal values hash the same whatever their in-memory order.
///
/// # Errors
/// `Error::SerializationError` if the value cannot be represented as JSON
/// (for example a map with non-string keys).
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok(short_hash(&bytes))
}
