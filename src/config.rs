//! Engine configuration.

use crate::duration::DurationSpec;
use crate::error::{Error, Result};
use serde::Deserialize;

/// Default time-to-live for entries stored without an explicit TTL.
pub const DEFAULT_TTL: &str = "30s";
/// Default share of fresh hits re-verified in the background.
pub const DEFAULT_VERIFY_PERCENT: f64 = 0.1;
/// Default bound on concurrently tracked background tasks.
pub const DEFAULT_MAX_BACKGROUND_TASKS: usize = 1024;
const DEFAULT_PREFIX: &str = "cache";

/// Configuration shared by the async and blocking engines.
///
/// Deserializable from any serde format; missing fields take their defaults.
///
/// ```
/// use tagged_cache::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_prefix("app")
///     .with_default_ttl("5m")
///     .with_default_grace("1h")
///     .with_verify_percent(0.0);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.default_ttl_ms().unwrap(), 300_000);
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prepended to every key as `"{prefix}:{key}"`.
    pub prefix: String,
    pub default_ttl: DurationSpec,
    pub default_grace: Option<DurationSpec>,
    /// Fraction in `[0, 1]`.
    pub verify_percent: f64,
    /// Background refreshes beyond this many running tasks are skipped.
    pub max_background_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            prefix: DEFAULT_PREFIX.to_string(),
            default_ttl: DurationSpec::from(DEFAULT_TTL),
            default_grace: None,
            verify_percent: DEFAULT_VERIFY_PERCENT,
            max_background_tasks: DEFAULT_MAX_BACKGROUND_TASKS,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by environment variables:
    /// - `TAGGED_CACHE_PREFIX`
    /// - `TAGGED_CACHE_DEFAULT_TTL`
    /// - `TAGGED_CACHE_DEFAULT_GRACE`
    /// - `TAGGED_CACHE_VERIFY_PERCENT`
    ///
    /// # Errors
    /// `Error::ConfigError` when `TAGGED_CACHE_VERIFY_PERCENT` is not a
    /// number. Durations are checked by [`EngineConfig::validate`].
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("TAGGED_CACHE_PREFIX") {
            config.prefix = prefix;
        }
        if let Ok(ttl) = std::env::var("TAGGED_CACHE_DEFAULT_TTL") {
            config.default_ttl = env_duration(ttl);
        }
        if let Ok(grace) = std::env::var("TAGGED_CACHE_DEFAULT_GRACE") {
            config.default_grace = Some(env_duration(grace));
        }
        if let Ok(percent) = std::env::var("TAGGED_CACHE_VERIFY_PERCENT") {
            config.verify_percent = percent.trim().parse().map_err(|_| {
                Error::ConfigError(format!(
                    "TAGGED_CACHE_VERIFY_PERCENT is not a number: {:?}",
                    percent
                ))
            })?;
        }

        Ok(config)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: impl Into<DurationSpec>) -> Self {
        self.default_ttl = ttl.into();
        self
    }

    pub fn with_default_grace(mut self, grace: impl Into<DurationSpec>) -> Self {
        self.default_grace = Some(grace.into());
        self
    }

    pub fn with_verify_percent(mut self, percent: f64) -> Self {
        self.verify_percent = percent;
        self
    }

    pub fn with_max_background_tasks(mut self, max: usize) -> Self {
        self.max_background_tasks = max;
        self
    }

    /// Check every field.
    ///
    /// # Errors
    /// `Error::ValidationError` for a `verify_percent` outside `[0, 1]` or a
    /// malformed duration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.verify_percent) {
            return Err(Error::ValidationError(format!(
                "verify_percent must be between 0 and 1, got {}",
                self.verify_percent
            )));
        }
        self.default_ttl_ms()?;
        self.default_grace_ms()?;
        Ok(())
    }

    pub fn default_ttl_ms(&self) -> Result<i64> {
        self.default_ttl.to_millis()
    }

    pub fn default_grace_ms(&self) -> Result<Option<i64>> {
        self.default_grace
            .as_ref()
            .map(DurationSpec::to_millis)
            .transpose()
    }
}

/// Plain digits are milliseconds, anything else goes through the parser.
fn env_duration(raw: String) -> DurationSpec {
    match raw.trim().parse::<i64>() {
        Ok(ms) => DurationSpec::Millis(ms),
        Err(_) => DurationSpec::Text(raw),
    }
}
