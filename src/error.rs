//! Error types for the query cache.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the query cache.
///
/// `Error` is `Clone` because one fetch outcome is handed to every caller
/// coalesced onto the same in-flight fetch: all of them observe the identical
/// error value.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Input rejected before any work was done.
    ///
    /// Raised when:
    /// - A duration string does not match `<digits><ms|s|m|h|d>`
    /// - A tag has no segments
    /// - A registered query's wildcard count does not match its arguments
    ValidationError(String),

    /// Engine configuration is invalid (e.g. `verify_percent` outside `[0, 1]`).
    ConfigError(String),

    /// The caller-supplied fetch operation failed.
    ///
    /// Propagated verbatim to the caller and to every coalesced waiter.
    /// Never retried by the engine.
    FetchError(String),

    /// Storage adapter error (Redis unavailable, network timeout, ...).
    ///
    /// **Recovery:** propagated on the synchronous path, swallowed and logged
    /// on background paths.
    BackendError(String),

    /// Serialization failed when encoding a value or entry for storage.
    SerializationError(String),

    /// Deserialization failed when decoding stored bytes.
    ///
    /// **Recovery:** the entry is treated as a miss and recomputed.
    DeserializationError(String),

    /// Stored bytes do not carry a valid envelope header.
    InvalidCacheEntry(String),

    /// Stored value was written under a different schema version.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from cached entry)
        found: u32,
    },

    /// Optional adapter capability not provided by this backend.
    NotImplemented(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Wrap any displayable caller error as a fetch failure.
    ///
    /// ```
    /// use tagged_cache::Error;
    ///
    /// let err = Error::fetch("connection refused");
    /// assert_eq!(err.to_string(), "Fetch error: connection refused");
    /// ```
    pub fn fetch(e: impl fmt::Display) -> Self {
        Error::FetchError(e.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::FetchError(msg) => write!(f, "Fetch error: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Cache version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ValidationError("Invalid duration: \"5x\"".to_string());
        assert_eq!(err.to_string(), "Validation error: Invalid duration: \"5x\"");
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_fetch_helper() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");
        let err = Error::fetch(io);
        assert_eq!(err, Error::FetchError("upstream timed out".to_string()));
    }

    #[test]
    fn test_clone_preserves_identity() {
        let err = Error::FetchError("boom".to_string());
        assert_eq!(err.clone(), err);
    }
}
