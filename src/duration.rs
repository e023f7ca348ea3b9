//! Duration parsing.
//!
//! Freshness policies accept either raw milliseconds or a compact string of
//! the form `<digits><unit>` where unit is one of `ms`, `s`, `m`, `h`, `d`.
//!
//! ```
//! use tagged_cache::duration::parse_duration;
//!
//! assert_eq!(parse_duration("30s").unwrap(), 30_000);
//! assert_eq!(parse_duration(1500).unwrap(), 1500);
//! assert!(parse_duration("30 s").is_err());
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const UNITS: [(&str, i64); 5] = [
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
];

/// A duration as supplied by a caller: raw milliseconds or a unit string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    /// Milliseconds, passed through unchanged (no range check).
    Millis(i64),
    /// `"100ms"`, `"30s"`, `"5m"`, `"2h"`, `"1d"`.
    Text(String),
}

impl DurationSpec {
    /// Resolve to milliseconds.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for malformed text.
    pub fn to_millis(&self) -> Result<i64> {
        match self {
            DurationSpec::Millis(ms) => Ok(*ms),
            DurationSpec::Text(text) => parse_text(text),
        }
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationSpec::Millis(ms) => write!(f, "{}ms", ms),
            DurationSpec::Text(text) => write!(f, "{}", text),
        }
    }
}

impl From<i64> for DurationSpec {
    fn from(ms: i64) -> Self {
        DurationSpec::Millis(ms)
    }
}

impl From<i32> for DurationSpec {
    fn from(ms: i32) -> Self {
        DurationSpec::Millis(ms as i64)
    }
}

impl From<u32> for DurationSpec {
    fn from(ms: u32) -> Self {
        DurationSpec::Millis(ms as i64)
    }
}

impl From<&str> for DurationSpec {
    fn from(text: &str) -> Self {
        DurationSpec::Text(text.to_string())
    }
}

impl From<String> for DurationSpec {
    fn from(text: String) -> Self {
        DurationSpec::Text(text)
    }
}

impl From<std::time::Duration> for DurationSpec {
    fn from(d: std::time::Duration) -> Self {
        DurationSpec::Millis(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Parse a duration into milliseconds.
///
/// # Errors
/// Returns `Error::ValidationError` naming the input when a string does not
/// match `^\d+(ms|s|m|h|d)$` or overflows.
pub fn parse_duration(input: impl Into<DurationSpec>) -> Result<i64> {
    input.into().to_millis()
}

fn parse_text(text: &str) -> Result<i64> {
    let invalid = || Error::ValidationError(format!("Invalid duration: {:?}", text));

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (digits, unit) = text.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }

    let multiplier = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, m)| *m)
        .ok_or_else(invalid)?;

    let value: i64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("100ms").unwrap(), 100);
        assert_eq!(parse_duration("30s").unwrap(), 30_000);
        assert_eq!(parse_duration("5m").unwrap(), 300_000);
        assert_eq!(parse_duration("2h").unwrap(), 7_200_000);
        assert_eq!(parse_duration("1d").unwrap(), 86_400_000);
        assert_eq!(parse_duration("0s").unwrap(), 0);
    }

    #[test]
    fn test_numeric_passthrough() {
        assert_eq!(parse_duration(1000).unwrap(), 1000);
        assert_eq!(parse_duration(0).unwrap(), 0);
        assert_eq!(parse_duration(-250i64).unwrap(), -250);
    }

    #[test]
    fn test_std_duration() {
        let d = std::time::Duration::from_secs(2);
        assert_eq!(parse_duration(d).unwrap(), 2000);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["bogus", "", "10", "s", "ms", "10x", "10 s", " 10s", "10s ", "1.5s", "-5s", "10sec", "5M"] {
            match parse_duration(bad) {
                Err(Error::ValidationError(msg)) => assert!(msg.contains(&format!("{:?}", bad))),
                other => panic!("expected validation error for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_overflow_rejected() {
        assert!(parse_duration("99999999999999999999d").is_err());
        assert!(parse_duration("9223372036854775807d").is_err());
    }

    #[test]
    fn test_deserialize_untagged() {
        let text: DurationSpec = serde_json::from_str("\"5m\"").unwrap();
        let millis: DurationSpec = serde_json::from_str("250").unwrap();
        assert_eq!(text, DurationSpec::Text("5m".to_string()));
        assert_eq!(millis, DurationSpec::Millis(250));
    }
}
