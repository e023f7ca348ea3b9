//! Tag shapes and concrete tag paths.
//!
//! Two separate constructs cover the two moments tags are needed:
//!
//! - [`TagPattern`] declares, once at registration time, the shape of the tag
//!   a query produces: literal segments plus wildcard slots filled from the
//!   query's arguments.
//! - [`TagPath`] builds a concrete [`Tag`] at call time, typically as an
//!   invalidation target.
//!
//! [`TagSchema`] is the explicit mapping table between the two: named
//! patterns that can be looked up for registration, or resolved into
//! concrete tags for invalidation.
//!
//! ```
//! use tagged_cache::schema::{TagPattern, TagSchema};
//!
//! let schema = TagSchema::new()
//!     .define("user", TagPattern::new("users").wild())
//!     .define("comment", TagPattern::new("posts").wild().literal("comments").wild());
//!
//! let tag = schema.path("comment", &["p1", "c9"]).unwrap();
//! assert_eq!(tag.to_key(), "posts:p1:comments:c9");
//!
//! // Fewer arguments give the enclosing tag, for broad invalidation.
//! let all_comments = schema.path("comment", &["p1"]).unwrap();
//! assert_eq!(all_comments.to_key(), "posts:p1:comments");
//! ```

use crate::error::{Error, Result};
use crate::tag::Tag;
use std::collections::BTreeMap;
use std::fmt;

/// One segment of a [`TagPattern`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatternSegment {
    /// Fixed text.
    Literal(String),
    /// Filled from the next query argument.
    Wild,
}

/// Registration-time tag shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagPattern {
    segments: Vec<PatternSegment>,
}

impl TagPattern {
    /// Start a pattern with a literal root segment.
    pub fn new(root: impl Into<String>) -> Self {
        TagPattern {
            segments: vec![PatternSegment::Literal(root.into())],
        }
    }

    /// Append a literal segment.
    pub fn literal(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(PatternSegment::Literal(segment.into()));
        self
    }

    /// Append a wildcard segment.
    pub fn wild(mut self) -> Self {
        self.segments.push(PatternSegment::Wild);
        self
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// Number of wildcard slots.
    pub fn wild_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, PatternSegment::Wild))
            .count()
    }

    /// Fill every wildcard from `args` (in order) and build the tag.
    ///
    /// Arguments beyond `wild_count()` are ignored, so several patterns of a
    /// query can share one argument list.
    ///
    /// # Errors
    /// `Error::ValidationError` when fewer than `wild_count()` args are given.
    pub fn build<S: AsRef<str>>(&self, args: &[S]) -> Result<Tag> {
        let wilds = self.wild_count();
        if args.len() < wilds {
            return Err(Error::ValidationError(format!(
                "Pattern {} needs {} argument(s), got {}",
                self,
                wilds,
                args.len()
            )));
        }
        self.fill(args)
    }

    /// Fill as many wildcards as `args` provides and stop before the first
    /// unfilled one, producing an ancestor of every fully built tag.
    ///
    /// # Errors
    /// `Error::ValidationError` when more args than wildcards are given, or
    /// when the pattern would resolve to no segments.
    pub fn prefix<S: AsRef<str>>(&self, args: &[S]) -> Result<Tag> {
        if args.len() > self.wild_count() {
            return Err(Error::ValidationError(format!(
                "Pattern {} takes at most {} argument(s), got {}",
                self,
                self.wild_count(),
                args.len()
            )));
        }
        self.fill(args)
    }

    fn fill<S: AsRef<str>>(&self, args: &[S]) -> Result<Tag> {
        let mut args = args.iter();
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                PatternSegment::Literal(text) => parts.push(text.clone()),
                PatternSegment::Wild => match args.next() {
                    Some(arg) => parts.push(arg.as_ref().to_string()),
                    None => break,
                },
            }
        }
        Tag::new(parts)
    }
}

impl fmt::Display for TagPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                PatternSegment::Literal(text) => text.as_str(),
                PatternSegment::Wild => "*",
            })
            .collect();
        write!(f, "{}", rendered.join("/"))
    }
}

/// Call-time builder for a concrete tag.
///
/// ```
/// use tagged_cache::schema::TagPath;
///
/// let tag = TagPath::new("posts").segment("p1").segment("comments").tag();
/// assert_eq!(tag.segments(), ["posts", "p1", "comments"]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagPath {
    segments: Vec<String>,
}

impl TagPath {
    pub fn new(root: impl Into<String>) -> Self {
        TagPath {
            segments: vec![root.into()],
        }
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Finish the path.
    pub fn tag(&self) -> Tag {
        self.clone().into()
    }
}

impl From<TagPath> for Tag {
    fn from(path: TagPath) -> Self {
        Tag::from_nonempty(path.segments)
    }
}

/// Named patterns: the mapping table from a tag name to its shape.
#[derive(Clone, Debug, Default)]
pub struct TagSchema {
    patterns: BTreeMap<String, TagPattern>,
}

impl TagSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a named pattern.
    pub fn define(mut self, name: impl Into<String>, pattern: TagPattern) -> Self {
        self.patterns.insert(name.into(), pattern);
        self
    }

    /// Look up a pattern for query registration.
    pub fn pattern(&self, name: &str) -> Option<&TagPattern> {
        self.patterns.get(name)
    }

    /// Names of all registered patterns.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    /// Resolve a named pattern into a concrete tag, filling as many
    /// wildcards as `args` provides (see [`TagPattern::prefix`]).
    ///
    /// # Errors
    /// `Error::ValidationError` for an unknown name or too many arguments.
    pub fn path<S: AsRef<str>>(&self, name: &str, args: &[S]) -> Result<Tag> {
        let pattern = self
            .pattern(name)
            .ok_or_else(|| Error::ValidationError(format!("Unknown tag name: {}", name)))?;
        pattern.prefix(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TagSchema {
        TagSchema::new()
            .define("users", TagPattern::new("users").wild())
            .define(
                "comments",
                TagPattern::new("posts").wild().literal("comments").wild(),
            )
            .define("settings", TagPattern::new("settings"))
    }

    #[test]
    fn test_wild_count() {
        let s = schema();
        assert_eq!(s.pattern("users").unwrap().wild_count(), 1);
        assert_eq!(s.pattern("comments").unwrap().wild_count(), 2);
        assert_eq!(s.pattern("settings").unwrap().wild_count(), 0);
    }

    #[test]
    fn test_build_fills_wilds() {
        let pattern = schema().pattern("comments").unwrap().clone();
        let tag = pattern.build(&["p1", "c2"]).unwrap();
        assert_eq!(tag.segments(), ["posts", "p1", "comments", "c2"]);
    }

    #[test]
    fn test_build_ignores_extra_args() {
        let pattern = TagPattern::new("users").wild();
        let tag = pattern.build(&["u1", "unused"]).unwrap();
        assert_eq!(tag.segments(), ["users", "u1"]);
    }

    #[test]
    fn test_build_requires_all_wilds() {
        let pattern = TagPattern::new("posts").wild().literal("comments").wild();
        assert!(matches!(
            pattern.build(&["p1"]),
            Err(Error::ValidationError(_))
        ));
    }

    #[test]
    fn test_path_prefix_resolution() {
        let s = schema();
        let none: [&str; 0] = [];
        assert_eq!(s.path("users", &none).unwrap().segments(), ["users"]);
        assert_eq!(s.path("users", &["7"]).unwrap().segments(), ["users", "7"]);
        assert_eq!(
            s.path("comments", &["p1"]).unwrap().segments(),
            ["posts", "p1", "comments"]
        );
        assert!(s.path("users", &["1", "2"]).is_err());
        assert!(s.path("missing", &["1"]).is_err());
    }

    #[test]
    fn test_prefix_is_ancestor_of_build() {
        let pattern = TagPattern::new("posts").wild().literal("comments").wild();
        let full = pattern.build(&["p1", "c1"]).unwrap();
        let broad = pattern.prefix(&["p1"]).unwrap();
        assert!(broad.is_ancestor_of(&full));
    }

    #[test]
    fn test_tag_path() {
        let tag: Tag = TagPath::new("user").segment("123").into();
        assert_eq!(tag.to_key(), "user:123");
    }

    #[test]
    fn test_pattern_display() {
        let pattern = TagPattern::new("posts").wild().literal("comments");
        assert_eq!(pattern.to_string(), "posts/*/comments");
    }
}
