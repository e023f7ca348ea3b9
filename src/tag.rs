//! Hierarchical tags.
//!
//! A [`Tag`] is an ordered, non-empty list of string segments such as
//! `["posts", "p1", "comments"]`. Shorter tags are ancestors of longer tags
//! that share their prefix, which is what makes invalidation hierarchical:
//! invalidating `["posts"]` reaches every entry tagged below it.
//!
//! Tags have a canonical string form for backends that need string keys.
//! Segments are joined with `:`; `\` and `:` inside a segment are escaped with
//! a backslash so that [`Tag::from_key`] always inverts [`Tag::to_key`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const DELIMITER: char = ':';
const ESCAPE: char = '\\';

/// Immutable hierarchical tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Tag {
    segments: Vec<String>,
}

impl Tag {
    /// Build a tag from its segments.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` when `segments` is empty.
    ///
    /// ```
    /// use tagged_cache::Tag;
    ///
    /// let tag = Tag::new(["user", "123"]).unwrap();
    /// assert_eq!(tag.len(), 2);
    /// assert!(Tag::new(Vec::<String>::new()).is_err());
    /// ```
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(Error::ValidationError(
                "Tag must have at least one segment".to_string(),
            ));
        }
        Ok(Tag { segments })
    }

    /// Callers guarantee at least one segment.
    pub(crate) fn from_nonempty(segments: Vec<String>) -> Self {
        debug_assert!(!segments.is_empty());
        Tag { segments }
    }

    /// Segments in order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (always at least one).
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `self` is a prefix of `other`. A tag is its own ancestor.
    pub fn is_ancestor_of(&self, other: &Tag) -> bool {
        self.len() <= other.len() && other.segments[..self.len()] == self.segments[..]
    }

    /// Every ancestor of this tag from the root down, ending with the tag itself.
    ///
    /// ```
    /// use tagged_cache::Tag;
    ///
    /// let tag = Tag::new(["posts", "p1", "comments"]).unwrap();
    /// let keys: Vec<String> = tag.ancestors().map(|t| t.to_key()).collect();
    /// assert_eq!(keys, ["posts", "posts:p1", "posts:p1:comments"]);
    /// ```
    pub fn ancestors(&self) -> impl Iterator<Item = Tag> + '_ {
        (1..=self.segments.len()).map(move |n| Tag {
            segments: self.segments[..n].to_vec(),
        })
    }

    /// Extend with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Tag {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Tag { segments }
    }

    /// Canonical, injective string form.
    pub fn to_key(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push(DELIMITER);
            }
            for c in segment.chars() {
                if c == DELIMITER || c == ESCAPE {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
        }
        out
    }

    /// Inverse of [`Tag::to_key`].
    ///
    /// A trailing lone backslash, or a backslash before any other character,
    /// is kept literally.
    pub fn from_key(key: &str) -> Tag {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = key.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                ESCAPE => match chars.peek() {
                    Some(&next) if next == DELIMITER || next == ESCAPE => {
                        current.push(next);
                        chars.next();
                    }
                    _ => current.push(c),
                },
                DELIMITER => segments.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }
        segments.push(current);

        Tag { segments }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

impl TryFrom<Vec<String>> for Tag {
    type Error = Error;

    fn try_from(segments: Vec<String>) -> Result<Self> {
        Tag::new(segments)
    }
}

impl From<Tag> for Vec<String> {
    fn from(tag: Tag) -> Self {
        tag.segments
    }
}
