//! Path addressing for JSON-shaped configuration values.
//!
//! A path is an ordered sequence of segments, each selecting either an object
//! key or an array index. Paths display as `$.projects.app[0].builder`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single selector in a [`JsonPath`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Object key access.
    Key(String),
    /// Array index access.
    Index(usize),
}

impl PathSegment {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(k) => Some(k),
            PathSegment::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Key(_) => None,
            PathSegment::Index(i) => Some(*i),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, ".{k}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        PathSegment::Key(s.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        PathSegment::Key(s)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

impl From<i32> for PathSegment {
    fn from(i: i32) -> Self {
        debug_assert!(i >= 0, "array index must not be negative");
        PathSegment::Index(usize::try_from(i).unwrap_or(0))
    }
}

/// An ordered sequence of property selectors into a JSON value.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JsonPath(Vec<PathSegment>);

impl JsonPath {
    /// The empty (root) path.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    /// Append a key segment (builder form).
    pub fn key(mut self, k: impl Into<String>) -> Self {
        self.0.push(PathSegment::Key(k.into()));
        self
    }

    /// Append an index segment (builder form).
    pub fn index(mut self, i: usize) -> Self {
        self.0.push(PathSegment::Index(i));
        self
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.0.pop()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&PathSegment> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.0.last()
    }

    /// The path without its last segment, or `None` at the root.
    pub fn parent(&self) -> Option<JsonPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(JsonPath(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn join(&self, other: &JsonPath) -> JsonPath {
        let mut joined = self.clone();
        joined.0.extend(other.0.iter().cloned());
        joined
    }

    pub fn with_segment(&self, segment: PathSegment) -> JsonPath {
        let mut child = self.clone();
        child.0.push(segment);
        child
    }

    /// True if all of this path's segments match the beginning of `other`.
    /// A path is a prefix of itself.
    pub fn is_prefix_of(&self, other: &JsonPath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// The remainder of `self` after stripping `prefix`, if it applies.
    pub fn strip_prefix(&self, prefix: &JsonPath) -> Option<JsonPath> {
        if prefix.is_prefix_of(self) {
            Some(JsonPath(self.0[prefix.len()..].to_vec()))
        } else {
            None
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathSegment> {
        self.0.iter()
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.0 {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromIterator<PathSegment> for JsonPath {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        JsonPath(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a JsonPath {
    type Item = &'a PathSegment;
    type IntoIter = std::slice::Iter<'a, PathSegment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Construct a [`JsonPath`] from literal segments.
///
/// String literals become key segments, integers become index segments.
#[macro_export]
macro_rules! json_path {
    () => {
        $crate::value::JsonPath::new()
    };
    ($($segment:expr),+ $(,)?) => {{
        let mut p = $crate::value::JsonPath::new();
        $(
            p.push($crate::value::PathSegment::from($segment));
        )+
        p
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        let path = JsonPath::new().key("projects").key("app").index(0);
        assert_eq!(path.to_string(), "$.projects.app[0]");
        assert_eq!(JsonPath::new().to_string(), "$");
    }

    #[test]
    #[should_panic(expected = "array index must not be negative")]
    fn negative_indices_are_rejected() {
        let _ = PathSegment::from(-1);
    }

    #[test]
    fn prefix_relationships() {
        let parent = json_path!("projects", "app");
        let child = json_path!("projects", "app", "targets", 1);
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
        assert!(parent.is_prefix_of(&parent));
        assert_eq!(
            child.strip_prefix(&parent),
            Some(json_path!("targets", 1usize))
        );
    }

    #[test]
    fn macro_mixes_keys_and_indices() {
        let path = json_path!("targets", 0usize, "builder");
        assert_eq!(path.len(), 3);
        assert_eq!(path.segments()[1], PathSegment::Index(0));
    }

    #[test]
    fn parent_of_root_is_none() {
        assert_eq!(JsonPath::new().parent(), None);
        let path = json_path!("a", "b");
        assert_eq!(path.parent(), Some(json_path!("a")));
    }
}
