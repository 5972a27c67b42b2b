//! Per-format file handles.
//!
//! A [`FileHandle`] knows how to read a physical document into the JSON value
//! model, how to write a full value back in the format's own idiom, and how
//! to apply a minimal change list onto the original serialized document so
//! that untouched formatting, comments and anchors survive.

pub mod json;
pub mod kdl;
pub mod yaml;

use async_trait::async_trait;
use std::ops::Range;

use crate::error::WorkspaceResult;
use crate::tracker::Change;
use crate::value::JsonValue;

/// Capability of a format-specific configuration file.
#[async_trait]
pub trait FileHandle: Send + Sync {
    /// Parse the document into the JSON value model. For formats with
    /// inheritance this is the materialized (flattened) view.
    async fn read(&self) -> WorkspaceResult<JsonValue>;

    /// Serialize `value` from scratch in the format's idiom and write it.
    async fn write(&self, value: &JsonValue) -> WorkspaceResult<()>;

    /// Apply a minimized change list onto the original document text,
    /// preserving everything the changes do not touch, and write the result.
    async fn apply_changes(&self, changes: &[Change]) -> WorkspaceResult<()>;
}

/// A single splice into a source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextEdit {
    pub range: Range<usize>,
    pub text: String,
}

impl TextEdit {
    pub(crate) fn replace(range: Range<usize>, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
        }
    }

    pub(crate) fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            range: at..at,
            text: text.into(),
        }
    }

    pub(crate) fn apply(self, source: &str) -> String {
        let mut out = String::with_capacity(source.len() + self.text.len());
        out.push_str(&source[..self.range.start]);
        out.push_str(&self.text);
        out.push_str(&source[self.range.end..]);
        out
    }
}

/// The indentation of the line containing byte offset `at`.
pub(crate) fn line_indent(source: &str, at: usize) -> String {
    let line_start = source[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
    source[line_start..]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_edit_splices() {
        let source = "hello world";
        assert_eq!(TextEdit::replace(6..11, "there").apply(source), "hello there");
        assert_eq!(TextEdit::insert(5, ",").apply(source), "hello, world");
    }

    #[test]
    fn line_indent_finds_leading_whitespace() {
        let source = "{\n    \"a\": 1\n}";
        let offset = source.find("\"a\"").unwrap();
        assert_eq!(line_indent(source, offset), "    ");
        assert_eq!(line_indent(source, 0), "");
    }
}
