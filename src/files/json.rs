//! JSON workspace files.
//!
//! Parsing is tolerant: comments (`//`, `/* */`) and trailing commas are
//! accepted, and parse problems are collected and joined into one
//! descriptive error instead of bailing at the first offender. The parser
//! records the byte span of every value so that change application rewrites
//! only the byte ranges implicated by each change; formatting of untouched
//! regions survives verbatim.

use async_trait::async_trait;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{line_indent, FileHandle, TextEdit};
use crate::error::{InvalidConfigurationError, WorkspaceError, WorkspaceResult};
use crate::host::WorkspaceHost;
use crate::tracker::Change;
use crate::value::{JsonObject, JsonPath, JsonValue, PathSegment};

/// Handle for a JSON configuration document.
pub struct JsonFileHandle {
    host: Arc<dyn WorkspaceHost>,
    path: PathBuf,
}

impl JsonFileHandle {
    pub fn new(host: Arc<dyn WorkspaceHost>, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }
}

#[async_trait]
impl FileHandle for JsonFileHandle {
    async fn read(&self) -> WorkspaceResult<JsonValue> {
        let text = self.host.read(&self.path).await?;
        let parsed = parse(&text).map_err(|e| e.with_file(&self.path))?;
        Ok(parsed.value)
    }

    async fn write(&self, value: &JsonValue) -> WorkspaceResult<()> {
        if !value.is_object() {
            return Err(WorkspaceError::invalid("Configuration must be an object"));
        }
        let mut text = serde_json::to_string_pretty(value)
            .map_err(|e| WorkspaceError::invalid(format!("failed to serialize JSON: {e}")))?;
        text.push('\n');
        self.host.write(&self.path, &text).await
    }

    async fn apply_changes(&self, changes: &[Change]) -> WorkspaceResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut text = self.host.read(&self.path).await?;
        for change in changes {
            debug!(path = %change.path(), kind = change.kind(), "applying change to {}", self.path.display());
            let parsed = parse(&text).map_err(|e| e.with_file(&self.path))?;
            let edit = edit_for_change(&text, &parsed.spans, change)?;
            text = edit.apply(&text);
        }
        self.host.write(&self.path, &text).await
    }
}

// ---------------------------------------------------------------------------
// Tolerant parsing with value spans
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ParsedJson {
    pub value: JsonValue,
    pub(crate) spans: SpannedValue,
}

#[derive(Debug)]
pub(crate) struct SpannedValue {
    pub range: Range<usize>,
    pub kind: SpanKind,
}

#[derive(Debug)]
pub(crate) enum SpanKind {
    Leaf,
    Array {
        /// Range between the brackets, exclusive.
        inner: Range<usize>,
        items: Vec<SpannedValue>,
    },
    Object {
        /// Range between the braces, exclusive.
        inner: Range<usize>,
        entries: Vec<ObjectEntry>,
    },
}

#[derive(Debug)]
pub(crate) struct ObjectEntry {
    pub key: String,
    /// From the opening quote of the key through the end of the value.
    pub range: Range<usize>,
    pub value: SpannedValue,
}

/// Parse `text`, collecting every problem encountered. The root must be an
/// object.
pub(crate) fn parse(text: &str) -> Result<ParsedJson, InvalidConfigurationError> {
    let mut scanner = Scanner {
        bytes: text.as_bytes(),
        pos: 0,
        errors: Vec::new(),
    };
    scanner.skip_trivia();
    let (value, spans) = scanner.parse_value();
    scanner.skip_trivia();
    if scanner.pos < scanner.bytes.len() {
        scanner.error("unexpected trailing characters");
    }
    if !scanner.errors.is_empty() {
        return Err(InvalidConfigurationError::new(scanner.errors.join("; ")));
    }
    if !value.is_object() {
        return Err(InvalidConfigurationError::new(
            "Configuration must be an object",
        ));
    }
    Ok(ParsedJson { value, spans })
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    errors: Vec<String>,
}

impl<'a> Scanner<'a> {
    fn error(&mut self, message: &str) {
        // Cap the list so a hopeless file doesn't produce a wall of noise.
        if self.errors.len() < 16 {
            self.errors.push(format!("{message} at offset {}", self.pos));
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Skip whitespace and comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.pos += 1;
                }
                Some(b'/') => match self.bytes.get(self.pos + 1) {
                    Some(b'/') => {
                        while let Some(b) = self.peek() {
                            if b == b'\n' {
                                break;
                            }
                            self.pos += 1;
                        }
                    }
                    Some(b'*') => {
                        self.pos += 2;
                        loop {
                            match self.peek() {
                                None => {
                                    self.error("unterminated block comment");
                                    break;
                                }
                                Some(b'*') if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                                    self.pos += 2;
                                    break;
                                }
                                _ => self.pos += 1,
                            }
                        }
                    }
                    _ => break,
                },
                _ => break,
            }
        }
    }

    fn parse_value(&mut self) -> (JsonValue, SpannedValue) {
        let start = self.pos;
        match self.peek() {
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => {
                let s = self.parse_string();
                (
                    JsonValue::String(s),
                    SpannedValue {
                        range: start..self.pos,
                        kind: SpanKind::Leaf,
                    },
                )
            }
            Some(b't') | Some(b'f') | Some(b'n') => {
                let value = self.parse_keyword();
                (
                    value,
                    SpannedValue {
                        range: start..self.pos,
                        kind: SpanKind::Leaf,
                    },
                )
            }
            Some(b) if b == b'-' || b.is_ascii_digit() => {
                let value = self.parse_number();
                (
                    value,
                    SpannedValue {
                        range: start..self.pos,
                        kind: SpanKind::Leaf,
                    },
                )
            }
            _ => {
                self.error("expected a JSON value");
                if self.pos < self.bytes.len() {
                    self.pos += 1;
                }
                (
                    JsonValue::Null,
                    SpannedValue {
                        range: start..self.pos,
                        kind: SpanKind::Leaf,
                    },
                )
            }
        }
    }

    fn parse_object(&mut self) -> (JsonValue, SpannedValue) {
        let start = self.pos;
        self.pos += 1; // '{'
        let inner_start = self.pos;
        let mut map = JsonObject::new();
        let mut entries = Vec::new();

        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    self.error("unterminated object");
                    break;
                }
                Some(b'}') => break,
                Some(b',') => {
                    // Stray or trailing comma; tolerated.
                    self.pos += 1;
                    continue;
                }
                Some(b'"') => {
                    let entry_start = self.pos;
                    let key = self.parse_string();
                    self.skip_trivia();
                    if self.peek() == Some(b':') {
                        self.pos += 1;
                    } else {
                        self.error("expected ':' after object key");
                    }
                    self.skip_trivia();
                    let (value, spanned) = self.parse_value();
                    let entry_range = entry_start..spanned.range.end;
                    if map.contains_key(&key) {
                        self.error("duplicate object key");
                    }
                    map.insert(key.clone(), value);
                    entries.push(ObjectEntry {
                        key,
                        range: entry_range,
                        value: spanned,
                    });
                }
                Some(_) => {
                    self.error("expected an object key");
                    self.pos += 1;
                }
            }
        }
        let inner_end = self.pos;
        if self.peek() == Some(b'}') {
            self.pos += 1;
        }
        (
            JsonValue::Object(map),
            SpannedValue {
                range: start..self.pos,
                kind: SpanKind::Object {
                    inner: inner_start..inner_end,
                    entries,
                },
            },
        )
    }

    fn parse_array(&mut self) -> (JsonValue, SpannedValue) {
        let start = self.pos;
        self.pos += 1; // '['
        let inner_start = self.pos;
        let mut values = Vec::new();
        let mut items = Vec::new();

        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    self.error("unterminated array");
                    break;
                }
                Some(b']') => break,
                Some(b',') => {
                    self.pos += 1;
                    continue;
                }
                Some(_) => {
                    let (value, spanned) = self.parse_value();
                    values.push(value);
                    items.push(spanned);
                }
            }
        }
        let inner_end = self.pos;
        if self.peek() == Some(b']') {
            self.pos += 1;
        }
        (
            JsonValue::Array(values),
            SpannedValue {
                range: start..self.pos,
                kind: SpanKind::Array {
                    inner: inner_start..inner_end,
                    items,
                },
            },
        )
    }

    fn parse_string(&mut self) -> String {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    self.error("unterminated string");
                    break;
                }
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'b') => out.push('\u{0008}'),
                    Some(b'f') => out.push('\u{000C}'),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'u') => {
                        let mut code = 0u32;
                        let mut ok = true;
                        for _ in 0..4 {
                            match self.bump().and_then(|b| (b as char).to_digit(16)) {
                                Some(d) => code = code * 16 + d,
                                None => {
                                    ok = false;
                                    break;
                                }
                            }
                        }
                        match (ok, char::from_u32(code)) {
                            (true, Some(c)) => out.push(c),
                            _ => self.error("invalid unicode escape"),
                        }
                    }
                    _ => self.error("invalid escape sequence"),
                },
                Some(b) => {
                    // Re-assemble UTF-8 sequences byte by byte.
                    if b < 0x80 {
                        out.push(b as char);
                    } else {
                        let len = utf8_len(b);
                        let start = self.pos - 1;
                        let end = (start + len).min(self.bytes.len());
                        if let Ok(s) = std::str::from_utf8(&self.bytes[start..end]) {
                            out.push_str(s);
                            self.pos = end;
                        } else {
                            self.error("invalid UTF-8 in string");
                        }
                    }
                }
            }
        }
        out
    }

    fn parse_keyword(&mut self) -> JsonValue {
        for (word, value) in [
            ("true", JsonValue::Bool(true)),
            ("false", JsonValue::Bool(false)),
            ("null", JsonValue::Null),
        ] {
            if self.bytes[self.pos..].starts_with(word.as_bytes()) {
                self.pos += word.len();
                return value;
            }
        }
        self.error("invalid literal");
        self.pos += 1;
        JsonValue::Null
    }

    fn parse_number(&mut self) -> JsonValue {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let raw = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        if let Ok(i) = raw.parse::<i64>() {
            return JsonValue::from(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return JsonValue::Number(n);
            }
        }
        self.error("invalid number");
        JsonValue::Null
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

// ---------------------------------------------------------------------------
// Change application
// ---------------------------------------------------------------------------

/// Compute the minimal text edit for one change against the current spans.
pub(crate) fn edit_for_change(
    text: &str,
    spans: &SpannedValue,
    change: &Change,
) -> WorkspaceResult<TextEdit> {
    let path = change.path();
    let Some(last) = path.last() else {
        // Whole-document replacement.
        let value = change.new_value().ok_or_else(|| {
            WorkspaceError::unsupported("cannot delete the document root")
        })?;
        return Ok(TextEdit::replace(
            spans.range.clone(),
            serialize(value),
        ));
    };
    let parent_path = path.parent().expect("non-empty path has a parent");
    let parent = locate(spans, &parent_path).ok_or_else(|| {
        WorkspaceError::consistency(path.clone(), "parent path not found in document")
    })?;

    match (&parent.kind, last, change) {
        (SpanKind::Object { inner, entries }, PathSegment::Key(key), change) => {
            let existing = entries.iter().position(|e| &e.key == key);
            match (change, existing) {
                (Change::Add { value, .. }, None) => {
                    Ok(insert_object_entry(text, inner, entries, key, value))
                }
                (Change::Add { .. }, Some(_)) => Err(WorkspaceError::consistency(
                    path.clone(),
                    "expected key to be absent for add",
                )),
                (Change::Modify { value, .. }, Some(i)) => Ok(TextEdit::replace(
                    entries[i].value.range.clone(),
                    serialize(value),
                )),
                (Change::Delete { .. }, Some(i)) => Ok(delete_object_entry(inner, entries, i)),
                (_, None) => Err(WorkspaceError::consistency(
                    path.clone(),
                    "expected to find path to modify",
                )),
            }
        }
        (SpanKind::Array { inner, items }, PathSegment::Index(index), change) => match change {
            Change::Add { value, .. } => {
                if *index > items.len() {
                    return Err(WorkspaceError::consistency(
                        path.clone(),
                        "array insertion index out of bounds",
                    ));
                }
                Ok(insert_array_item(text, inner, items, *index, value))
            }
            Change::Modify { value, .. } => {
                let item = items.get(*index).ok_or_else(|| {
                    WorkspaceError::consistency(path.clone(), "expected to find path to modify")
                })?;
                Ok(TextEdit::replace(item.range.clone(), serialize(value)))
            }
            Change::Delete { .. } => {
                if *index >= items.len() {
                    return Err(WorkspaceError::consistency(
                        path.clone(),
                        "expected to find path to delete",
                    ));
                }
                Ok(delete_array_item(inner, items, *index))
            }
        },
        _ => Err(WorkspaceError::consistency(
            path.clone(),
            "path selector does not match container shape",
        )),
    }
}

fn locate<'a>(spans: &'a SpannedValue, path: &JsonPath) -> Option<&'a SpannedValue> {
    let mut current = spans;
    for segment in path.segments() {
        current = match (&current.kind, segment) {
            (SpanKind::Object { entries, .. }, PathSegment::Key(key)) => {
                &entries.iter().find(|e| &e.key == key)?.value
            }
            (SpanKind::Array { items, .. }, PathSegment::Index(index)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

fn serialize(value: &JsonValue) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn is_multiline(text: &str, inner: &Range<usize>) -> bool {
    text[inner.clone()].contains('\n')
}

fn insert_object_entry(
    text: &str,
    inner: &Range<usize>,
    entries: &[ObjectEntry],
    key: &str,
    value: &JsonValue,
) -> TextEdit {
    let serialized_key = serde_json::to_string(key).unwrap_or_else(|_| format!("\"{key}\""));
    match entries.last() {
        None => TextEdit::replace(
            inner.clone(),
            format!("{serialized_key}: {}", serialize(value)),
        ),
        Some(last) => {
            if is_multiline(text, inner) {
                let indent = line_indent(text, last.range.start);
                TextEdit::insert(
                    last.range.end,
                    format!(",\n{indent}{serialized_key}: {}", serialize(value)),
                )
            } else {
                TextEdit::insert(
                    last.range.end,
                    format!(", {serialized_key}: {}", serialize(value)),
                )
            }
        }
    }
}

fn delete_object_entry(inner: &Range<usize>, entries: &[ObjectEntry], index: usize) -> TextEdit {
    let entry = &entries[index];
    if let Some(next) = entries.get(index + 1) {
        // Delete through to the start of the next entry.
        TextEdit::replace(entry.range.start..next.range.start, "")
    } else if index > 0 {
        // Last entry: delete from the end of the previous one (removes the
        // separating comma and whitespace).
        TextEdit::replace(entries[index - 1].range.end..entry.range.end, "")
    } else {
        // Only entry: empty the object.
        TextEdit::replace(inner.start..entry.range.end, "")
    }
}

fn insert_array_item(
    text: &str,
    inner: &Range<usize>,
    items: &[SpannedValue],
    index: usize,
    value: &JsonValue,
) -> TextEdit {
    if items.is_empty() {
        return TextEdit::replace(inner.clone(), serialize(value));
    }
    if index == items.len() {
        let last = items.last().expect("non-empty items");
        if is_multiline(text, inner) {
            let indent = line_indent(text, last.range.start);
            TextEdit::insert(last.range.end, format!(",\n{indent}{}", serialize(value)))
        } else {
            TextEdit::insert(last.range.end, format!(", {}", serialize(value)))
        }
    } else {
        let target = &items[index];
        if is_multiline(text, inner) {
            let indent = line_indent(text, target.range.start);
            TextEdit::insert(
                target.range.start,
                format!("{},\n{indent}", serialize(value)),
            )
        } else {
            TextEdit::insert(target.range.start, format!("{}, ", serialize(value)))
        }
    }
}

fn delete_array_item(inner: &Range<usize>, items: &[SpannedValue], index: usize) -> TextEdit {
    let item = &items[index];
    if let Some(next) = items.get(index + 1) {
        TextEdit::replace(item.range.start..next.range.start, "")
    } else if index > 0 {
        TextEdit::replace(items[index - 1].range.end..item.range.end, "")
    } else {
        TextEdit::replace(inner.start..item.range.end, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_path;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn apply(text: &str, change: Change) -> String {
        let parsed = parse(text).unwrap();
        edit_for_change(text, &parsed.spans, &change)
            .unwrap()
            .apply(text)
    }

    #[test]
    fn parses_comments_and_trailing_commas() {
        let text = r#"{
  // workspace version
  "version": 1,
  /* projects live here */
  "projects": {},
}"#;
        let parsed = parse(text).unwrap();
        assert_eq!(parsed.value, json!({"version": 1, "projects": {}}));
    }

    #[test]
    fn rejects_non_object_root() {
        let err = parse("[1, 2]").unwrap_err();
        assert_eq!(err.message, "Configuration must be an object");
    }

    #[test]
    fn joins_multiple_errors() {
        let err = parse("{\"a\" 1, \"a\": tru}").unwrap_err();
        assert!(err.message.contains("; "), "got: {}", err.message);
    }

    #[test]
    fn duplicate_keys_are_errors() {
        let err = parse(r#"{"a": 1, "a": 2}"#).unwrap_err();
        assert!(err.message.contains("duplicate object key"));
    }

    #[test]
    fn modify_preserves_surrounding_formatting() {
        let text = "{\n  \"a\": 1,   // keep me\n  \"b\": 2\n}";
        let out = apply(
            text,
            Change::Modify {
                path: json_path!("a"),
                value: json!(5),
                old_value: json!(1),
            },
        );
        assert_eq!(out, "{\n  \"a\": 5,   // keep me\n  \"b\": 2\n}");
    }

    #[test]
    fn add_to_multiline_object_matches_indent() {
        let text = "{\n  \"a\": 1\n}";
        let out = apply(
            text,
            Change::Add {
                path: json_path!("b"),
                value: json!({"c": true}),
            },
        );
        assert_eq!(out, "{\n  \"a\": 1,\n  \"b\": {\"c\":true}\n}");
    }

    #[test]
    fn delete_middle_and_last_entries() {
        let text = r#"{"a": 1, "b": 2, "c": 3}"#;
        let out = apply(
            text,
            Change::Delete {
                path: json_path!("b"),
                old_value: json!(2),
            },
        );
        assert_eq!(out, r#"{"a": 1, "c": 3}"#);

        let out = apply(
            &out,
            Change::Delete {
                path: json_path!("c"),
                old_value: json!(3),
            },
        );
        assert_eq!(out, r#"{"a": 1}"#);
    }

    #[test]
    fn array_insertion_semantics() {
        let text = r#"{"include": ["a", "c"]}"#;
        let out = apply(
            text,
            Change::Add {
                path: json_path!("include", 1),
                value: json!("b"),
            },
        );
        assert_eq!(out, r#"{"include": ["a", "b", "c"]}"#);
    }

    #[test]
    fn end_to_end_nx_scenario() {
        let text = r#"{"version":2,"projects":{"all":{"root":"","targets":{"build":{"executor":"@x:glob","options":{"include":"*"}}}}}}"#;
        let out = apply(
            text,
            Change::Modify {
                path: json_path!("projects", "all", "targets", "build", "options", "include"),
                value: json!(["*"]),
                old_value: json!("*"),
            },
        );
        assert_eq!(
            out,
            r#"{"version":2,"projects":{"all":{"root":"","targets":{"build":{"executor":"@x:glob","options":{"include":["*"]}}}}}}"#
        );
    }

    #[test]
    fn modify_missing_path_is_a_consistency_failure() {
        let text = r#"{"a": 1}"#;
        let parsed = parse(text).unwrap();
        let err = edit_for_change(
            text,
            &parsed.spans,
            &Change::Modify {
                path: json_path!("missing"),
                value: json!(1),
                old_value: json!(0),
            },
        )
        .unwrap_err();
        assert!(matches!(err, WorkspaceError::PatchConsistency { .. }));
    }
}
