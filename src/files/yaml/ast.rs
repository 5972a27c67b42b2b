//! Span-preserving YAML tree.
//!
//! yaml-rust2's event parser reports anchors and aliases by numeric id with a
//! source marker per event, but no end positions and no anchor names. This
//! module rebuilds a concrete tree on top of the event stream: every node
//! carries its byte span in the original text (computed from the following
//! event's marker and then trimmed), anchor names are recovered from the
//! source around the marker, and aliases keep the name they were written
//! with. The patcher edits the original text through these spans.

use std::collections::HashMap;
use std::ops::Range;

use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::{Marker, TScalarStyle};

use crate::error::InvalidConfigurationError;

/// Index path from the document root to a node (`entries[i].1` for maps,
/// `items[i]` for sequences, `entries[i].0` selects a map key).
pub(crate) type NodeIndexPath = Vec<usize>;

#[derive(Debug, Clone)]
pub(crate) struct YamlNode {
    pub span: Range<usize>,
    pub anchor: Option<String>,
    pub kind: YamlKind,
}

#[derive(Debug, Clone)]
pub(crate) enum YamlKind {
    Scalar {
        value: String,
        style: TScalarStyle,
    },
    Map {
        entries: Vec<(YamlNode, YamlNode)>,
        flow: bool,
    },
    Seq {
        items: Vec<YamlNode>,
        flow: bool,
    },
    Alias {
        name: String,
    },
}

impl YamlNode {
    pub fn scalar_value(&self) -> Option<&str> {
        match &self.kind {
            YamlKind::Scalar { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_merge_key(&self) -> bool {
        matches!(&self.kind, YamlKind::Scalar { value, style } if value == "<<" && *style == TScalarStyle::Plain)
    }

    /// Find a map entry by key scalar, returning its index.
    pub fn entry_index(&self, key: &str) -> Option<usize> {
        match &self.kind {
            YamlKind::Map { entries, .. } => entries
                .iter()
                .position(|(k, _)| k.scalar_value() == Some(key)),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct YamlTree {
    pub root: YamlNode,
    /// Anchor name -> index path of the anchored node.
    pub anchors: HashMap<String, NodeIndexPath>,
}

impl YamlTree {
    pub fn node_at(&self, path: &[usize]) -> Option<&YamlNode> {
        let mut current = &self.root;
        let mut i = 0;
        while i < path.len() {
            match &current.kind {
                YamlKind::Map { entries, .. } => {
                    let (key, value) = entries.get(path[i])?;
                    // A second index selects key (0) or value (1).
                    let side = *path.get(i + 1)?;
                    current = if side == 0 { key } else { value };
                    i += 2;
                }
                YamlKind::Seq { items, .. } => {
                    current = items.get(path[i])?;
                    i += 1;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn anchored(&self, name: &str) -> Option<&YamlNode> {
        self.node_at(self.anchors.get(name)?)
    }
}

/// Parse a YAML document into a span-preserving tree.
pub(crate) fn parse_tree(text: &str) -> Result<Option<YamlTree>, InvalidConfigurationError> {
    let mut receiver = TreeBuilder::new(text);
    let mut parser = Parser::new_from_str(text);
    parser
        .load(&mut receiver, false)
        .map_err(|e| InvalidConfigurationError::new(format!("YAML parse error: {e}")))?;
    receiver.finish()
}

/// Pending container during tree construction.
enum Frame {
    Map {
        start: usize,
        anchor: Option<String>,
        entries: Vec<(YamlNode, YamlNode)>,
        pending_key: Option<YamlNode>,
    },
    Seq {
        start: usize,
        anchor: Option<String>,
        items: Vec<YamlNode>,
    },
}

struct TreeBuilder<'a> {
    text: &'a str,
    /// Char-index -> byte-offset table; markers count characters.
    byte_of_char: Vec<usize>,
    stack: Vec<Frame>,
    root: Option<YamlNode>,
    /// Scalars have no end event; their spans are finalized from their own
    /// content instead. Collections are finalized on their End event.
    errors: Vec<String>,
}

impl<'a> TreeBuilder<'a> {
    fn new(text: &'a str) -> Self {
        let mut byte_of_char: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        byte_of_char.push(text.len());
        Self {
            text,
            byte_of_char,
            stack: Vec::new(),
            root: None,
            errors: Vec::new(),
        }
    }

    fn offset(&self, marker: Marker) -> usize {
        self.byte_of_char
            .get(marker.index())
            .copied()
            .unwrap_or(self.text.len())
    }

    /// Recover an anchor name written as `&name` just before `start`.
    fn anchor_before(&self, start: usize) -> Option<String> {
        let head = &self.text[..start];
        let trimmed = head.trim_end_matches(|c: char| c.is_whitespace());
        let ident_start = trimmed
            .rfind(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
            .map(|i| i + 1)
            .unwrap_or(0);
        if ident_start == 0 || ident_start == trimmed.len() {
            return None;
        }
        if trimmed.as_bytes()[ident_start - 1] == b'&' {
            Some(trimmed[ident_start..].to_string())
        } else {
            None
        }
    }

    /// The alias name written as `*name` at `start`.
    fn alias_at(&self, start: usize) -> Option<String> {
        let rest = &self.text[start..];
        let rest = rest.strip_prefix('*')?;
        let end = rest
            .find(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
            .unwrap_or(rest.len());
        (end > 0).then(|| rest[..end].to_string())
    }

    fn attach(&mut self, node: YamlNode) {
        match self.stack.last_mut() {
            None => self.root = Some(node),
            Some(Frame::Seq { items, .. }) => items.push(node),
            Some(Frame::Map {
                entries,
                pending_key,
                ..
            }) => match pending_key.take() {
                None => *pending_key = Some(node),
                Some(key) => entries.push((key, node)),
            },
        }
    }

    /// End offset of a scalar that starts at `start`.
    fn scalar_end(&self, start: usize, style: TScalarStyle) -> usize {
        let bytes = self.text.as_bytes();
        match style {
            TScalarStyle::SingleQuoted => {
                let mut i = start + 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        // '' is an escaped quote.
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 2;
                            continue;
                        }
                        return i + 1;
                    }
                    i += 1;
                }
                bytes.len()
            }
            TScalarStyle::DoubleQuoted => {
                let mut i = start + 1;
                while i < bytes.len() {
                    match bytes[i] {
                        b'\\' => i += 2,
                        b'"' => return i + 1,
                        _ => i += 1,
                    }
                }
                bytes.len()
            }
            TScalarStyle::Literal | TScalarStyle::Folded => self.block_scalar_end(start),
            _ => {
                // Plain scalars: run to end of line, a comment, or a flow
                // terminator, then trim trailing spaces.
                let in_flow = self
                    .stack
                    .iter()
                    .rev()
                    .any(|f| matches!(f, Frame::Map { start, .. } | Frame::Seq { start, .. } if bytes.get(*start) == Some(&b'{') || bytes.get(*start) == Some(&b'[')));
                let mut i = start;
                while i < bytes.len() {
                    let b = bytes[i];
                    if b == b'\n' {
                        break;
                    }
                    if b == b'#' && i > start && bytes[i - 1].is_ascii_whitespace() {
                        break;
                    }
                    if in_flow && matches!(b, b',' | b'}' | b']') {
                        break;
                    }
                    if matches!(b, b':')
                        && bytes.get(i + 1).map_or(true, |n| {
                            n.is_ascii_whitespace() || (in_flow && matches!(n, b',' | b'}' | b']'))
                        })
                    {
                        // This scalar is a key; it ends before the colon.
                        break;
                    }
                    i += 1;
                }
                while i > start && bytes[i - 1].is_ascii_whitespace() {
                    i -= 1;
                }
                i
            }
        }
    }

    /// Offset of the `|` or `>` indicator of a block scalar. The parser's
    /// marker may point at the indicator or at the first content line; in the
    /// latter case, walk back over whitespace and the chomping/indent
    /// modifiers to reach it.
    fn block_scalar_start(&self, at: usize) -> usize {
        let bytes = self.text.as_bytes();
        if matches!(bytes.get(at), Some(b'|') | Some(b'>')) {
            return at;
        }
        let mut i = at;
        while i > 0 && bytes[i - 1].is_ascii_whitespace() {
            i -= 1;
        }
        while i > 0 && matches!(bytes[i - 1], b'+' | b'-' | b'0'..=b'9') {
            i -= 1;
        }
        if i > 0 && matches!(bytes[i - 1], b'|' | b'>') {
            i - 1
        } else {
            at
        }
    }

    /// End offset of a block scalar whose span begins at `start`. The block
    /// runs through every following line indented deeper than the line
    /// carrying the indicator; blank lines inside the block do not end it.
    fn block_scalar_end(&self, start: usize) -> usize {
        let bytes = self.text.as_bytes();
        let line_start = self.text[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line_indent = bytes[line_start..start]
            .iter()
            .take_while(|b| **b == b' ')
            .count();
        // When `start` sits on the indicator line, content must be indented
        // past that line. When the indicator could not be recovered, `start`
        // is the first content line and the block keeps its own indent.
        let min_indent = if matches!(bytes.get(start), Some(b'|') | Some(b'>')) {
            line_indent + 1
        } else {
            line_indent
        };

        let mut i = start;
        while i < bytes.len() && bytes[i] != b'\n' {
            i += 1;
        }
        let mut end = i;
        while i < bytes.len() {
            let next_line = i + 1;
            let mut j = next_line;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            if j >= bytes.len() {
                break;
            }
            if bytes[j] == b'\n' {
                i = j;
                continue;
            }
            if j - next_line < min_indent {
                break;
            }
            while j < bytes.len() && bytes[j] != b'\n' {
                j += 1;
            }
            end = j;
            i = j;
        }
        end
    }

    fn finish(mut self) -> Result<Option<YamlTree>, InvalidConfigurationError> {
        if !self.errors.is_empty() {
            return Err(InvalidConfigurationError::new(self.errors.join("; ")));
        }
        let Some(root) = self.root.take() else {
            return Ok(None);
        };
        let mut anchors = HashMap::new();
        collect_anchors(&root, &mut Vec::new(), &mut anchors);
        Ok(Some(YamlTree { root, anchors }))
    }

    fn handle(&mut self, event: Event, marker: Marker) {
        let at = self.offset(marker);
        match event {
            Event::StreamStart
            | Event::StreamEnd
            | Event::DocumentStart
            | Event::DocumentEnd
            | Event::Nothing => {}
            Event::Scalar(value, style, anchor_id, _tag) => {
                let start = match style {
                    TScalarStyle::Literal | TScalarStyle::Folded => self.block_scalar_start(at),
                    _ => at,
                };
                let anchor = (anchor_id != 0)
                    .then(|| self.anchor_before(start))
                    .flatten();
                let end = self.scalar_end(start, style);
                self.attach(YamlNode {
                    span: start..end,
                    anchor,
                    kind: YamlKind::Scalar { value, style },
                });
            }
            Event::Alias(_id) => {
                match self.alias_at(at) {
                    Some(name) => {
                        let end = at + 1 + name.len();
                        self.attach(YamlNode {
                            span: at..end,
                            anchor: None,
                            kind: YamlKind::Alias { name },
                        });
                    }
                    None => self
                        .errors
                        .push(format!("could not read alias name at offset {at}")),
                }
            }
            Event::MappingStart(anchor_id, _tag) => {
                let anchor = (anchor_id != 0)
                    .then(|| self.anchor_before(at))
                    .flatten();
                self.stack.push(Frame::Map {
                    start: at,
                    anchor,
                    entries: Vec::new(),
                    pending_key: None,
                });
            }
            Event::SequenceStart(anchor_id, _tag) => {
                let anchor = (anchor_id != 0)
                    .then(|| self.anchor_before(at))
                    .flatten();
                self.stack.push(Frame::Seq {
                    start: at,
                    anchor,
                    items: Vec::new(),
                });
            }
            Event::MappingEnd => {
                let Some(Frame::Map {
                    start,
                    anchor,
                    entries,
                    ..
                }) = self.stack.pop()
                else {
                    self.errors.push("unbalanced mapping end".to_string());
                    return;
                };
                let flow = self.text.as_bytes().get(start) == Some(&b'{');
                // Block collections get no closing token; the end event's
                // marker points at the next construct. Clamp to the last
                // child instead.
                let end = if flow {
                    self.flow_close_end(at, b'}')
                } else {
                    entries.last().map(|(_, v)| v.span.end).unwrap_or(start)
                };
                self.attach(YamlNode {
                    span: start..end,
                    anchor,
                    kind: YamlKind::Map { entries, flow },
                });
            }
            Event::SequenceEnd => {
                let Some(Frame::Seq {
                    start,
                    anchor,
                    items,
                }) = self.stack.pop()
                else {
                    self.errors.push("unbalanced sequence end".to_string());
                    return;
                };
                let flow = self.text.as_bytes().get(start) == Some(&b'[');
                let end = if flow {
                    self.flow_close_end(at, b']')
                } else {
                    items.last().map(|n| n.span.end).unwrap_or(start)
                };
                self.attach(YamlNode {
                    span: start..end,
                    anchor,
                    kind: YamlKind::Seq { items, flow },
                });
            }
        }
    }


    /// End offset just past the closing bracket of a flow collection. The
    /// end event's marker may point at the bracket or just past it.
    fn flow_close_end(&self, at: usize, close: u8) -> usize {
        let bytes = self.text.as_bytes();
        if bytes.get(at) == Some(&close) {
            return at + 1;
        }
        let mut i = at;
        while i > 0 {
            if bytes[i - 1] == close {
                return i;
            }
            if !bytes[i - 1].is_ascii_whitespace() {
                break;
            }
            i -= 1;
        }
        let mut j = at;
        while j < bytes.len() {
            if bytes[j] == close {
                return j + 1;
            }
            j += 1;
        }
        at
    }
}

impl<'a> MarkedEventReceiver for TreeBuilder<'a> {
    fn on_event(&mut self, event: Event, marker: Marker) {
        self.handle(event, marker);
    }
}

fn collect_anchors(
    node: &YamlNode,
    path: &mut NodeIndexPath,
    anchors: &mut HashMap<String, NodeIndexPath>,
) {
    if let Some(name) = &node.anchor {
        anchors.entry(name.clone()).or_insert_with(|| path.clone());
    }
    match &node.kind {
        YamlKind::Map { entries, .. } => {
            for (i, (key, value)) in entries.iter().enumerate() {
                path.push(i);
                path.push(0);
                collect_anchors(key, path, anchors);
                path.pop();
                path.push(1);
                collect_anchors(value, path, anchors);
                path.pop();
                path.pop();
            }
        }
        YamlKind::Seq { items, .. } => {
            for (i, item) in items.iter().enumerate() {
                path.push(i);
                collect_anchors(item, path, anchors);
                path.pop();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> YamlTree {
        parse_tree(text).unwrap().expect("non-empty document")
    }

    #[test]
    fn spans_cover_scalars_exactly() {
        let text = "version: 1\nname: hello world\n";
        let tree = parse(text);
        let YamlKind::Map { entries, .. } = &tree.root.kind else {
            panic!("expected map root");
        };
        let (key, value) = &entries[1];
        assert_eq!(&text[key.span.clone()], "name");
        assert_eq!(&text[value.span.clone()], "hello world");
    }

    #[test]
    fn quoted_scalar_spans_include_quotes() {
        let text = "a: \"x: y\"\nb: 'it''s'\n";
        let tree = parse(text);
        let YamlKind::Map { entries, .. } = &tree.root.kind else {
            panic!("expected map root");
        };
        assert_eq!(&text[entries[0].1.span.clone()], "\"x: y\"");
        assert_eq!(&text[entries[1].1.span.clone()], "'it''s'");
    }

    #[test]
    fn anchor_names_are_recovered() {
        let text = "lorem: &ipsum\n  dolor: true\nfoo:\n  bar: *ipsum\n";
        let tree = parse(text);
        assert!(tree.anchors.contains_key("ipsum"));
        let anchored = tree.anchored("ipsum").unwrap();
        assert!(matches!(anchored.kind, YamlKind::Map { .. }));

        let bar = tree
            .root
            .entry_index("foo")
            .and_then(|i| match &tree.root.kind {
                YamlKind::Map { entries, .. } => Some(&entries[i].1),
                _ => None,
            })
            .unwrap();
        let YamlKind::Map { entries, .. } = &bar.kind else {
            panic!("expected map");
        };
        let YamlKind::Alias { name } = &entries[0].1.kind else {
            panic!("expected alias value");
        };
        assert_eq!(name, "ipsum");
    }

    #[test]
    fn flow_collections_span_their_brackets() {
        let text = "lorem: &ipsum {dolor: true}\n";
        let tree = parse(text);
        let YamlKind::Map { entries, .. } = &tree.root.kind else {
            panic!("expected map root");
        };
        let value = &entries[0].1;
        assert_eq!(&text[value.span.clone()], "{dolor: true}");
        assert_eq!(value.anchor.as_deref(), Some("ipsum"));
    }

    #[test]
    fn merge_keys_parse_as_plain_entries() {
        let text = "base: &b {x: 1}\nderived:\n  <<: *b\n  y: 2\n";
        let tree = parse(text);
        let derived_index = tree.root.entry_index("derived").unwrap();
        let YamlKind::Map { entries, .. } = &tree.root.kind else {
            panic!("expected map root");
        };
        let derived = &entries[derived_index].1;
        let YamlKind::Map { entries, .. } = &derived.kind else {
            panic!("expected map");
        };
        assert!(entries[0].0.is_merge_key());
    }

    #[test]
    fn block_scalar_spans_cover_the_whole_block() {
        let text = "script: |\n  line one\n  line two\nafter: 1\n";
        let tree = parse(text);
        let YamlKind::Map { entries, .. } = &tree.root.kind else {
            panic!("expected map root");
        };
        assert_eq!(&text[entries[0].1.span.clone()], "|\n  line one\n  line two");
        assert_eq!(&text[entries[1].0.span.clone()], "after");
    }

    #[test]
    fn folded_scalar_with_chomping_modifier_is_spanned() {
        let text = "note: >-\n  a b\n\n  c d\nnext: 2\n";
        let tree = parse(text);
        let YamlKind::Map { entries, .. } = &tree.root.kind else {
            panic!("expected map root");
        };
        assert_eq!(&text[entries[0].1.span.clone()], ">-\n  a b\n\n  c d");
    }

    #[test]
    fn comment_after_scalar_stays_out_of_span() {
        let text = "a: value # trailing note\nb: 2\n";
        let tree = parse(text);
        let YamlKind::Map { entries, .. } = &tree.root.kind else {
            panic!("expected map root");
        };
        assert_eq!(&text[entries[0].1.span.clone()], "value");
    }
}
