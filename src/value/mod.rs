//! The serializable value model and path addressing.
//!
//! Workspace configuration is JSON-object-shaped: objects, arrays and
//! primitives only. The crate standardizes on `serde_json::Value` (with the
//! `preserve_order` feature, so object keys keep document order and object
//! equality is key-order-insensitive) and addresses locations inside a value
//! with [`JsonPath`], a sequence of string-or-integer segments.

mod path;

pub use path::{JsonPath, PathSegment};

/// A JSON value: `null`, boolean, number, string, array or object.
pub type JsonValue = serde_json::Value;

/// An ordered mapping from string keys to JSON values.
pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Look up the value at `path` inside `root`.
pub fn value_at<'a>(root: &'a JsonValue, path: &JsonPath) -> Option<&'a JsonValue> {
    let mut current = root;
    for segment in path.segments() {
        current = match (current, segment) {
            (JsonValue::Object(map), PathSegment::Key(k)) => map.get(k)?,
            (JsonValue::Array(items), PathSegment::Index(i)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable variant of [`value_at`].
pub fn value_at_mut<'a>(root: &'a mut JsonValue, path: &JsonPath) -> Option<&'a mut JsonValue> {
    let mut current = root;
    for segment in path.segments() {
        current = match (current, segment) {
            (JsonValue::Object(map), PathSegment::Key(k)) => map.get_mut(k)?,
            (JsonValue::Array(items), PathSegment::Index(i)) => items.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_at_descends_objects_and_arrays() {
        let root = json!({"projects": {"app": {"targets": [{"builder": "b"}]}}});
        let path = JsonPath::new()
            .key("projects")
            .key("app")
            .key("targets")
            .index(0)
            .key("builder");
        assert_eq!(value_at(&root, &path), Some(&json!("b")));
    }

    #[test]
    fn value_at_misses_are_none() {
        let root = json!({"a": [1, 2]});
        assert_eq!(value_at(&root, &JsonPath::new().key("a").index(5)), None);
        assert_eq!(value_at(&root, &JsonPath::new().key("b")), None);
        // Indexing an object or keying an array is a type mismatch, not a panic.
        assert_eq!(value_at(&root, &JsonPath::new().index(0)), None);
    }

    #[test]
    fn object_equality_ignores_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(a, b);
        // Arrays stay order-sensitive.
        assert_ne!(json!([1, 2]), json!([2, 1]));
    }
}
