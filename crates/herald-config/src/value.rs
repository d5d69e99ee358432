//! Helpers for the JSON-like value trees the store persists.
//!
//! Stored documents and registered defaults are both [`serde_json::Value`]
//! trees. Readers see the stored tree merged over the defaults tree: stored
//! keys win, missing keys fall back to the default, and stored keys with no
//! registered default are preserved as-is so a schema that gains fields
//! later never drops data written under the old schema.

use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};

/// Merge a stored value over a defaults value.
///
/// When both sides are objects the merge recurses per key; any other
/// combination resolves to the stored side. Unknown stored keys (absent
/// from the defaults) are kept.
pub fn merge_defaults(default: &Value, stored: Value) -> Value {
    match (default, stored) {
        (Value::Object(default_map), Value::Object(stored_map)) => {
            let mut merged = default_map.clone();
            for (key, stored_child) in stored_map {
                let child = match merged.remove(&key) {
                    Some(default_child) => merge_defaults(&default_child, stored_child),
                    None => stored_child,
                };
                merged.insert(key, child);
            }
            Value::Object(merged)
        }
        (_, stored) => stored,
    }
}

/// Walk `path` down a value tree, returning the subtree if every step
/// exists and is traversable.
pub fn get_path<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut current = root;
    for step in path {
        current = current.as_object()?.get(step.as_ref())?;
    }
    Some(current)
}

/// Insert `value` at `path`, creating intermediate objects as needed.
///
/// Fails with [`ConfigError::SchemaMismatch`] if an intermediate step is
/// already present but not an object, since descending through a scalar
/// would silently discard stored data.
pub fn set_path<S: AsRef<str>>(root: &mut Value, path: &[S], value: Value) -> ConfigResult<()> {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for step in parents {
        let step = step.as_ref();
        let map = as_object_mut(current, step)?;
        current = map
            .entry(step.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object_mut(current, last.as_ref())?.insert(last.as_ref().to_string(), value);
    Ok(())
}

/// Remove the value at `path`. Returns whether anything was removed; a
/// missing path is a no-op.
pub fn remove_path<S: AsRef<str>>(root: &mut Value, path: &[S]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };

    let mut current = root;
    for step in parents {
        match current.as_object_mut().and_then(|m| m.get_mut(step.as_ref())) {
            Some(child) => current = child,
            None => return false,
        }
    }
    current
        .as_object_mut()
        .and_then(|m| m.remove(last.as_ref()))
        .is_some()
}

fn as_object_mut<'a>(value: &'a mut Value, step: &str) -> ConfigResult<&'a mut Map<String, Value>> {
    if value.is_object() {
        // Checked above; `as_object_mut` on an object never returns None.
        return value.as_object_mut().ok_or_else(|| {
            ConfigError::schema(format!("cannot descend into `{step}`: not an object"))
        });
    }
    Err(ConfigError::schema(format!(
        "cannot descend into `{step}`: parent is not an object"
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stored_keys_win_over_defaults() {
        let default = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let stored = json!({"b": {"c": 9}});
        assert_eq!(
            merge_defaults(&default, stored),
            json!({"a": 1, "b": {"c": 9, "d": 3}})
        );
    }

    #[test]
    fn unknown_stored_keys_are_preserved() {
        let default = json!({"a": 1});
        let stored = json!({"legacy": true, "a": 2});
        assert_eq!(
            merge_defaults(&default, stored),
            json!({"a": 2, "legacy": true})
        );
    }

    #[test]
    fn scalar_stored_replaces_object_default() {
        let default = json!({"a": {"nested": 1}});
        let stored = json!({"a": 5});
        assert_eq!(merge_defaults(&default, stored), json!({"a": 5}));
    }

    #[test]
    fn get_path_walks_nested_objects() {
        let tree = json!({"a": {"b": {"c": 42}}});
        assert_eq!(get_path(&tree, &["a", "b", "c"]), Some(&json!(42)));
        assert_eq!(get_path(&tree, &["a", "missing"]), None);
        assert_eq!(get_path::<&str>(&tree, &[]), Some(&tree));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut tree = json!({});
        set_path(&mut tree, &["a", "b"], json!(1)).unwrap();
        assert_eq!(tree, json!({"a": {"b": 1}}));
    }

    #[test]
    fn set_path_refuses_to_descend_through_scalar() {
        let mut tree = json!({"a": 1});
        let result = set_path(&mut tree, &["a", "b"], json!(2));
        assert!(matches!(result, Err(ConfigError::SchemaMismatch { .. })));
        assert_eq!(tree, json!({"a": 1}));
    }

    #[test]
    fn remove_path_reports_whether_anything_was_removed() {
        let mut tree = json!({"a": {"b": 1, "c": 2}});
        assert!(remove_path(&mut tree, &["a", "b"]));
        assert!(!remove_path(&mut tree, &["a", "b"]));
        assert_eq!(tree, json!({"a": {"c": 2}}));
    }
}
