//! Canonicalizes the key lists call sites send into `{key, storageType}` items.

use serde_json::Value;

use crate::types::{StorageType, WatchedKeyItem};

/// Normalize `items` (bare keys or `{key, storageType}` objects) or, when
/// `items` is not an array, the legacy `keys` list of bare keys.
///
/// Never fails: anything that is not an array yields an empty list.
pub fn normalize_storage_items(items: Option<&Value>, keys: Option<&Value>) -> Vec<WatchedKeyItem> {
    if let Some(Value::Array(items)) = items {
        return items.iter().map(normalize_item).collect();
    }
    if let Some(Value::Array(keys)) = keys {
        return keys
            .iter()
            .map(|key| WatchedKeyItem::local(key_string(key)))
            .collect();
    }
    Vec::new()
}

/// Normalize a persisted watched-key collection, which may still hold bare
/// strings written by older versions.
pub fn normalize_watched_keys(raw: Option<&Value>) -> Vec<WatchedKeyItem> {
    normalize_storage_items(raw, None)
}

fn normalize_item(item: &Value) -> WatchedKeyItem {
    match item {
        Value::Object(fields) if fields.contains_key("key") => {
            let key = fields.get("key").map(key_string).unwrap_or_default();
            let storage_type = fields
                .get("storageType")
                .and_then(Value::as_str)
                .map(StorageType::parse_lenient)
                .unwrap_or_default();
            WatchedKeyItem::new(key, storage_type)
        }
        other => WatchedKeyItem::local(key_string(other)),
    }
}

fn key_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn mixed_items_default_to_local() {
        let items = json!([
            "token",
            {"key": "cart", "storageType": "sessionStorage"},
            {"key": "theme"},
            42,
        ]);
        let normalized = normalize_storage_items(Some(&items), None);
        assert_eq!(
            normalized,
            vec![
                WatchedKeyItem::local("token"),
                WatchedKeyItem::new("cart", StorageType::Session),
                WatchedKeyItem::local("theme"),
                WatchedKeyItem::local("42"),
            ]
        );
    }

    #[test]
    fn legacy_keys_are_used_when_items_missing() {
        let keys = json!(["a", "b"]);
        let normalized = normalize_storage_items(Some(&json!("not-a-list")), Some(&keys));
        assert_eq!(
            normalized,
            vec![WatchedKeyItem::local("a"), WatchedKeyItem::local("b")]
        );
    }

    #[test]
    fn invalid_input_yields_empty_list() {
        assert!(normalize_storage_items(None, None).is_empty());
        assert!(normalize_storage_items(Some(&json!({"key": "x"})), Some(&json!(7))).is_empty());
    }

    #[test]
    fn input_is_left_untouched() {
        let items = json!([{"key": "a"}]);
        let before = items.clone();
        let _ = normalize_storage_items(Some(&items), None);
        assert_eq!(items, before);
    }
}
