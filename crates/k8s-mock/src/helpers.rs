//! Helper functions for mock Kubernetes testing.

use serde_json::Value;

/// Apply a JSON merge patch (RFC 7386): objects merge recursively, `null`
/// removes a key, everything else replaces.
pub fn merge_patch(target: Value, patch: Value) -> Value {
	let Value::Object(patch_map) = patch else {
		return patch;
	};
	let mut target_map = match target {
		Value::Object(map) => map,
		_ => serde_json::Map::new(),
	};
	for (key, patch_value) in patch_map {
		if patch_value.is_null() {
			target_map.remove(&key);
			continue;
		}
		let current = target_map.remove(&key).unwrap_or(Value::Null);
		target_map.insert(key, merge_patch(current, patch_value));
	}
	Value::Object(target_map)
}

/// Whether an object's labels satisfy a label selector.
///
/// Supports `key=value`, `key==value`, `key!=value`, `key` and `!key` terms.
pub fn matches_selector(object: &Value, selector: &str) -> bool {
	let labels = object.pointer("/metadata/labels");
	let label = |key: &str| labels.and_then(|l| l.get(key)).and_then(Value::as_str);

	selector
		.split(',')
		.map(str::trim)
		.filter(|term| !term.is_empty())
		.all(|term| {
			if let Some((key, value)) = term.split_once("!=") {
				label(key.trim()) != Some(value.trim())
			} else if let Some((key, value)) = term.split_once("==") {
				label(key.trim()) == Some(value.trim())
			} else if let Some((key, value)) = term.split_once('=') {
				label(key.trim()) == Some(value.trim())
			} else if let Some(key) = term.strip_prefix('!') {
				label(key.trim()).is_none()
			} else {
				label(term).is_some()
			}
		})
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_merge_patch_removes_nulls() {
		let merged = merge_patch(
			json!({"data": {"a": "1", "b": "2"}, "list": [1, 2]}),
			json!({"data": {"a": null, "c": "3"}, "list": [3]}),
		);
		assert_eq!(merged, json!({"data": {"b": "2", "c": "3"}, "list": [3]}));
	}

	#[test]
	fn test_matches_selector() {
		let object = json!({"metadata": {"labels": {"app": "web", "tier": "front"}}});
		assert!(matches_selector(&object, "app=web"));
		assert!(matches_selector(&object, "app==web,tier"));
		assert!(matches_selector(&object, "app!=db,!missing"));
		assert!(!matches_selector(&object, "app=db"));
		assert!(!matches_selector(&json!({"metadata": {}}), "app=web"));
		assert!(matches_selector(&json!({}), ""));
	}
}
