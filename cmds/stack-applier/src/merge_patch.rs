//! JSON merge patches (RFC 7386).
//!
//! Arrays are atomic: a changed array is replaced as a whole, never merged
//! element by element. Keys present in the original but absent from the
//! modified document become `null` in the patch, which deletes them.

use serde_json::{Map, Value};

/// Compute the merge patch turning `original` into `modified`.
///
/// Returns an empty object when nothing changed.
pub fn create(original: &Value, modified: &Value) -> Value {
	match (original, modified) {
		(Value::Object(original), Value::Object(modified)) => {
			Value::Object(diff_objects(original, modified))
		}
		(_, modified) => modified.clone(),
	}
}

fn diff_objects(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
	let mut patch = Map::new();

	for (key, new) in modified {
		match (original.get(key), new) {
			(Some(Value::Object(old)), Value::Object(new)) => {
				let nested = diff_objects(old, new);
				if !nested.is_empty() {
					patch.insert(key.clone(), Value::Object(nested));
				}
			}
			(Some(old), new) if old == new => {}
			(_, new) => {
				patch.insert(key.clone(), new.clone());
			}
		}
	}

	for key in original.keys() {
		if !modified.contains_key(key) {
			patch.insert(key.clone(), Value::Null);
		}
	}

	patch
}

/// Apply a merge patch to a document.
pub fn apply(target: Value, patch: &Value) -> Value {
	let Value::Object(patch) = patch else {
		return patch.clone();
	};

	let mut target = match target {
		Value::Object(map) => map,
		_ => Map::new(),
	};

	for (key, value) in patch {
		if value.is_null() {
			target.remove(key);
		} else {
			let current = target.remove(key).unwrap_or(Value::Null);
			target.insert(key.clone(), apply(current, value));
		}
	}

	Value::Object(target)
}

/// Whether a patch would change nothing.
pub fn is_empty(patch: &Value) -> bool {
	patch.as_object().is_some_and(Map::is_empty)
}
