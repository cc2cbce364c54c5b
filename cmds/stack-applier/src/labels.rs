//! Ownership labels and bookkeeping annotations.
//!
//! Every resource a stack applies carries:
//! - `stack-applier.io/stack`: the owning stack's name, used to find prune candidates
//! - `stack-applier.io/stack-checksum`: md5 of the desired document, for humans
//! - `stack-applier.io/last-applied-configuration`: the labeled desired document,
//!   used as the base of the next merge patch

use std::fmt;

use kube::api::DynamicObject;
use serde_json::{Map, Value};

pub const DOMAIN: &str = "stack-applier.io";
pub const STACK_LABEL: &str = "stack-applier.io/stack";
pub const CHECKSUM_ANNOTATION: &str = "stack-applier.io/stack-checksum";
pub const LAST_APPLIED_ANNOTATION: &str = "stack-applier.io/last-applied-configuration";

/// Bookkeeping key of a resource within a stack.
///
/// The API group is not part of the key, so two kinds that share a name
/// across groups cannot both be applied by one stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
	pub kind: String,
	/// Empty for cluster-wide resources.
	pub namespace: String,
	pub name: String,
}

impl ResourceId {
	pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			namespace: namespace.unwrap_or_default().to_string(),
			name: name.into(),
		}
	}
}

impl fmt::Display for ResourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.namespace.is_empty() {
			write!(f, "{}/{}", self.kind, self.name)
		} else {
			write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
		}
	}
}

/// Label selector matching every resource owned by `stack`.
pub fn selector(stack: &str) -> String {
	format!("{STACK_LABEL}={stack}")
}

/// Hex md5 of the serialized document.
pub fn checksum(manifest: &Value) -> String {
	// Serializing a Value cannot fail: keys are always strings.
	let bytes = serde_json::to_vec(manifest).unwrap_or_default();
	format!("{:x}", md5::compute(bytes))
}

fn child_object<'a>(parent: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
	let entry = parent
		.entry(key.to_string())
		.or_insert_with(|| Value::Object(Map::new()));
	if !entry.is_object() {
		*entry = Value::Object(Map::new());
	}
	match entry {
		Value::Object(map) => map,
		_ => unreachable!("replaced with an object above"),
	}
}

/// Return a copy of `manifest` carrying the ownership label and checksum.
pub fn label(manifest: &Value, stack: &str) -> Value {
	let checksum = checksum(manifest);
	let mut labeled = manifest.clone();

	let Value::Object(ref mut obj) = labeled else {
		return labeled;
	};
	let metadata = child_object(obj, "metadata");
	child_object(metadata, "labels").insert(STACK_LABEL.to_string(), Value::String(stack.to_string()));
	child_object(metadata, "annotations")
		.insert(CHECKSUM_ANNOTATION.to_string(), Value::String(checksum));

	labeled
}

/// Serialized form stored in the last-applied annotation.
///
/// Any previous last-applied annotation is left out, so re-applying the
/// same document always produces the same string.
pub fn last_applied(labeled: &Value) -> String {
	let mut doc = labeled.clone();
	if let Some(Value::Object(annotations)) = doc.pointer_mut("/metadata/annotations") {
		annotations.remove(LAST_APPLIED_ANNOTATION);
	}
	serde_json::to_string(&doc).unwrap_or_default()
}

/// Set the last-applied annotation on `doc`.
pub fn set_last_applied(doc: &mut Value, last_applied: String) {
	let Value::Object(ref mut obj) = doc else {
		return;
	};
	let metadata = child_object(obj, "metadata");
	child_object(metadata, "annotations")
		.insert(LAST_APPLIED_ANNOTATION.to_string(), Value::String(last_applied));
}

/// Parse the last-applied annotation of a live object.
///
/// An unparseable annotation is treated as missing.
pub fn last_applied_of(live: &DynamicObject) -> Option<Value> {
	let raw = live.metadata.annotations.as_ref()?.get(LAST_APPLIED_ANNOTATION)?;
	match serde_json::from_str(raw) {
		Ok(value) => Some(value),
		Err(e) => {
			tracing::debug!(error = %e, "ignoring malformed last-applied annotation");
			None
		}
	}
}

/// Value of the ownership label, if any.
pub fn stack_of(live: &DynamicObject) -> Option<&str> {
	live.metadata
		.labels
		.as_ref()?
		.get(STACK_LABEL)
		.map(String::as_str)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_label_adds_ownership_and_checksum() {
		let manifest = json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {"name": "cm", "labels": {"app": "x"}},
		});

		let labeled = label(&manifest, "mystack");
		assert_eq!(labeled["metadata"]["labels"]["app"], "x");
		assert_eq!(labeled["metadata"]["labels"][STACK_LABEL], "mystack");
		assert_eq!(
			labeled["metadata"]["annotations"][CHECKSUM_ANNOTATION],
			checksum(&manifest)
		);
		// The input is untouched.
		assert!(manifest["metadata"].get("annotations").is_none());
	}

	#[test]
	fn test_label_creates_missing_metadata() {
		let labeled = label(&json!({"kind": "ConfigMap"}), "s");
		assert_eq!(labeled["metadata"]["labels"][STACK_LABEL], "s");
	}

	#[test]
	fn test_checksum_changes_with_content() {
		let a = checksum(&json!({"data": {"k": "1"}}));
		let b = checksum(&json!({"data": {"k": "2"}}));
		assert_ne!(a, b);
		assert_eq!(a.len(), 32);
	}

	#[test]
	fn test_last_applied_ignores_previous_annotation() {
		let mut doc = label(&json!({"metadata": {"name": "a"}}), "s");
		let first = last_applied(&doc);
		set_last_applied(&mut doc, first.clone());
		assert_eq!(last_applied(&doc), first);
	}

	#[test]
	fn test_last_applied_roundtrip_through_live_object() {
		let mut doc = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}});
		let labeled = label(&doc, "s");
		set_last_applied(&mut doc, last_applied(&labeled));

		let live: DynamicObject = serde_json::from_value(doc).unwrap();
		assert_eq!(last_applied_of(&live), Some(labeled));
	}

	#[test]
	fn test_resource_id_display() {
		assert_eq!(ResourceId::new("ConfigMap", Some("ns"), "cm").to_string(), "ConfigMap/ns/cm");
		assert_eq!(ResourceId::new("ClusterRole", None, "cr").to_string(), "ClusterRole/cr");
	}
}
