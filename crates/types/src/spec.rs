//! Declarative specs and the observed objects reported back to callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::any::Any;

/// Identity assigned by a backend once the spec has been realized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	/// Backend-assigned identifier.
	pub id: String,
}

/// Naming and labelling attached to every spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
	/// Name unique within a kind.
	pub name: String,
	/// Free-form labels.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub tags: BTreeMap<String, String>,
	/// Backend identity, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identity: Option<Identity>,
}

impl Metadata {
	/// Metadata with only a name.
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}
}

/// Reference from one spec to another it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
	/// Kind of the referenced spec.
	pub kind: String,
	/// Name of the referenced spec.
	pub name: String,
}

/// Declarative description of desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
	/// Discriminator selecting the handler.
	pub kind: String,
	/// Schema version of `properties`.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub version: String,
	/// Name, tags and identity.
	pub metadata: Metadata,
	/// Handler-specific desired state.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub properties: Option<Any>,
	/// Handler-specific tuning knobs.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub options: Option<Any>,
	/// Other specs this one depends on.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub depends: Vec<Dependency>,
}

impl Spec {
	/// Creates a spec with the given kind and name.
	pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			metadata: Metadata::named(name),
			..Self::default()
		}
	}

	/// Sets the properties blob.
	#[must_use]
	pub fn with_properties(mut self, properties: Any) -> Self {
		self.properties = Some(properties);
		self
	}

	/// Sets the options blob.
	#[must_use]
	pub fn with_options(mut self, options: Any) -> Self {
		self.options = Some(options);
		self
	}

	/// Adds one tag.
	#[must_use]
	pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.metadata.tags.insert(key.into(), value.into());
		self
	}
}

/// A spec paired with its observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Object {
	/// The spec this object realizes.
	pub spec: Spec,
	/// Observed state reported by the owning controller.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub state: Option<Any>,
}

impl Object {
	/// Object with an empty (but present) state document.
	pub fn new(spec: Spec) -> Self {
		Self {
			spec,
			state: Some(Any::empty_object()),
		}
	}

	/// Replaces the state document.
	#[must_use]
	pub fn with_state(mut self, state: Any) -> Self {
		self.state = Some(state);
		self
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	#[test]
	fn spec_decodes_with_sparse_fields() {
		let raw = json!({
			"kind": "group",
			"metadata": { "name": "workers" },
			"properties": { "size": 3 }
		});
		let spec: Spec = serde_json::from_value(raw).unwrap();
		assert_eq!(spec.kind, "group");
		assert_eq!(spec.metadata.name, "workers");
		assert!(spec.metadata.tags.is_empty());
		assert!(spec.options.is_none());
		assert_eq!(spec.properties.unwrap().value(), &json!({"size": 3}));
	}

	#[test]
	fn object_state_is_never_absent_by_default() {
		let object = Object::new(Spec::new("resource", "net"));
		assert_eq!(object.state, Some(Any::empty_object()));
	}
}
