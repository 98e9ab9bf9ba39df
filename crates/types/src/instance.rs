//! Instance capability: provision, observe and destroy individual resources.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::any::Any;
use crate::error::Result;

/// Backend-assigned instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for InstanceId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

/// Link from an instance to another resource it requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
	/// Identifier of the attached resource.
	pub id: String,
	/// What the attachment is, e.g. the dependency's resource name.
	#[serde(rename = "type")]
	pub kind: String,
}

/// Request to provision one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
	/// Backend-specific properties.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub properties: Option<Any>,
	/// Labels to stamp on the instance.
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
	/// Boot-time initialization script.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub init: String,
	/// Stable identity that survives re-provisioning.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub logical_id: Option<String>,
	/// Resources this instance attaches to.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub attachments: Vec<Attachment>,
}

/// Observed instance as reported by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
	/// Backend identifier.
	pub id: InstanceId,
	/// Stable identity, if the backend tracks one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub logical_id: Option<String>,
	/// Labels currently on the instance.
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
	/// Backend properties, when requested.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub properties: Option<Any>,
}

impl Description {
	/// Description with only an id.
	pub fn with_id(id: impl Into<String>) -> Self {
		Self {
			id: InstanceId(id.into()),
			logical_id: None,
			tags: BTreeMap::new(),
			properties: None,
		}
	}
}

/// Why an instance is being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestroyContext {
	/// The owning spec was terminated or the instance is surplus.
	Terminate,
	/// The instance is being replaced by an update.
	RollingUpdate,
}

/// Backend that provisions and observes instances.
#[async_trait]
pub trait InstancePlugin: Send + Sync {
	/// Checks backend properties without side effects.
	async fn validate(&self, properties: &Any) -> Result<()>;

	/// Creates one instance.
	async fn provision(&self, spec: InstanceSpec) -> Result<InstanceId>;

	/// Replaces labels on an instance.
	async fn label(&self, id: &InstanceId, labels: BTreeMap<String, String>) -> Result<()>;

	/// Destroys one instance.
	async fn destroy(&self, id: &InstanceId, context: DestroyContext) -> Result<()>;

	/// Lists instances carrying every label in `labels`.
	async fn describe_instances(&self, labels: &BTreeMap<String, String>, properties: bool) -> Result<Vec<Description>>;
}
