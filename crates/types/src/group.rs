//! Group capability: commit and free whole groups of instances.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::any::Any;
use crate::error::Result;
use crate::instance::Description;
use crate::spec::Spec;

/// Kind string under which group specs are recorded.
pub const GROUP_KIND: &str = "group";

/// Group identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for GroupId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

/// Desired state of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
	/// Group identifier.
	pub id: GroupId,
	/// Backend-specific group configuration.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub properties: Option<Any>,
}

impl GroupSpec {
	/// Reads a group spec out of a generic spec (name becomes the id).
	pub fn from_spec(spec: &Spec) -> Self {
		Self {
			id: GroupId(spec.metadata.name.clone()),
			properties: spec.properties.clone(),
		}
	}

	/// Wraps this group spec as a generic spec of kind [`GROUP_KIND`].
	pub fn to_spec(&self) -> Spec {
		let mut spec = Spec::new(GROUP_KIND, self.id.0.clone());
		spec.properties = self.properties.clone();
		spec
	}
}

/// Observed state of one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDescription {
	/// Instances currently in the group.
	pub instances: Vec<Description>,
	/// Whether the group has reached its desired state.
	pub converged: bool,
}

/// Backend that manages groups.
#[async_trait]
pub trait GroupPlugin: Send + Sync {
	/// Commits a group spec; `pretend` only reports what would happen.
	async fn commit_group(&self, spec: GroupSpec, pretend: bool) -> Result<String>;

	/// Stops managing a group, leaving its instances in place.
	async fn free_group(&self, id: &GroupId) -> Result<()>;

	/// Destroys a group and its instances.
	async fn destroy_group(&self, id: &GroupId) -> Result<()>;

	/// Describes one group.
	async fn describe_group(&self, id: &GroupId) -> Result<GroupDescription>;

	/// Lists every group currently managed.
	async fn inspect_groups(&self) -> Result<Vec<GroupSpec>>;

	/// Current target size.
	async fn size(&self, id: &GroupId) -> Result<usize>;

	/// Updates the target size.
	async fn set_size(&self, id: &GroupId, size: usize) -> Result<()>;
}
