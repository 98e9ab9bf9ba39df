//! Controller capability: plan, commit, describe and free managed objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::spec::{Metadata, Object, Spec};

/// What a commit should do with the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
	/// Converge reality toward the spec.
	Enforce,
	/// Tear down everything the spec created.
	Destroy,
}

/// Human-readable description of what a commit would change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
	/// One line per proposed change.
	pub message: Vec<String>,
}

impl Plan {
	/// Appends one line.
	pub fn push(&mut self, line: impl Into<String>) {
		self.message.push(line.into());
	}

	/// Returns true when nothing would change.
	pub fn is_empty(&self) -> bool {
		self.message.is_empty()
	}
}

/// A controller reachable by name.
///
/// Searches by [`Metadata`] select objects by name; `None` selects everything.
#[async_trait]
pub trait ControllerPlugin: Send + Sync {
	/// Proposes the object a commit would produce, without mutating anything.
	async fn plan(&self, operation: Operation, spec: Spec) -> Result<(Object, Plan)>;

	/// Applies the spec.
	async fn commit(&self, operation: Operation, spec: Spec) -> Result<Object>;

	/// Reports current objects.
	async fn describe(&self, search: Option<Metadata>) -> Result<Vec<Object>>;

	/// Stops managing the matching objects without destroying them.
	async fn free(&self, search: Option<Metadata>) -> Result<Vec<Object>>;
}
