use std::sync::Arc;

use async_trait::async_trait;
use steward_types::{ControllerPlugin, Metadata, Object, Operation, Plan, Spec};

use crate::manager::{Inner, Op};

/// A registered controller reached through the manager's queue.
///
/// Every call is rejected with `NotLeader` unless this process leads, and
/// runs serialized with leadership transitions. Enforce commits are
/// recorded in the persisted spec index before the controller sees them;
/// destroy commits remove the record first.
#[derive(Clone)]
pub struct ControllerProxy {
	name: String,
	inner: Arc<Inner>,
}

impl std::fmt::Debug for ControllerProxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ControllerProxy").field("name", &self.name).finish_non_exhaustive()
	}
}

impl ControllerProxy {
	pub(crate) fn new(name: &str, inner: Arc<Inner>) -> Self {
		Self { name: name.to_string(), inner }
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

#[async_trait]
impl ControllerPlugin for ControllerProxy {
	async fn plan(&self, operation: Operation, spec: Spec) -> steward_types::Result<(Object, Plan)> {
		let controller = self.name.clone();
		Ok(self
			.inner
			.submit(|reply| Op::Plan {
				controller,
				operation,
				spec,
				reply,
			})
			.await?)
	}

	async fn commit(&self, operation: Operation, spec: Spec) -> steward_types::Result<Object> {
		let controller = self.name.clone();
		Ok(self
			.inner
			.submit(|reply| Op::Commit {
				controller,
				operation,
				spec,
				reply,
			})
			.await?)
	}

	async fn describe(&self, search: Option<Metadata>) -> steward_types::Result<Vec<Object>> {
		let controller = self.name.clone();
		Ok(self.inner.submit(|reply| Op::Describe { controller, search, reply }).await?)
	}

	async fn free(&self, search: Option<Metadata>) -> steward_types::Result<Vec<Object>> {
		let controller = self.name.clone();
		Ok(self.inner.submit(|reply| Op::Free { controller, search, reply }).await?)
	}
}
