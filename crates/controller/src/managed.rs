use std::sync::Arc;

use async_trait::async_trait;
use steward_types::{MetadataPlugin, Object, Operation, Plan, Spec};

use crate::error::Result;

/// Control loop bound to one spec key.
///
/// `start` and `stop` are synchronous so the registry can swap instances
/// while holding its write lock. `enforce` must reject specs that fail
/// validation before any side effect and must treat re-submission of the
/// current spec as a no-op.
#[async_trait]
pub trait Managed: Send + Sync {
	/// Starts the control loop. No-op while running.
	fn start(&self);

	/// True while the control loop is live.
	fn running(&self) -> bool;

	/// Stops the control loop. Safe to call more than once.
	fn stop(&self) -> Result<()>;

	/// Read-only export of the loop's view, if any.
	fn metadata(&self) -> Option<Arc<dyn MetadataPlugin>>;

	/// Proposes the object `operation` would produce, without mutating anything.
	async fn plan(&self, operation: Operation, spec: Spec) -> Result<(Object, Plan)>;

	/// Converges toward `spec` and (re)starts the loop.
	async fn enforce(&self, spec: Spec) -> Result<Object>;

	/// Reports the current object.
	async fn inspect(&self) -> Result<Object>;

	/// Stops acting on the world without destroying anything.
	async fn free(&self) -> Result<Object>;

	/// Destroys everything the loop created and stops it.
	async fn terminate(&self) -> Result<Object>;

	/// Spec last accepted by `enforce`.
	fn current_spec(&self) -> Option<Spec>;

	/// Records the spec of the instance this one replaced.
	fn set_prev_spec(&self, spec: Option<Spec>);

	fn prev_spec(&self) -> Option<Spec>;
}
