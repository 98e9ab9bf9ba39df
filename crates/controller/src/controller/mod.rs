//! Keyed registry of [`Managed`] control loops.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use steward_types::{ControllerPlugin, Metadata, MetadataPlugin, Object, Operation, Plan, PluginError, Spec};

use crate::error::{ControllerError, Result};
use crate::managed::Managed;

/// Builds a fresh [`Managed`] for a spec.
pub type Alloc = Arc<dyn Fn(&Spec) -> Result<Arc<dyn Managed>> + Send + Sync>;

/// Derives the registry key from spec metadata.
pub type KeyFunc = Arc<dyn Fn(&Metadata) -> Result<String> + Send + Sync>;

/// Keys by metadata name; an empty name is rejected.
pub fn key_by_name(metadata: &Metadata) -> Result<String> {
	if metadata.name.is_empty() {
		return Err(ControllerError::MissingName);
	}
	Ok(metadata.name.clone())
}

/// Routes plan, commit, describe and free to one [`Managed`] per key.
///
/// Re-enforcing a key whose control loop is running stops it and swaps in a
/// newly allocated one under the write lock. Enforce and destroy for one key
/// run one at a time behind a per-key gate, so at most one loop per key is
/// ever live.
pub struct Controller {
	name: String,
	alloc: Alloc,
	keyfunc: KeyFunc,
	managed: RwLock<BTreeMap<String, Arc<dyn Managed>>>,
	gates: Mutex<BTreeMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Controller {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Controller")
			.field("name", &self.name)
			.field("keys", &self.keys())
			.finish_non_exhaustive()
	}
}

impl Controller {
	pub fn new(name: impl Into<String>, alloc: Alloc, keyfunc: Option<KeyFunc>) -> Self {
		Self {
			name: name.into(),
			alloc,
			keyfunc: keyfunc.unwrap_or_else(|| Arc::new(key_by_name)),
			managed: RwLock::new(BTreeMap::new()),
			gates: Mutex::new(BTreeMap::new()),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn keys(&self) -> Vec<String> {
		self.managed.read().keys().cloned().collect()
	}

	/// Managed object registered under `key`, if any.
	pub fn managed(&self, key: &str) -> Option<Arc<dyn Managed>> {
		self.managed.read().get(key).cloned()
	}

	pub fn metadata(&self, key: &str) -> Option<Arc<dyn MetadataPlugin>> {
		self.managed(key).and_then(|m| m.metadata())
	}

	fn gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
		Arc::clone(self.gates.lock().entry(key.to_string()).or_default())
	}

	fn is_current(&self, key: &str, managed: &Arc<dyn Managed>) -> bool {
		self.managed.read().get(key).is_some_and(|current| Arc::ptr_eq(current, managed))
	}

	fn resolve_or_alloc(&self, key: &str, spec: &Spec) -> Result<Arc<dyn Managed>> {
		if let Some(existing) = self.managed(key) {
			return Ok(existing);
		}
		let mut managed = self.managed.write();
		if let Some(existing) = managed.get(key) {
			return Ok(Arc::clone(existing));
		}
		let fresh = (self.alloc)(spec)?;
		managed.insert(key.to_string(), Arc::clone(&fresh));
		tracing::debug!(controller = %self.name, key, "controller.alloc");
		Ok(fresh)
	}

	/// Resolves the entry an enforce should run against, swapping out a running one.
	fn swap_for_enforce(&self, key: &str, spec: &Spec) -> Result<Arc<dyn Managed>> {
		let mut managed = self.managed.write();
		let existing = managed.get(key).cloned();
		match existing {
			Some(old) if old.running() => {
				let fresh = (self.alloc)(spec)?;
				old.stop()?;
				fresh.set_prev_spec(old.current_spec());
				managed.insert(key.to_string(), Arc::clone(&fresh));
				tracing::info!(controller = %self.name, key, "controller.commit.swap");
				Ok(fresh)
			}
			Some(idle) => Ok(idle),
			None => {
				let fresh = (self.alloc)(spec)?;
				managed.insert(key.to_string(), Arc::clone(&fresh));
				tracing::debug!(controller = %self.name, key, "controller.alloc");
				Ok(fresh)
			}
		}
	}

	fn matches(&self, search: Option<&Metadata>) -> Result<Vec<(String, Arc<dyn Managed>)>> {
		let managed = self.managed.read();
		match search {
			None => Ok(managed.iter().map(|(k, m)| (k.clone(), Arc::clone(m))).collect()),
			Some(metadata) => {
				let key = (self.keyfunc)(metadata)?;
				Ok(managed.get(&key).map(|m| (key, Arc::clone(m))).into_iter().collect())
			}
		}
	}

	pub async fn plan(&self, operation: Operation, spec: Spec) -> Result<(Object, Plan)> {
		let key = (self.keyfunc)(&spec.metadata)?;
		let managed = self.resolve_or_alloc(&key, &spec)?;
		managed.plan(operation, spec).await
	}

	pub async fn commit(&self, operation: Operation, spec: Spec) -> Result<Object> {
		let key = (self.keyfunc)(&spec.metadata)?;
		let gate = self.gate(&key);
		let _serial = gate.lock().await;
		match operation {
			Operation::Enforce => {
				let managed = self.swap_for_enforce(&key, &spec)?;
				let object = managed.enforce(spec).await;
				if !self.is_current(&key, &managed) {
					managed.stop()?;
					tracing::warn!(controller = %self.name, key = %key, "controller.commit.superseded");
				}
				object
			}
			Operation::Destroy => {
				let managed = self.managed(&key).ok_or_else(|| ControllerError::NotFound(key.clone()))?;
				let object = managed.terminate().await?;
				let mut registry = self.managed.write();
				if registry.get(&key).is_some_and(|current| Arc::ptr_eq(current, &managed)) {
					registry.remove(&key);
				}
				tracing::info!(controller = %self.name, key = %key, "controller.commit.destroy");
				Ok(object)
			}
		}
	}

	/// Inspects matching entries; never allocates.
	pub async fn describe(&self, search: Option<Metadata>) -> Result<Vec<Object>> {
		let mut objects = Vec::new();
		for (_, managed) in self.matches(search.as_ref())? {
			objects.push(managed.inspect().await?);
		}
		Ok(objects)
	}

	/// Frees matching entries without destroying anything.
	pub async fn free(&self, search: Option<Metadata>) -> Result<Vec<Object>> {
		let mut objects = Vec::new();
		for (key, managed) in self.matches(search.as_ref())? {
			objects.push(managed.free().await?);
			tracing::debug!(controller = %self.name, key = %key, "controller.free");
		}
		Ok(objects)
	}
}

#[async_trait]
impl ControllerPlugin for Controller {
	async fn plan(&self, operation: Operation, spec: Spec) -> steward_types::Result<(Object, Plan)> {
		Controller::plan(self, operation, spec).await.map_err(PluginError::from)
	}

	async fn commit(&self, operation: Operation, spec: Spec) -> steward_types::Result<Object> {
		Controller::commit(self, operation, spec).await.map_err(PluginError::from)
	}

	async fn describe(&self, search: Option<Metadata>) -> steward_types::Result<Vec<Object>> {
		Controller::describe(self, search).await.map_err(PluginError::from)
	}

	async fn free(&self, search: Option<Metadata>) -> steward_types::Result<Vec<Object>> {
		Controller::free(self, search).await.map_err(PluginError::from)
	}
}

#[cfg(test)]
mod tests;
