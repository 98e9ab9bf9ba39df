//! Plugin lookup by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PluginError, Result};
use crate::group::GroupPlugin;
use crate::instance::InstancePlugin;

/// Resolves plugin names to live handles.
///
/// Implementations own transport concerns; callers only ever see capability
/// handles and may call `instance`/`group` again after a failure to reconnect.
pub trait PluginLookup: Send + Sync {
	/// Resolves an instance plugin.
	fn instance(&self, name: &str) -> Result<Arc<dyn InstancePlugin>>;

	/// Resolves a group plugin.
	fn group(&self, name: &str) -> Result<Arc<dyn GroupPlugin>>;

	/// Names of every known plugin, sorted.
	fn list(&self) -> Vec<String>;
}

/// In-process plugin table.
#[derive(Default)]
pub struct StaticPlugins {
	instances: RwLock<BTreeMap<String, Arc<dyn InstancePlugin>>>,
	groups: RwLock<BTreeMap<String, Arc<dyn GroupPlugin>>>,
}

impl StaticPlugins {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers or replaces an instance plugin.
	pub fn register_instance(&self, name: impl Into<String>, plugin: Arc<dyn InstancePlugin>) {
		self.instances.write().insert(name.into(), plugin);
	}

	/// Registers or replaces a group plugin.
	pub fn register_group(&self, name: impl Into<String>, plugin: Arc<dyn GroupPlugin>) {
		self.groups.write().insert(name.into(), plugin);
	}

	/// Removes a plugin of either capability.
	pub fn remove(&self, name: &str) {
		self.instances.write().remove(name);
		self.groups.write().remove(name);
	}
}

impl PluginLookup for StaticPlugins {
	fn instance(&self, name: &str) -> Result<Arc<dyn InstancePlugin>> {
		self.instances
			.read()
			.get(name)
			.cloned()
			.ok_or_else(|| PluginError::NotFound(format!("instance plugin {name}")))
	}

	fn group(&self, name: &str) -> Result<Arc<dyn GroupPlugin>> {
		self.groups
			.read()
			.get(name)
			.cloned()
			.ok_or_else(|| PluginError::NotFound(format!("group plugin {name}")))
	}

	fn list(&self) -> Vec<String> {
		let mut names: Vec<String> = self.instances.read().keys().cloned().collect();
		names.extend(self.groups.read().keys().cloned());
		names.sort();
		names.dedup();
		names
	}
}
