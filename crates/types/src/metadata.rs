//! Read-only key/value export from controllers.

use crate::any::Any;

/// Hierarchical read-only view; paths are `/`-separated.
pub trait MetadataPlugin: Send + Sync {
	/// Child keys under `path`, sorted. The empty path lists the root.
	fn keys(&self, path: &str) -> Vec<String>;

	/// Value at `path`.
	fn get(&self, path: &str) -> Option<Any>;
}
