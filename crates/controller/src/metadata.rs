//! Lazily-applied metadata export.
//!
//! Producers push mutations through a [`MetadataUpdater`] without touching
//! the tree; readers replay everything pending before they look.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use steward_types::{Any, MetadataPlugin};
use tokio::sync::mpsc;

type Update = Box<dyn FnOnce(&mut Map<String, Value>) + Send>;

/// JSON tree fed by queued mutations.
pub struct UpdatableMetadata {
	tree: Mutex<Map<String, Value>>,
	pending: Mutex<mpsc::UnboundedReceiver<Update>>,
	tx: mpsc::UnboundedSender<Update>,
}

impl std::fmt::Debug for UpdatableMetadata {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UpdatableMetadata").finish_non_exhaustive()
	}
}

impl Default for UpdatableMetadata {
	fn default() -> Self {
		Self::new()
	}
}

/// Write handle for an [`UpdatableMetadata`].
#[derive(Clone)]
pub struct MetadataUpdater {
	tx: mpsc::UnboundedSender<Update>,
}

impl std::fmt::Debug for MetadataUpdater {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MetadataUpdater").field("closed", &self.tx.is_closed()).finish()
	}
}

impl MetadataUpdater {
	/// Queues a mutation. Dropped silently once the tree is gone.
	pub fn update(&self, f: impl FnOnce(&mut Map<String, Value>) + Send + 'static) {
		let _ = self.tx.send(Box::new(f));
	}

	/// Queues a write of `value` at `path`.
	pub fn put(&self, path: impl Into<String>, value: Value) {
		let path = path.into();
		self.update(move |tree| put_path(tree, &path, value));
	}

	/// Queues removal of `path`.
	pub fn remove(&self, path: impl Into<String>) {
		let path = path.into();
		self.update(move |tree| remove_path(tree, &path));
	}
}

impl UpdatableMetadata {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self {
			tree: Mutex::new(Map::new()),
			pending: Mutex::new(rx),
			tx,
		}
	}

	pub fn updater(&self) -> MetadataUpdater {
		MetadataUpdater { tx: self.tx.clone() }
	}

	/// Applies pending mutations and returns a copy of the whole tree.
	pub fn snapshot(&self) -> Map<String, Value> {
		self.read(|tree| tree.clone())
	}

	fn read<R>(&self, f: impl FnOnce(&Map<String, Value>) -> R) -> R {
		let mut tree = self.tree.lock();
		let mut pending = self.pending.lock();
		while let Ok(update) = pending.try_recv() {
			update(&mut tree);
		}
		f(&tree)
	}
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
	path.split('/').filter(|s| !s.is_empty())
}

fn lookup<'a>(tree: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
	let mut parts = segments(path);
	let mut current = tree.get(parts.next()?)?;
	for part in parts {
		current = current.as_object()?.get(part)?;
	}
	Some(current)
}

/// Writes `value` at a `/`-separated path, creating or overwriting intermediate objects.
pub fn put_path(tree: &mut Map<String, Value>, path: &str, value: Value) {
	let parts: Vec<&str> = segments(path).collect();
	let Some((last, parents)) = parts.split_last() else {
		return;
	};
	let mut node = tree;
	for part in parents {
		let child = node.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
		if !child.is_object() {
			*child = Value::Object(Map::new());
		}
		let Value::Object(map) = child else {
			return;
		};
		node = map;
	}
	node.insert(last.to_string(), value);
}

fn remove_path(tree: &mut Map<String, Value>, path: &str) {
	let parts: Vec<&str> = segments(path).collect();
	let Some((last, parents)) = parts.split_last() else {
		return;
	};
	let mut node = tree;
	for part in parents {
		let Some(Value::Object(map)) = node.get_mut(*part) else {
			return;
		};
		node = map;
	}
	node.remove(*last);
}

impl MetadataPlugin for UpdatableMetadata {
	fn keys(&self, path: &str) -> Vec<String> {
		self.read(|tree| {
			let map = if segments(path).next().is_none() {
				Some(tree)
			} else {
				lookup(tree, path).and_then(Value::as_object)
			};
			let mut keys: Vec<String> = map.map(|m| m.keys().cloned().collect()).unwrap_or_default();
			keys.sort();
			keys
		})
	}

	fn get(&self, path: &str) -> Option<Any> {
		self.read(|tree| {
			if segments(path).next().is_none() {
				return Some(Any::from_value(Value::Object(tree.clone())));
			}
			lookup(tree, path).cloned().map(Any::from_value)
		})
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	#[test]
	fn updates_are_invisible_until_read() {
		let metadata = UpdatableMetadata::new();
		let updater = metadata.updater();
		updater.put("specs/current/name", json!("net"));
		updater.put("items/count", json!(2));
		updater.put("items/count", json!(3));

		assert_eq!(metadata.keys(""), vec!["items".to_string(), "specs".to_string()]);
		assert_eq!(metadata.get("items/count").map(Any::into_value), Some(json!(3)));
		assert_eq!(metadata.get("specs/current").map(Any::into_value), Some(json!({"name": "net"})));
		assert!(metadata.get("specs/missing").is_none());

		updater.remove("specs/current/name");
		assert_eq!(metadata.keys("specs/current"), Vec::<String>::new());
	}

	#[test]
	fn put_path_replaces_scalar_parents() {
		let mut tree = Map::new();
		put_path(&mut tree, "a", json!(1));
		put_path(&mut tree, "a/b", json!(2));
		assert_eq!(Value::Object(tree), json!({"a": {"b": 2}}));
	}
}
