//! Opaque snapshot persistence.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::any::Any;
use crate::error::{PluginError, Result};

/// Stores one opaque snapshot document.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
	/// Loads the last saved snapshot; `None` if nothing was ever saved.
	async fn load(&self) -> Result<Option<Any>>;

	/// Replaces the saved snapshot.
	async fn save(&self, snapshot: &Any) -> Result<()>;
}

/// Process-local store, shared by cloning an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
	snapshot: Mutex<Option<Any>>,
	fail_saves: Mutex<bool>,
}

impl MemoryStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes subsequent saves fail, for exercising persistence errors.
	#[doc(hidden)]
	pub fn set_fail_saves(&self, fail: bool) {
		*self.fail_saves.lock() = fail;
	}
}

#[async_trait]
impl SnapshotStore for MemoryStore {
	async fn load(&self) -> Result<Option<Any>> {
		Ok(self.snapshot.lock().clone())
	}

	async fn save(&self, snapshot: &Any) -> Result<()> {
		if *self.fail_saves.lock() {
			return Err(PluginError::Unavailable("memory store rejecting saves".to_string()));
		}
		*self.snapshot.lock() = Some(snapshot.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn memory_store_round_trip_and_failure() {
		let store = MemoryStore::new();
		assert_eq!(store.load().await, Ok(None));

		let doc = Any::from_value(json!([1, 2]));
		store.save(&doc).await.unwrap();
		assert_eq!(store.load().await, Ok(Some(doc.clone())));

		store.set_fail_saves(true);
		assert!(store.save(&Any::empty_object()).await.is_err());
		assert_eq!(store.load().await, Ok(Some(doc)));
	}
}
