//! Leader-owned index of every committed spec, mirrored into a snapshot store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steward_types::{Any, SnapshotStore, Spec};
use tokio::sync::Mutex;

use crate::error::{ManagerError, Result};

/// Index key: one entry per kind and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpecKey {
	pub kind: String,
	pub name: String,
}

impl SpecKey {
	pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			name: name.into(),
		}
	}

	pub fn of(spec: &Spec) -> Self {
		Self::new(spec.kind.clone(), spec.metadata.name.clone())
	}
}

impl fmt::Display for SpecKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.kind, self.name)
	}
}

/// Which plugin handles a spec, and the spec itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
	pub handler: String,
	pub spec: Spec,
}

/// Persisted form: the index as an ordered entry list.
#[derive(Serialize, Deserialize)]
struct Entry {
	key: SpecKey,
	record: Record,
}

type Index = BTreeMap<SpecKey, Record>;

/// In-memory spec index backed by a [`SnapshotStore`].
///
/// Every mutation reloads the persisted snapshot, applies the change, and
/// saves it back while holding one lock; the in-memory index is replaced only
/// after the save succeeds.
pub struct GlobalSpec {
	store: Arc<dyn SnapshotStore>,
	index: Mutex<Index>,
}

impl fmt::Debug for GlobalSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("GlobalSpec").finish_non_exhaustive()
	}
}

impl GlobalSpec {
	pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
		Self {
			store,
			index: Mutex::new(Index::new()),
		}
	}

	async fn read(&self) -> Result<Index> {
		let Some(snapshot) = self.store.load().await.map_err(ManagerError::Persist)? else {
			return Ok(Index::new());
		};
		if snapshot.is_null() {
			return Ok(Index::new());
		}
		let entries: Vec<Entry> = snapshot.decode()?;
		Ok(entries.into_iter().map(|e| (e.key, e.record)).collect())
	}

	async fn write(&self, index: &Index) -> Result<()> {
		let entries: Vec<Entry> = index
			.iter()
			.map(|(key, record)| Entry {
				key: key.clone(),
				record: record.clone(),
			})
			.collect();
		let snapshot = Any::encode(&entries)?;
		self.store.save(&snapshot).await.map_err(ManagerError::Persist)
	}

	/// Replaces the in-memory index with the persisted one and returns it.
	pub async fn load(&self) -> Result<Vec<(SpecKey, Record)>> {
		let mut index = self.index.lock().await;
		let loaded = self.read().await?;
		*index = loaded;
		tracing::debug!(entries = index.len(), "manager.global_spec.load");
		Ok(index.iter().map(|(k, r)| (k.clone(), r.clone())).collect())
	}

	/// Persists the in-memory index as is.
	pub async fn store(&self) -> Result<()> {
		let index = self.index.lock().await;
		self.write(&index).await
	}

	/// Inserts or replaces one record.
	pub async fn update(&self, key: SpecKey, record: Record) -> Result<()> {
		let mut index = self.index.lock().await;
		let mut next = self.read().await?;
		next.insert(key.clone(), record);
		self.write(&next).await?;
		*index = next;
		tracing::debug!(key = %key, "manager.global_spec.update");
		Ok(())
	}

	/// Removes one record, returning it if it was present.
	pub async fn remove(&self, key: &SpecKey) -> Result<Option<Record>> {
		let mut index = self.index.lock().await;
		let mut next = self.read().await?;
		let removed = next.remove(key);
		if removed.is_some() {
			self.write(&next).await?;
		}
		*index = next;
		tracing::debug!(key = %key, removed = removed.is_some(), "manager.global_spec.remove");
		Ok(removed)
	}

	/// Specs currently in memory, in key order.
	pub async fn specs(&self) -> Vec<Spec> {
		self.index.lock().await.values().map(|r| r.spec.clone()).collect()
	}

	pub async fn records(&self) -> Vec<(SpecKey, Record)> {
		self.index.lock().await.iter().map(|(k, r)| (k.clone(), r.clone())).collect()
	}

	/// Specs as persisted, without touching the in-memory index.
	pub async fn persisted(&self) -> Result<Vec<Spec>> {
		let _index = self.index.lock().await;
		Ok(self.read().await?.into_values().map(|r| r.spec).collect())
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use steward_types::MemoryStore;

	use super::*;

	fn record(handler: &str, kind: &str, name: &str) -> (SpecKey, Record) {
		(
			SpecKey::new(kind, name),
			Record {
				handler: handler.into(),
				spec: Spec::new(kind, name),
			},
		)
	}

	#[tokio::test]
	async fn load_replaces_memory_wholesale() {
		let store = Arc::new(MemoryStore::new());
		let writer = GlobalSpec::new(store.clone());
		let (key, rec) = record("group", "group", "workers");
		writer.update(key.clone(), rec.clone()).await.unwrap();

		let reader = GlobalSpec::new(store.clone());
		let (stale_key, stale) = record("group", "group", "stale");
		*reader.index.lock().await = Index::from([(stale_key, stale)]);

		assert_eq!(reader.load().await.unwrap(), vec![(key.clone(), rec.clone())]);
		assert_eq!(reader.records().await, vec![(key, rec)]);
	}

	#[tokio::test]
	async fn failed_save_leaves_memory_and_store_unchanged() {
		let store = Arc::new(MemoryStore::new());
		let index = GlobalSpec::new(store.clone());
		let (key, rec) = record("group", "group", "workers");
		index.update(key.clone(), rec.clone()).await.unwrap();

		store.set_fail_saves(true);
		let (other_key, other) = record("resources", "resource", "stack");
		let err = index.update(other_key, other).await.unwrap_err();
		assert!(matches!(err, ManagerError::Persist(_)), "{err:?}");
		let err = index.remove(&key).await.unwrap_err();
		assert!(matches!(err, ManagerError::Persist(_)), "{err:?}");

		assert_eq!(index.records().await, vec![(key.clone(), rec.clone())]);
		assert_eq!(index.persisted().await.unwrap(), vec![rec.spec]);
	}

	#[tokio::test]
	async fn remove_of_absent_key_does_not_write() {
		let store = Arc::new(MemoryStore::new());
		let index = GlobalSpec::new(store.clone());
		store.set_fail_saves(true);
		assert_eq!(index.remove(&SpecKey::new("group", "ghost")).await.unwrap(), None);
		assert!(index.specs().await.is_empty());
	}
}
