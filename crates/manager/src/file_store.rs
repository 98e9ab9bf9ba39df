//! Snapshot store backed by a single JSON file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use steward_types::{Any, PluginError, SnapshotStore};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Stores the snapshot as pretty JSON at `path`; saves go through a sibling
/// temp file and a rename so readers never see a partial document.
#[derive(Debug, Clone)]
pub struct FileStore {
	path: PathBuf,
}

impl FileStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn temp_path(&self) -> PathBuf {
		let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
		name.push(".tmp");
		self.path.with_file_name(name)
	}

	fn io_error(&self, err: std::io::Error) -> PluginError {
		PluginError::Unavailable(format!("{}: {err}", self.path.display()))
	}
}

#[async_trait]
impl SnapshotStore for FileStore {
	async fn load(&self) -> steward_types::Result<Option<Any>> {
		let bytes = match fs::read(&self.path).await {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(self.io_error(err)),
		};
		let snapshot = serde_json::from_slice(&bytes).map_err(|err| PluginError::Failed(format!("{}: {err}", self.path.display())))?;
		Ok(Some(snapshot))
	}

	async fn save(&self, snapshot: &Any) -> steward_types::Result<()> {
		let json = serde_json::to_vec_pretty(snapshot).map_err(|err| PluginError::Invalid(err.to_string()))?;
		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			fs::create_dir_all(parent).await.map_err(|err| self.io_error(err))?;
		}

		let temp = self.temp_path();
		let mut file = fs::File::create(&temp).await.map_err(|err| self.io_error(err))?;
		file.write_all(&json).await.map_err(|err| self.io_error(err))?;
		file.sync_all().await.map_err(|err| self.io_error(err))?;
		drop(file);
		fs::rename(&temp, &self.path).await.map_err(|err| self.io_error(err))?;
		tracing::debug!(path = %self.path.display(), bytes = json.len(), "manager.file_store.save");
		Ok(())
	}
}
