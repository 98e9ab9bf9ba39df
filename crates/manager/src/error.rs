use steward_types::{AnyError, PluginError};

/// Errors surfaced by the manager and its persisted spec index.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
	/// This process does not hold leadership; nothing was attempted.
	#[error("not leader")]
	NotLeader,
	/// `start` has not been called yet.
	#[error("manager not started")]
	NotStarted,
	/// The manager was stopped; its queue no longer accepts work.
	#[error("manager stopped")]
	Stopped,
	#[error("no controller registered as {0:?}")]
	UnknownController(String),
	/// Reading or writing the snapshot store failed; memory is unchanged.
	#[error("persist spec index: {0}")]
	Persist(PluginError),
	#[error("decode spec index: {0}")]
	Decode(#[from] AnyError),
	#[error(transparent)]
	Plugin(#[from] PluginError),
}

impl From<ManagerError> for PluginError {
	fn from(err: ManagerError) -> Self {
		match err {
			ManagerError::NotLeader => PluginError::NotLeader,
			ManagerError::UnknownController(name) => PluginError::NotFound(format!("controller {name}")),
			ManagerError::Plugin(inner) => inner,
			ManagerError::NotStarted | ManagerError::Stopped => PluginError::Unavailable(err.to_string()),
			ManagerError::Persist(_) | ManagerError::Decode(_) => PluginError::Failed(err.to_string()),
		}
	}
}

pub type Result<T> = std::result::Result<T, ManagerError>;
