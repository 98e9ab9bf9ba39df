//! Error type shared by every capability boundary.

use crate::any::AnyError;

/// Failure reported across a plugin or controller boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
	/// The named plugin or object does not exist.
	#[error("not found: {0}")]
	NotFound(String),
	/// The receiving process is not the elected leader.
	#[error("not leader")]
	NotLeader,
	/// The request was rejected before any side effect.
	#[error("invalid input: {0}")]
	Invalid(String),
	/// The plugin could not be reached.
	#[error("plugin unavailable: {0}")]
	Unavailable(String),
	/// The operation is not implemented by this plugin.
	#[error("unsupported operation: {0}")]
	Unsupported(&'static str),
	/// The plugin accepted the request but failed to carry it out.
	#[error("{0}")]
	Failed(String),
}

impl From<AnyError> for PluginError {
	fn from(err: AnyError) -> Self {
		PluginError::Invalid(err.to_string())
	}
}

/// Result type for capability calls.
pub type Result<T> = std::result::Result<T, PluginError>;
