//! Error types for pollers, collections and the controller registry.

use steward_fsm::FsmError;
use steward_types::{AnyError, PluginError};

/// Failure of one poll pass. Never terminal for the poll loop.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PollError {
	/// The caller's cancellation token fired.
	#[error("poll cancelled")]
	Cancelled,
	/// The backing plugin failed.
	#[error(transparent)]
	Plugin(#[from] PluginError),
	/// The work function failed for another reason.
	#[error("{0}")]
	Work(String),
}

/// Errors raised by managed objects and the controller registry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControllerError {
	/// The spec metadata carries no name to key it by.
	#[error("spec metadata has no name")]
	MissingName,
	/// No managed object is registered under the key.
	#[error("no managed object for key {0:?}")]
	NotFound(String),
	/// The spec failed decoding or validation; nothing was changed.
	#[error("invalid spec: {0}")]
	InvalidSpec(String),
	/// A plugin call failed.
	#[error(transparent)]
	Plugin(#[from] PluginError),
	/// The state machine rejected an operation.
	#[error(transparent)]
	Fsm(#[from] FsmError),
}

impl From<AnyError> for ControllerError {
	fn from(err: AnyError) -> Self {
		ControllerError::InvalidSpec(err.to_string())
	}
}

impl From<ControllerError> for PluginError {
	fn from(err: ControllerError) -> Self {
		match err {
			ControllerError::NotFound(key) => PluginError::NotFound(key),
			ControllerError::MissingName | ControllerError::InvalidSpec(_) => PluginError::Invalid(err.to_string()),
			ControllerError::Plugin(inner) => inner,
			ControllerError::Fsm(inner) => PluginError::Failed(inner.to_string()),
		}
	}
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
