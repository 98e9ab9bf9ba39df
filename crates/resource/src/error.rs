use steward_controller::ControllerError;
use steward_fsm::{DefineError, FsmError};
use steward_types::AnyError;

/// Errors building or driving the resource model.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
	#[error("resource properties: {0}")]
	Decode(#[from] AnyError),
	#[error("resource spec has no properties")]
	MissingProperties,
	#[error("resource {0:?} names no instance plugin")]
	MissingPlugin(String),
	#[error("resource {0:?} has a zero observe interval")]
	ZeroInterval(String),
	#[error("resource {resource:?} depends on unknown resource {dependency:?}")]
	UnknownDependency { resource: String, dependency: String },
	#[error("dependency cycle through {0:?}")]
	Cycle(String),
	#[error(transparent)]
	Define(#[from] DefineError),
	#[error(transparent)]
	Fsm(#[from] FsmError),
}

impl From<ResourceError> for ControllerError {
	fn from(err: ResourceError) -> Self {
		match err {
			ResourceError::Fsm(inner) => ControllerError::Fsm(inner),
			other => ControllerError::InvalidSpec(other.to_string()),
		}
	}
}
