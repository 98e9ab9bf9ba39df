use crate::set::InstanceId;
use crate::spec::{Index, Signal};

/// Failure returned by an [`Action`](crate::Action).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl ActionError {
	pub fn new(message: impl Into<String>) -> Self {
		Self(message.into())
	}
}

/// Rejected state machine definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefineError {
	#[error("no states defined")]
	Empty,
	#[error("state {0} defined more than once")]
	DuplicateState(Index),
	#[error("state {state} transitions on signal {signal} to undefined state {target}")]
	UnknownTarget { state: Index, signal: Signal, target: Index },
	#[error("state {state} has an action for signal {signal} without a transition")]
	ActionWithoutTransition { state: Index, signal: Signal },
	#[error("state {state} expires with signal {signal} but has no transition for it")]
	ExpiryWithoutTransition { state: Index, signal: Signal },
	#[error("state {0} has a zero ttl")]
	ZeroTtl(Index),
	#[error("flap between {a} and {b} references an undefined state")]
	FlapUnknownState { a: Index, b: Index },
	#[error("flap between {a} and {b} raises signal {signal} which one of them cannot handle")]
	FlapWithoutTransition { a: Index, b: Index, signal: Signal },
	#[error("flap between {a} and {b} needs a count of at least 2")]
	FlapCount { a: Index, b: Index },
}

/// Runtime failure signalling or populating a [`Set`](crate::Set).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
	#[error("set is stopped")]
	Stopped,
	#[error("unknown state {0}")]
	UnknownState(Index),
	#[error("unknown instance {0}")]
	UnknownInstance(InstanceId),
	#[error("state {state} has no transition for signal {signal}")]
	UnknownTransition { state: Index, signal: Signal },
	#[error("action for instance {id} on signal {signal} failed: {source}")]
	Action {
		id: InstanceId,
		signal: Signal,
		#[source]
		source: ActionError,
	},
}

pub type Result<T> = std::result::Result<T, FsmError>;
