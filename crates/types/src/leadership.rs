//! Leadership detection events.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Leadership state reported by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
	/// This process holds leadership.
	Leader,
	/// Another process holds leadership.
	NotLeader,
	/// The detector cannot tell.
	Unknown,
}

/// One leadership observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leadership {
	/// Observed status.
	pub status: Status,
	/// Detector failure accompanying the observation, if any.
	pub error: Option<String>,
}

impl Leadership {
	/// Observation without an error.
	pub fn status(status: Status) -> Self {
		Self { status, error: None }
	}

	/// Detector failure; status is always [`Status::Unknown`].
	pub fn failed(error: impl Into<String>) -> Self {
		Self {
			status: Status::Unknown,
			error: Some(error.into()),
		}
	}
}

/// Source of leadership events.
pub trait LeadershipDetector: Send + Sync {
	/// Starts detection and returns the event stream.
	fn start(&self) -> Result<mpsc::Receiver<Leadership>>;

	/// Stops detection; the event stream ends.
	fn stop(&self);
}
