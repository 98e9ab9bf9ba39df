//! Leadership normalization and a file-based detector.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use steward_controller::{Poller, Ticker, work_fn};
use steward_types::{Leadership, LeadershipDetector, PluginError, Status};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 4;

/// Collapses a detector's event stream into leader/not-leader flips.
///
/// Only a definitive `Leader` without an error counts as leadership; an
/// `Unknown` status or any detector error downgrades the belief.
#[derive(Debug, Default)]
pub(crate) struct Normalizer {
	leader: bool,
}

impl Normalizer {
	/// Returns the new belief when this event flips it.
	pub(crate) fn observe(&mut self, event: &Leadership) -> Option<bool> {
		let leader = event.error.is_none() && event.status == Status::Leader;
		self.flip(leader)
	}

	/// The event stream ended; leadership can no longer be confirmed.
	pub(crate) fn closed(&mut self) -> Option<bool> {
		self.flip(false)
	}

	fn flip(&mut self, leader: bool) -> Option<bool> {
		if leader == self.leader {
			return None;
		}
		self.leader = leader;
		Some(leader)
	}
}

/// Leadership belief shared by the normalizer, the queue and callers.
///
/// Every flip bumps the epoch. A gain is only confirmed by [`Lease::promote`]
/// with the epoch of that flip, so a downgrade observed in the meantime wins.
#[derive(Debug, Default)]
pub(crate) struct Lease {
	epoch: u64,
	leader: bool,
}

impl Lease {
	pub(crate) fn is_leader(&self) -> bool {
		self.leader
	}

	/// Records a flip and returns its epoch. Losses apply at once; gains wait for `promote`.
	pub(crate) fn flip(&mut self, leader: bool) -> u64 {
		self.epoch += 1;
		if !leader {
			self.leader = false;
		}
		self.epoch
	}

	/// Confirms the gain flipped at `epoch`. False if a later flip superseded it.
	pub(crate) fn promote(&mut self, epoch: u64) -> bool {
		if self.epoch != epoch {
			return false;
		}
		self.leader = true;
		true
	}

	/// Drops leadership for good; any pending gain is superseded.
	pub(crate) fn revoke(&mut self) {
		self.flip(false);
	}
}

/// Leader is whoever's id is written in a shared file.
///
/// The file is re-read every poll interval: content equal to `id` (ignoring
/// surrounding whitespace) is `Leader`, any other content is `NotLeader`, and
/// a read failure is `Unknown` with the error attached.
pub struct FileLeadership {
	path: PathBuf,
	id: String,
	poll_interval: Duration,
	poller: Mutex<Option<Arc<Poller>>>,
}

impl std::fmt::Debug for FileLeadership {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FileLeadership")
			.field("path", &self.path)
			.field("id", &self.id)
			.field("poll_interval", &self.poll_interval)
			.finish_non_exhaustive()
	}
}

impl FileLeadership {
	pub fn new(path: impl Into<PathBuf>, id: impl Into<String>, poll_interval: Duration) -> Self {
		Self {
			path: path.into(),
			id: id.into(),
			poll_interval,
			poller: Mutex::new(None),
		}
	}
}

async fn read_leader(path: &Path, id: &str) -> Leadership {
	match tokio::fs::read_to_string(path).await {
		Ok(content) if content.trim() == id => Leadership::status(Status::Leader),
		Ok(_) => Leadership::status(Status::NotLeader),
		Err(err) => Leadership::failed(format!("{}: {err}", path.display())),
	}
}

impl LeadershipDetector for FileLeadership {
	fn start(&self) -> steward_types::Result<mpsc::Receiver<Leadership>> {
		let mut slot = self.poller.lock();
		if slot.is_some() {
			return Err(PluginError::Invalid(format!("leadership file {} already watched", self.path.display())));
		}

		let (tx, rx) = mpsc::channel(EVENT_BUFFER);
		let path = self.path.clone();
		let id = self.id.clone();
		let work = work_fn(move || {
			let path = path.clone();
			let id = id.clone();
			let tx = tx.clone();
			async move {
				let event = read_leader(&path, &id).await;
				if let Err(err) = tx.try_send(event) {
					tracing::trace!(path = %path.display(), error = %err, "manager.leadership.file.dropped");
				}
				Ok(())
			}
		});
		let poller = Arc::new(Poller::new(
			format!("leadership:{}", self.path.display()),
			|| true,
			work,
			Ticker::interval(self.poll_interval),
		));
		let runner = Arc::clone(&poller);
		tokio::spawn(async move { runner.run(CancellationToken::new()).await });
		*slot = Some(poller);
		tracing::debug!(path = %self.path.display(), id = %self.id, "manager.leadership.file.start");
		Ok(rx)
	}

	fn stop(&self) {
		if let Some(poller) = self.poller.lock().take() {
			poller.stop();
			tracing::debug!(path = %self.path.display(), "manager.leadership.file.stop");
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn unknown_downgrades_a_leader_belief() {
		let mut normalizer = Normalizer::default();
		assert_eq!(normalizer.observe(&Leadership::status(Status::Leader)), Some(true));
		assert_eq!(normalizer.observe(&Leadership::status(Status::Leader)), None);
		assert_eq!(normalizer.observe(&Leadership::status(Status::Unknown)), Some(false));
		assert_eq!(normalizer.observe(&Leadership::status(Status::NotLeader)), None);
	}

	#[test]
	fn detector_errors_never_confer_leadership() {
		let mut normalizer = Normalizer::default();
		let event = Leadership {
			status: Status::Leader,
			error: Some("lease expired".into()),
		};
		assert_eq!(normalizer.observe(&event), None);
		assert_eq!(normalizer.closed(), None);
		assert_eq!(normalizer.observe(&Leadership::status(Status::Leader)), Some(true));
		assert_eq!(normalizer.closed(), Some(false));
	}

	#[test]
	fn downgrade_supersedes_a_pending_gain() {
		let mut lease = Lease::default();
		let gain = lease.flip(true);
		assert!(!lease.is_leader());
		lease.flip(false);
		assert!(!lease.promote(gain));
		assert!(!lease.is_leader());

		let regain = lease.flip(true);
		assert!(lease.promote(regain));
		assert!(lease.is_leader());
		lease.revoke();
		assert!(!lease.is_leader());
		assert!(!lease.promote(regain));
	}

	async fn next_status(rx: &mut mpsc::Receiver<Leadership>, want: Status) -> Leadership {
		loop {
			let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
				.await
				.expect("leadership event timed out")
				.expect("leadership stream closed");
			if event.status == want {
				return event;
			}
		}
	}

	#[tokio::test]
	async fn file_content_decides_leadership() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("leader");
		std::fs::write(&path, "node-a\n").unwrap();

		let detector = FileLeadership::new(&path, "node-a", Duration::from_millis(10));
		let mut rx = detector.start().unwrap();
		assert!(detector.start().is_err());

		next_status(&mut rx, Status::Leader).await;
		std::fs::write(&path, "node-b").unwrap();
		next_status(&mut rx, Status::NotLeader).await;
		std::fs::remove_file(&path).unwrap();
		let event = next_status(&mut rx, Status::Unknown).await;
		assert!(event.error.is_some());

		detector.stop();
		let drained = tokio::time::timeout(Duration::from_secs(5), async { while rx.recv().await.is_some() {} }).await;
		assert!(drained.is_ok(), "event stream did not close after stop");
	}
}
