use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::set::SetInner;
use crate::spec::Tick;

const MIN_PERIOD: Duration = Duration::from_millis(1);

struct ClockInner {
	now: AtomicU64,
	cancel: CancellationToken,
	subscribers: Mutex<Vec<Weak<SetInner>>>,
}

/// Logical tick source shared by one or more sets.
///
/// A manual clock advances only through [`Clock::tick`]; a wall clock also
/// owns a tokio task that ticks it every period until [`Clock::stop`].
#[derive(Clone)]
pub struct Clock {
	inner: Arc<ClockInner>,
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for Clock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Clock")
			.field("now", &self.now())
			.field("stopped", &self.is_stopped())
			.finish()
	}
}

impl Clock {
	/// Creates a clock driven only by explicit [`Clock::tick`] calls.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(ClockInner {
				now: AtomicU64::new(0),
				cancel: CancellationToken::new(),
				subscribers: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Creates a clock ticked by a background task every `period`.
	///
	/// Must be called within a tokio runtime.
	pub fn wall(period: Duration) -> Self {
		let clock = Self::new();
		clock.drive(period);
		clock
	}

	/// Spawns a task ticking this clock every `period`, first tick one period from now.
	///
	/// Must be called within a tokio runtime. The task holds only a weak
	/// reference and exits once the clock is stopped or dropped. Periods
	/// below one millisecond are raised to one millisecond.
	pub fn drive(&self, period: Duration) {
		let period = period.max(MIN_PERIOD);
		let weak = Arc::downgrade(&self.inner);
		let cancel = self.inner.cancel.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
			interval.tick().await;
			loop {
				tokio::select! {
					biased;
					_ = cancel.cancelled() => break,
					_ = interval.tick() => {
						let Some(inner) = weak.upgrade() else {
							break;
						};
						Clock { inner }.tick();
					}
				}
			}
			tracing::trace!(period_ms = period.as_millis() as u64, "fsm.clock.wall.exit");
		});
	}

	/// Advances the clock by one tick and delivers it to every live set.
	///
	/// No-op once stopped.
	pub fn tick(&self) {
		if self.is_stopped() {
			return;
		}
		let now = self.inner.now.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
		let live: Vec<Arc<SetInner>> = {
			let mut subscribers = self.inner.subscribers.lock();
			subscribers.retain(|s| s.strong_count() > 0);
			subscribers.iter().filter_map(Weak::upgrade).collect()
		};
		for set in live {
			set.on_tick(now);
		}
	}

	/// Current tick.
	pub fn now(&self) -> Tick {
		self.inner.now.load(Ordering::Acquire)
	}

	/// Stops ticking. Safe to call more than once.
	pub fn stop(&self) {
		self.inner.cancel.cancel();
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.cancel.is_cancelled()
	}

	pub(crate) fn subscribe(&self, set: Weak<SetInner>) {
		self.inner.subscribers.lock().push(set);
	}
}
