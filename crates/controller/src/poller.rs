//! Cooperative, cancellable periodic execution.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::PollError;

const ERROR_BUFFER: usize = 16;
const MIN_PERIOD: Duration = Duration::from_millis(1);
/// First tick for periods too long to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Unit of work run on each admitted tick.
#[async_trait]
pub trait Work: Send + Sync {
	async fn run(&self) -> Result<(), PollError>;
}

#[async_trait]
impl<F, Fut> Work for F
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), PollError>> + Send,
{
	async fn run(&self) -> Result<(), PollError> {
		(self)().await
	}
}

/// Wraps a closure returning a future as [`Work`].
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn Work>
where
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), PollError>> + Send + 'static,
{
	Arc::new(f)
}

/// Tick source for a [`Poller`].
#[derive(Debug)]
pub enum Ticker {
	/// Wall-clock period; the first tick arrives one period after `run` starts.
	/// Periods below one millisecond are raised to one millisecond.
	Interval(Duration),
	/// Ticks pushed through the paired [`TickSender`].
	Manual(mpsc::Receiver<()>),
}

impl Ticker {
	pub fn interval(period: Duration) -> Self {
		Self::Interval(period)
	}

	/// Ticker driven by hand, mostly for tests.
	pub fn manual() -> (Self, TickSender) {
		let (tx, rx) = mpsc::channel(1);
		(Self::Manual(rx), TickSender(tx))
	}

	fn into_ticks(self) -> Ticks {
		match self {
			Self::Interval(period) => {
				let period = period.max(MIN_PERIOD);
				let now = Instant::now();
				let start = now.checked_add(period).unwrap_or_else(|| now + FAR_FUTURE);
				let mut interval = tokio::time::interval_at(start, period);
				interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
				Ticks::Interval(interval)
			}
			Self::Manual(rx) => Ticks::Manual(rx),
		}
	}
}

/// Sending half of a manual [`Ticker`].
#[derive(Debug, Clone)]
pub struct TickSender(mpsc::Sender<()>);

impl TickSender {
	/// Delivers one tick; false once the poller is gone.
	pub async fn tick(&self) -> bool {
		self.0.send(()).await.is_ok()
	}
}

enum Ticks {
	Interval(tokio::time::Interval),
	Manual(mpsc::Receiver<()>),
}

impl Ticks {
	async fn next(&mut self) -> Option<()> {
		match self {
			Self::Interval(interval) => {
				interval.tick().await;
				Some(())
			}
			Self::Manual(rx) => rx.recv().await,
		}
	}
}

type Guard = Box<dyn Fn() -> bool + Send + Sync>;
type Cleanup = Box<dyn FnOnce() + Send>;

/// Runs a unit of work on every tick whose guard passes.
///
/// Work never overlaps itself: it is awaited inline by the single run loop.
/// Errors are advisory and pushed onto a bounded channel (dropped when full);
/// the loop keeps going. A poller runs at most once; [`Poller::stop`] is final.
pub struct Poller {
	name: String,
	should_run: Guard,
	work: Arc<dyn Work>,
	ticker: Mutex<Option<Ticker>>,
	stop: CancellationToken,
	errors_tx: mpsc::Sender<PollError>,
	errors_rx: Mutex<Option<mpsc::Receiver<PollError>>>,
	cleanup: Mutex<Option<Cleanup>>,
}

impl std::fmt::Debug for Poller {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Poller")
			.field("name", &self.name)
			.field("stopped", &self.stop.is_cancelled())
			.finish_non_exhaustive()
	}
}

impl Poller {
	pub fn new(name: impl Into<String>, should_run: impl Fn() -> bool + Send + Sync + 'static, work: Arc<dyn Work>, ticker: Ticker) -> Self {
		let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);
		Self {
			name: name.into(),
			should_run: Box::new(should_run),
			work,
			ticker: Mutex::new(Some(ticker)),
			stop: CancellationToken::new(),
			errors_tx,
			errors_rx: Mutex::new(Some(errors_rx)),
			cleanup: Mutex::new(None),
		}
	}

	/// Hook run once when the loop terminates.
	#[must_use]
	pub fn on_cleanup(self, cleanup: impl FnOnce() + Send + 'static) -> Self {
		*self.cleanup.lock() = Some(Box::new(cleanup));
		self
	}

	/// Hands out the error stream. Returns `None` after the first call.
	pub fn take_errors(&self) -> Option<mpsc::Receiver<PollError>> {
		self.errors_rx.lock().take()
	}

	/// Runs the loop in the calling task until [`Poller::stop`] or `token` fires.
	///
	/// Returns immediately if the loop is already running or has finished.
	pub async fn run(&self, token: CancellationToken) {
		let Some(ticker) = self.ticker.lock().take() else {
			tracing::trace!(poller = %self.name, "poller.run.reentered");
			return;
		};
		let mut ticks = ticker.into_ticks();
		tracing::debug!(poller = %self.name, "poller.run.start");

		loop {
			tokio::select! {
				biased;
				_ = self.stop.cancelled() => break,
				_ = token.cancelled() => {
					self.report(PollError::Cancelled);
					break;
				}
				tick = ticks.next() => {
					if tick.is_none() {
						break;
					}
					if !(self.should_run)() {
						continue;
					}
					if let Err(err) = self.work.run().await {
						tracing::debug!(poller = %self.name, error = %err, "poller.work.failed");
						self.report(err);
					}
				}
			}
		}

		tracing::debug!(poller = %self.name, "poller.run.exit");
		if let Some(cleanup) = self.cleanup.lock().take() {
			cleanup();
		}
	}

	/// Makes [`Poller::run`] return. Safe to call more than once.
	pub fn stop(&self) {
		self.stop.cancel();
	}

	pub fn is_stopped(&self) -> bool {
		self.stop.is_cancelled()
	}

	fn report(&self, err: PollError) {
		if self.errors_tx.try_send(err).is_err() {
			tracing::trace!(poller = %self.name, "poller.errors.dropped");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	use super::*;

	async fn settle() {
		for _ in 0..8 {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test(flavor = "current_thread")]
	async fn guard_is_checked_every_tick_and_errors_do_not_stop_the_loop() {
		let calls = Arc::new(AtomicUsize::new(0));
		let enabled = Arc::new(AtomicBool::new(false));
		let (ticker, ticks) = Ticker::manual();

		let work_calls = Arc::clone(&calls);
		let work = work_fn(move || {
			let n = work_calls.fetch_add(1, Ordering::SeqCst);
			async move { if n == 0 { Err(PollError::Work("first pass".into())) } else { Ok(()) } }
		});
		let guard = Arc::clone(&enabled);
		let poller = Arc::new(Poller::new("test", move || guard.load(Ordering::SeqCst), work, ticker));
		let mut errors = poller.take_errors().unwrap();
		assert!(poller.take_errors().is_none());

		let task = tokio::spawn({
			let poller = Arc::clone(&poller);
			async move { poller.run(CancellationToken::new()).await }
		});

		ticks.tick().await;
		settle().await;
		assert_eq!(calls.load(Ordering::SeqCst), 0);

		enabled.store(true, Ordering::SeqCst);
		ticks.tick().await;
		settle().await;
		ticks.tick().await;
		settle().await;
		assert_eq!(calls.load(Ordering::SeqCst), 2);
		assert_eq!(errors.try_recv().ok(), Some(PollError::Work("first pass".into())));

		poller.stop();
		task.await.unwrap();
	}

	#[tokio::test(flavor = "current_thread")]
	async fn stop_runs_cleanup_once_and_reentry_is_a_noop() {
		let cleaned = Arc::new(AtomicUsize::new(0));
		let (ticker, _ticks) = Ticker::manual();
		let work = work_fn(|| async { Ok(()) });
		let counter = Arc::clone(&cleaned);
		let poller = Arc::new(
			Poller::new("cleanup", || true, work, ticker).on_cleanup(move || {
				counter.fetch_add(1, Ordering::SeqCst);
			}),
		);

		let task = tokio::spawn({
			let poller = Arc::clone(&poller);
			async move { poller.run(CancellationToken::new()).await }
		});
		settle().await;

		// Second run returns at once while the first is active.
		poller.run(CancellationToken::new()).await;
		assert_eq!(cleaned.load(Ordering::SeqCst), 0);

		poller.stop();
		poller.stop();
		task.await.unwrap();
		assert_eq!(cleaned.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn cancellation_is_reported_on_the_error_channel() {
		let (ticker, _ticks) = Ticker::manual();
		let work = work_fn(|| async { Ok(()) });
		let poller = Poller::new("cancel", || true, work, ticker);
		let mut errors = poller.take_errors().unwrap();

		let token = CancellationToken::new();
		token.cancel();
		poller.run(token).await;
		assert_eq!(errors.recv().await, Some(PollError::Cancelled));
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn periodic_ticker_waits_one_period_before_first_run() {
		let calls = Arc::new(AtomicUsize::new(0));
		let work_calls = Arc::clone(&calls);
		let work = work_fn(move || {
			work_calls.fetch_add(1, Ordering::SeqCst);
			async { Ok(()) }
		});
		let poller = Arc::new(Poller::new("periodic", || true, work, Ticker::interval(Duration::from_millis(100))));
		let task = tokio::spawn({
			let poller = Arc::clone(&poller);
			async move { poller.run(CancellationToken::new()).await }
		});

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 2);

		poller.stop();
		task.await.unwrap();
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn degenerate_periods_run_without_panicking() {
		let calls = Arc::new(AtomicUsize::new(0));
		let mut pollers = Vec::new();
		for period in [Duration::ZERO, Duration::MAX] {
			let work_calls = Arc::clone(&calls);
			let work = work_fn(move || {
				work_calls.fetch_add(1, Ordering::SeqCst);
				async { Ok(()) }
			});
			let poller = Arc::new(Poller::new("degenerate", || true, work, Ticker::interval(period)));
			let runner = Arc::clone(&poller);
			pollers.push((poller, tokio::spawn(async move { runner.run(CancellationToken::new()).await })));
		}

		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(calls.load(Ordering::SeqCst) >= 5);

		for (poller, task) in pollers {
			poller.stop();
			task.await.unwrap();
		}
	}
}
