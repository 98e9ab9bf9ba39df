use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{FsmError, Result};
use crate::spec::{Index, Signal, Spec, Tick};

/// Identifier of one instance, unique within its set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Runtime behaviour knobs for a [`Set`].
#[derive(Debug, Clone)]
pub struct Options {
	/// Name used in log fields.
	pub name: String,
	/// Treat signals the current state does not declare as no-ops instead of errors.
	pub ignore_undefined_signals: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			name: "fsm".to_string(),
			ignore_undefined_signals: true,
		}
	}
}

#[derive(Debug, Clone, Copy)]
struct FlapRun {
	pair: (Index, Index),
	count: usize,
}

#[derive(Debug)]
struct Entry {
	state: Index,
	deadline: Option<Tick>,
	flap: Option<FlapRun>,
}

#[derive(Debug, Default)]
struct SetState {
	instances: BTreeMap<InstanceId, Entry>,
	next_id: u64,
	stopped: bool,
}

pub(crate) struct SetInner {
	spec: Arc<Spec>,
	clock: Clock,
	options: Options,
	state: Mutex<SetState>,
	action_failures: AtomicU64,
}

/// Live instances sharing one spec and one clock.
#[derive(Clone)]
pub struct Set {
	inner: Arc<SetInner>,
}

impl fmt::Debug for Set {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Set")
			.field("name", &self.inner.options.name)
			.field("len", &self.len())
			.field("clock", &self.inner.clock)
			.finish()
	}
}

/// Handle to one instance. Cheap to clone; stays valid as an identifier after
/// the instance is deleted, but signalling it then fails.
#[derive(Clone)]
pub struct Instance {
	id: InstanceId,
	set: Weak<SetInner>,
}

impl PartialEq for Instance {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id && Weak::ptr_eq(&self.set, &other.set)
	}
}

impl Eq for Instance {}

impl std::hash::Hash for Instance {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Debug for Instance {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Instance").field("id", &self.id).field("state", &self.state()).finish()
	}
}

impl Instance {
	pub fn id(&self) -> InstanceId {
		self.id
	}

	/// Current state, or `None` once deleted or the set is gone.
	pub fn state(&self) -> Option<Index> {
		let set = self.set.upgrade()?;
		let state = set.state.lock();
		state.instances.get(&self.id).map(|e| e.state)
	}

	/// Sends a signal.
	///
	/// Returns the new state when a transition fired. A signal the current
	/// state does not declare leaves the state untouched and runs no action;
	/// it yields `Ok(None)` or [`FsmError::UnknownTransition`] depending on
	/// [`Options::ignore_undefined_signals`].
	pub fn signal(&self, signal: Signal) -> Result<Option<Index>> {
		let Some(set) = self.set.upgrade() else {
			return Err(FsmError::Stopped);
		};
		set.signal(self.id, signal)
	}
}

impl Set {
	/// Creates a set and subscribes it to `clock`.
	pub fn new(spec: Arc<Spec>, clock: Clock, options: Options) -> Self {
		let inner = Arc::new(SetInner {
			spec,
			clock: clock.clone(),
			options,
			state: Mutex::new(SetState::default()),
			action_failures: AtomicU64::new(0),
		});
		clock.subscribe(Arc::downgrade(&inner));
		Self { inner }
	}

	/// Registers a new instance in `initial`.
	pub fn add(&self, initial: Index) -> Result<Instance> {
		if !self.inner.spec.contains(initial) {
			return Err(FsmError::UnknownState(initial));
		}
		let now = self.inner.clock.now();
		let id = {
			let mut state = self.inner.state.lock();
			if state.stopped {
				return Err(FsmError::Stopped);
			}
			state.next_id = state.next_id.wrapping_add(1);
			let id = InstanceId(state.next_id);
			state.instances.insert(
				id,
				Entry {
					state: initial,
					deadline: self.inner.spec.expiry(initial).map(|e| now.saturating_add(e.ttl)),
					flap: None,
				},
			);
			id
		};
		tracing::trace!(set = %self.inner.options.name, %id, state = %self.inner.spec.state_name(initial), "fsm.add");
		Ok(self.handle(id))
	}

	pub fn get(&self, id: InstanceId) -> Option<Instance> {
		self.inner.state.lock().instances.contains_key(&id).then(|| self.handle(id))
	}

	/// Removes an instance. Returns false if it was already gone.
	pub fn delete(&self, id: InstanceId) -> bool {
		self.inner.state.lock().instances.remove(&id).is_some()
	}

	pub fn len(&self) -> usize {
		self.inner.state.lock().instances.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn count_by_state(&self, index: Index) -> usize {
		self.inner.state.lock().instances.values().filter(|e| e.state == index).count()
	}

	/// Instances currently in `index`, in id order.
	pub fn instances_in_state(&self, index: Index) -> Vec<Instance> {
		let ids: Vec<InstanceId> = {
			let state = self.inner.state.lock();
			state.instances.iter().filter(|(_, e)| e.state == index).map(|(id, _)| *id).collect()
		};
		ids.into_iter().map(|id| self.handle(id)).collect()
	}

	pub fn spec(&self) -> &Arc<Spec> {
		&self.inner.spec
	}

	pub fn clock(&self) -> &Clock {
		&self.inner.clock
	}

	/// Number of actions that returned an error so far.
	pub fn action_failures(&self) -> u64 {
		self.inner.action_failures.load(Ordering::Acquire)
	}

	/// Halts the clock and evicts every instance. Safe to call more than once.
	pub fn stop(&self) {
		let evicted = {
			let mut state = self.inner.state.lock();
			if state.stopped {
				return;
			}
			state.stopped = true;
			let n = state.instances.len();
			state.instances.clear();
			n
		};
		self.inner.clock.stop();
		tracing::debug!(set = %self.inner.options.name, evicted, "fsm.set.stop");
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.state.lock().stopped
	}

	fn handle(&self, id: InstanceId) -> Instance {
		Instance {
			id,
			set: Arc::downgrade(&self.inner),
		}
	}
}

impl SetInner {
	fn signal(self: &Arc<Self>, id: InstanceId, signal: Signal) -> Result<Option<Index>> {
		self.apply(id, signal, None)
	}

	/// Fires a transition. With `expiring = Some((state, tick))` the signal is an
	/// expiry collected at `tick` and only applies if the instance is still in
	/// `state` with a deadline at or before `tick`.
	fn apply(self: &Arc<Self>, id: InstanceId, signal: Signal, expiring: Option<(Index, Tick)>) -> Result<Option<Index>> {
		let now = self.clock.now();
		let (from, to, action, flap_raise) = {
			let mut state = self.state.lock();
			if state.stopped {
				return Err(FsmError::Stopped);
			}
			let entry = state.instances.get_mut(&id).ok_or(FsmError::UnknownInstance(id))?;
			if let Some((expected, at)) = expiring
				&& (entry.state != expected || !entry.deadline.is_some_and(|d| at >= d))
			{
				tracing::trace!(set = %self.options.name, %id, at, "fsm.expiry.stale");
				return Ok(None);
			}
			let from = entry.state;
			let Some((to, action)) = self.spec.transition(from, signal) else {
				tracing::trace!(
					set = %self.options.name,
					%id,
					state = %self.spec.state_name(from),
					signal = %self.spec.signal_name(signal),
					"fsm.signal.undefined"
				);
				if self.options.ignore_undefined_signals {
					return Ok(None);
				}
				return Err(FsmError::UnknownTransition { state: from, signal });
			};
			entry.state = to;
			entry.deadline = self.spec.expiry(to).map(|e| now.saturating_add(e.ttl));
			let flap_raise = self.track_flap(entry, from, to);
			(from, to, action, flap_raise)
		};

		tracing::debug!(
			set = %self.options.name,
			%id,
			from = %self.spec.state_name(from),
			to = %self.spec.state_name(to),
			signal = %self.spec.signal_name(signal),
			"fsm.transition"
		);

		let handle = Instance {
			id,
			set: Arc::downgrade(self),
		};
		let result = match action {
			Some(action) => action(&handle).map_err(|source| {
				self.action_failures.fetch_add(1, Ordering::AcqRel);
				FsmError::Action { id, signal, source }
			}),
			None => Ok(()),
		};

		if let Some(raise) = flap_raise {
			tracing::info!(
				set = %self.options.name,
				%id,
				signal = %self.spec.signal_name(raise),
				"fsm.flapping"
			);
			if let Err(err) = self.signal(id, raise) {
				tracing::warn!(set = %self.options.name, %id, error = %err, "fsm.flapping.signal_failed");
			}
		}

		result.map(|()| Some(to))
	}

	fn track_flap(&self, entry: &mut Entry, from: Index, to: Index) -> Option<Signal> {
		let Some(flap) = self.spec.flap(from, to) else {
			entry.flap = None;
			return None;
		};
		let run = match entry.flap {
			Some(run) if run.pair == flap.states => FlapRun {
				pair: run.pair,
				count: run.count + 1,
			},
			_ => FlapRun { pair: flap.states, count: 1 },
		};
		if run.count >= flap.count {
			entry.flap = None;
			Some(flap.raise)
		} else {
			entry.flap = Some(run);
			None
		}
	}

	pub(crate) fn on_tick(self: &Arc<Self>, now: Tick) {
		let expired: Vec<(InstanceId, Index, Signal)> = {
			let state = self.state.lock();
			if state.stopped {
				return;
			}
			state
				.instances
				.iter()
				.filter(|(_, e)| e.deadline.is_some_and(|d| now >= d))
				.filter_map(|(id, e)| self.spec.expiry(e.state).map(|x| (*id, e.state, x.raise)))
				.collect()
		};

		for (id, state, raise) in expired {
			match self.apply(id, raise, Some((state, now))) {
				Ok(_) | Err(FsmError::UnknownInstance(_)) | Err(FsmError::Stopped) => {}
				Err(err) => {
					tracing::warn!(set = %self.options.name, %id, now, error = %err, "fsm.expiry.failed");
				}
			}
		}
	}
}
