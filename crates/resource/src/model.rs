//! Dependency-gated resource lifecycle on the FSM runtime.
//!
//! The model only sequences state. Every transition that needs I/O pushes the
//! instance onto one of five bounded channels and the controller's workers do
//! the rest.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use steward_fsm::{ActionError, Clock, FsmError, Index, Instance, InstanceId, Options, Set, Signal, Spec, State, Tick};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::{ResourceConfig, ResourceOptions};
use crate::error::ResourceError;

pub const REQUESTED: Index = Index(0);
pub const PROVISIONING: Index = Index(1);
pub const WAITING: Index = Index(2);
pub const READY: Index = Index(3);
pub const UNMATCHED: Index = Index(4);
pub const TERMINATING: Index = Index(5);
pub const TERMINATED: Index = Index(6);

pub const FOUND: Signal = Signal(0);
pub const LOST: Signal = Signal(1);
pub const PROVISION: Signal = Signal(2);
pub const DEPENDENCY_MISSING: Signal = Signal(3);
pub const DEPENDENCY_READY: Signal = Signal(4);
pub const TERMINATE: Signal = Signal(5);
pub const CLEANUP: Signal = Signal(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outlet {
	Provision,
	Destroy,
	Pending,
	Ready,
	Cleanup,
}

impl Outlet {
	fn name(self) -> &'static str {
		match self {
			Self::Provision => "provision",
			Self::Destroy => "destroy",
			Self::Pending => "pending",
			Self::Ready => "ready",
			Self::Cleanup => "cleanup",
		}
	}
}

struct Senders {
	provision: mpsc::Sender<Instance>,
	destroy: mpsc::Sender<Instance>,
	pending: mpsc::Sender<Instance>,
	ready: mpsc::Sender<Instance>,
	cleanup: mpsc::Sender<Instance>,
}

impl Senders {
	fn get(&self, outlet: Outlet) -> &mpsc::Sender<Instance> {
		match outlet {
			Outlet::Provision => &self.provision,
			Outlet::Destroy => &self.destroy,
			Outlet::Pending => &self.pending,
			Outlet::Ready => &self.ready,
			Outlet::Cleanup => &self.cleanup,
		}
	}
}

/// Receiving ends of the model's output channels.
#[derive(Debug)]
pub struct Channels {
	pub provision: mpsc::Receiver<Instance>,
	pub destroy: mpsc::Receiver<Instance>,
	pub pending: mpsc::Receiver<Instance>,
	pub ready: mpsc::Receiver<Instance>,
	pub cleanup: mpsc::Receiver<Instance>,
}

/// Shared slot the FSM actions send through. Emptied on stop, which closes every channel.
#[derive(Default)]
struct Outbox {
	senders: Mutex<Option<Senders>>,
}

impl Outbox {
	fn send(&self, outlet: Outlet, instance: &Instance) -> Result<(), ActionError> {
		let senders = self.senders.lock();
		let Some(senders) = senders.as_ref() else {
			return Err(ActionError::new(format!("{} channel closed", outlet.name())));
		};
		match senders.get(outlet).try_send(instance.clone()) {
			Ok(()) => Ok(()),
			Err(TrySendError::Full(_)) => {
				tracing::warn!(outlet = outlet.name(), instance = %instance.id(), "resource.model.dropped");
				Err(ActionError::new(format!("{} channel full", outlet.name())))
			}
			Err(TrySendError::Closed(_)) => Err(ActionError::new(format!("{} channel closed", outlet.name()))),
		}
	}
}

#[derive(Default)]
struct Runtime {
	set: Option<Set>,
	ticking: bool,
	stopped: bool,
}

/// Resource lifecycle model for one controller.
pub struct Model {
	spec: Arc<Spec>,
	tick: Duration,
	outbox: Arc<Outbox>,
	channels: Mutex<Option<Channels>>,
	runtime: Mutex<Runtime>,
}

impl std::fmt::Debug for Model {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Model").field("tick", &self.tick).finish_non_exhaustive()
	}
}

/// Whole ticks covering `duration`, at least one.
pub fn ticks(duration: Duration, tick: Duration) -> Tick {
	let tick = tick.as_millis().max(1);
	let n = duration.as_millis().div_ceil(tick);
	u64::try_from(n).unwrap_or(u64::MAX).max(1)
}

/// Builds the model for a validated config.
pub fn build_model(config: &ResourceConfig) -> Result<Model, ResourceError> {
	Model::new(config.tick(), &config.options)
}

impl Model {
	pub fn new(tick: Duration, options: &ResourceOptions) -> Result<Self, ResourceError> {
		let outbox = Arc::new(Outbox::default());
		let spec = Arc::new(define(&outbox, tick, options)?);

		let buffer = options.channel_buffer.max(1);
		let (provision_tx, provision) = mpsc::channel(buffer);
		let (destroy_tx, destroy) = mpsc::channel(buffer);
		let (pending_tx, pending) = mpsc::channel(buffer);
		let (ready_tx, ready) = mpsc::channel(buffer);
		let (cleanup_tx, cleanup) = mpsc::channel(buffer);
		*outbox.senders.lock() = Some(Senders {
			provision: provision_tx,
			destroy: destroy_tx,
			pending: pending_tx,
			ready: ready_tx,
			cleanup: cleanup_tx,
		});

		Ok(Self {
			spec,
			tick,
			outbox,
			channels: Mutex::new(Some(Channels {
				provision,
				destroy,
				pending,
				ready,
				cleanup,
			})),
			runtime: Mutex::new(Runtime::default()),
		})
	}

	pub fn spec(&self) -> &Arc<Spec> {
		&self.spec
	}

	pub fn tick(&self) -> Duration {
		self.tick
	}

	/// Hands out the receivers. `None` after the first call.
	pub fn take_channels(&self) -> Option<Channels> {
		self.channels.lock().take()
	}

	fn set(&self) -> Result<Set, FsmError> {
		let mut runtime = self.runtime.lock();
		if runtime.stopped {
			return Err(FsmError::Stopped);
		}
		let set = runtime.set.get_or_insert_with(|| {
			let options = Options {
				name: "resource".to_string(),
				..Options::default()
			};
			Set::new(Arc::clone(&self.spec), Clock::new(), options)
		});
		Ok(set.clone())
	}

	/// Starts ticking. Builds the set first if nothing was requested yet.
	pub fn start(&self) -> Result<(), FsmError> {
		let set = self.set()?;
		let mut runtime = self.runtime.lock();
		if runtime.ticking || runtime.stopped {
			return Ok(());
		}
		runtime.ticking = true;
		set.clock().drive(self.tick);
		tracing::debug!(tick_ms = self.tick.as_millis() as u64, "resource.model.start");
		Ok(())
	}

	/// Stops the set and its clock and closes every output channel. Safe to call more than once.
	pub fn stop(&self) {
		let set = {
			let mut runtime = self.runtime.lock();
			if runtime.stopped {
				return;
			}
			runtime.stopped = true;
			runtime.set.take()
		};
		if let Some(set) = set {
			set.stop();
		}
		self.outbox.senders.lock().take();
		tracing::debug!("resource.model.stop");
	}

	pub fn is_stopped(&self) -> bool {
		self.runtime.lock().stopped
	}

	/// New resource that should exist.
	pub fn requested(&self) -> Result<Instance, FsmError> {
		self.set()?.add(REQUESTED)
	}

	/// Observed instance nobody asked for.
	pub fn unmatched(&self) -> Result<Instance, FsmError> {
		self.set()?.add(UNMATCHED)
	}

	pub fn found(&self, instance: &Instance) -> Result<Option<Index>, FsmError> {
		instance.signal(FOUND)
	}

	pub fn lost(&self, instance: &Instance) -> Result<Option<Index>, FsmError> {
		instance.signal(LOST)
	}

	pub fn dependency_missing(&self, instance: &Instance) -> Result<Option<Index>, FsmError> {
		instance.signal(DEPENDENCY_MISSING)
	}

	pub fn dependency_ready(&self, instance: &Instance) -> Result<Option<Index>, FsmError> {
		instance.signal(DEPENDENCY_READY)
	}

	pub fn terminate(&self, instance: &Instance) -> Result<Option<Index>, FsmError> {
		instance.signal(TERMINATE)
	}

	/// Forgets an instance.
	pub fn delete(&self, id: InstanceId) -> bool {
		let set = self.runtime.lock().set.clone();
		set.is_some_and(|set| set.delete(id))
	}

	pub fn count(&self, state: Index) -> usize {
		let set = self.runtime.lock().set.clone();
		set.map_or(0, |set| set.count_by_state(state))
	}

	/// Actions that could not enqueue their instance.
	pub fn dropped_sends(&self) -> u64 {
		let set = self.runtime.lock().set.clone();
		set.map_or(0, |set| set.action_failures())
	}
}

impl Drop for Model {
	fn drop(&mut self) {
		self.stop();
	}
}

fn define(outbox: &Arc<Outbox>, tick: Duration, options: &ResourceOptions) -> Result<Spec, ResourceError> {
	let emit = |outlet: Outlet| {
		let outbox = Arc::clone(outbox);
		move |instance: &Instance| outbox.send(outlet, instance)
	};
	let ttl = |d: Duration| ticks(d, tick);

	let spec = Spec::define([
		State::new(REQUESTED)
			.ttl(ttl(options.wait_before_provision), PROVISION)
			.on(PROVISION, PROVISIONING)
			.action(PROVISION, emit(Outlet::Provision))
			.on(FOUND, READY)
			.action(FOUND, emit(Outlet::Ready))
			.on(TERMINATE, TERMINATING)
			.action(TERMINATE, emit(Outlet::Destroy)),
		State::new(PROVISIONING)
			.ttl(ttl(options.provision_deadline), PROVISION)
			.on(PROVISION, PROVISIONING)
			.action(PROVISION, emit(Outlet::Provision))
			.on(DEPENDENCY_MISSING, WAITING)
			.action(DEPENDENCY_MISSING, emit(Outlet::Pending))
			.on(FOUND, READY)
			.action(FOUND, emit(Outlet::Ready))
			.on(TERMINATE, TERMINATING)
			.action(TERMINATE, emit(Outlet::Destroy)),
		State::new(WAITING)
			.ttl(ttl(options.dependency_recheck), DEPENDENCY_READY)
			.on(DEPENDENCY_READY, PROVISIONING)
			.action(DEPENDENCY_READY, emit(Outlet::Provision))
			.on(FOUND, READY)
			.action(FOUND, emit(Outlet::Ready))
			.on(TERMINATE, TERMINATING)
			.action(TERMINATE, emit(Outlet::Destroy)),
		State::new(READY)
			.on(FOUND, READY)
			.on(LOST, REQUESTED)
			.on(TERMINATE, TERMINATING)
			.action(TERMINATE, emit(Outlet::Destroy)),
		State::new(UNMATCHED)
			.ttl(ttl(options.wait_before_destroy), TERMINATE)
			.on(TERMINATE, TERMINATING)
			.action(TERMINATE, emit(Outlet::Destroy))
			.on(LOST, TERMINATED),
		State::new(TERMINATING)
			.ttl(ttl(options.destroy_deadline), TERMINATE)
			.on(TERMINATE, TERMINATING)
			.action(TERMINATE, emit(Outlet::Destroy))
			.on(LOST, TERMINATED),
		State::new(TERMINATED)
			.ttl(ttl(options.wait_before_cleanup), CLEANUP)
			.on(CLEANUP, TERMINATED)
			.action(CLEANUP, emit(Outlet::Cleanup)),
	])?
	.with_state_names([
		(REQUESTED, "REQUESTED"),
		(PROVISIONING, "PROVISIONING"),
		(WAITING, "WAITING"),
		(READY, "READY"),
		(UNMATCHED, "UNMATCHED"),
		(TERMINATING, "TERMINATING"),
		(TERMINATED, "TERMINATED"),
	])
	.with_signal_names([
		(FOUND, "FOUND"),
		(LOST, "LOST"),
		(PROVISION, "PROVISION"),
		(DEPENDENCY_MISSING, "DEPENDENCY_MISSING"),
		(DEPENDENCY_READY, "DEPENDENCY_READY"),
		(TERMINATE, "TERMINATE"),
		(CLEANUP, "CLEANUP"),
	]);
	Ok(spec)
}
