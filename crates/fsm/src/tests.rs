use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

const IDLE: Index = Index(1);
const RUNNING: Index = Index(2);
const DONE: Index = Index(3);

const START: Signal = Signal(10);
const FINISH: Signal = Signal(11);
const RESET: Signal = Signal(12);
const TIMEOUT: Signal = Signal(13);

fn lifecycle(started: Arc<AtomicUsize>) -> Spec {
	Spec::define([
		State::new(IDLE).on(START, RUNNING).action(START, move |_| {
			started.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}),
		State::new(RUNNING).on(FINISH, DONE).on(RESET, IDLE).on(TIMEOUT, DONE).ttl(3, TIMEOUT),
		State::new(DONE).on(RESET, IDLE),
	])
	.unwrap()
	.with_state_names([(IDLE, "IDLE"), (RUNNING, "RUNNING"), (DONE, "DONE")])
	.with_signal_names([(START, "START"), (FINISH, "FINISH")])
}

fn manual_set(spec: Spec, options: Options) -> (Set, Clock) {
	let clock = Clock::new();
	(Set::new(Arc::new(spec), clock.clone(), options), clock)
}

#[test]
fn define_rejects_dangling_target() {
	let err = Spec::define([State::new(IDLE).on(START, Index(99))]).unwrap_err();
	assert_eq!(
		err,
		DefineError::UnknownTarget {
			state: IDLE,
			signal: START,
			target: Index(99)
		}
	);
}

#[test]
fn define_rejects_expiry_without_edge_and_orphan_actions() {
	let err = Spec::define([State::new(IDLE).ttl(2, TIMEOUT)]).unwrap_err();
	assert_eq!(err, DefineError::ExpiryWithoutTransition { state: IDLE, signal: TIMEOUT });

	let err = Spec::define([State::new(IDLE).action(START, |_| Ok(()))]).unwrap_err();
	assert_eq!(err, DefineError::ActionWithoutTransition { state: IDLE, signal: START });

	let err = Spec::define([State::new(IDLE), State::new(IDLE)]).unwrap_err();
	assert_eq!(err, DefineError::DuplicateState(IDLE));

	let err = Spec::define([State::new(IDLE).on(TIMEOUT, IDLE).ttl(0, TIMEOUT)]).unwrap_err();
	assert_eq!(err, DefineError::ZeroTtl(IDLE));
}

#[test]
fn undeclared_signal_is_a_noop() {
	let started = Arc::new(AtomicUsize::new(0));
	let (set, _clock) = manual_set(lifecycle(started.clone()), Options::default());
	let instance = set.add(IDLE).unwrap();

	assert_eq!(instance.signal(FINISH), Ok(None));
	assert_eq!(instance.state(), Some(IDLE));
	assert_eq!(started.load(Ordering::SeqCst), 0);

	assert_eq!(instance.signal(START), Ok(Some(RUNNING)));
	assert_eq!(started.load(Ordering::SeqCst), 1);

	// START is not declared on RUNNING; the IDLE action must not run again.
	assert_eq!(instance.signal(START), Ok(None));
	assert_eq!(instance.state(), Some(RUNNING));
	assert_eq!(started.load(Ordering::SeqCst), 1);
}

#[test]
fn strict_mode_reports_undeclared_signal_without_moving() {
	let options = Options {
		ignore_undefined_signals: false,
		..Options::default()
	};
	let (set, _clock) = manual_set(lifecycle(Arc::new(AtomicUsize::new(0))), options);
	let instance = set.add(DONE).unwrap();
	assert_eq!(instance.signal(START), Err(FsmError::UnknownTransition { state: DONE, signal: START }));
	assert_eq!(instance.state(), Some(DONE));
}

#[test]
fn add_rejects_undefined_initial_state() {
	let (set, _clock) = manual_set(lifecycle(Arc::new(AtomicUsize::new(0))), Options::default());
	assert_eq!(set.add(Index(42)).unwrap_err(), FsmError::UnknownState(Index(42)));
	assert!(set.is_empty());
}

#[test]
fn expiry_fires_after_ttl_not_before() {
	let (set, clock) = manual_set(lifecycle(Arc::new(AtomicUsize::new(0))), Options::default());
	let instance = set.add(RUNNING).unwrap();

	clock.tick();
	clock.tick();
	assert_eq!(instance.state(), Some(RUNNING));

	clock.tick();
	assert_eq!(instance.state(), Some(DONE));
}

#[test]
fn reentering_a_state_resets_its_deadline() {
	let (set, clock) = manual_set(lifecycle(Arc::new(AtomicUsize::new(0))), Options::default());
	let instance = set.add(RUNNING).unwrap();

	clock.tick();
	clock.tick();
	instance.signal(RESET).unwrap();
	instance.signal(START).unwrap();

	clock.tick();
	clock.tick();
	assert_eq!(instance.state(), Some(RUNNING));
	clock.tick();
	assert_eq!(instance.state(), Some(DONE));
}

#[test]
fn failing_action_is_counted_and_set_keeps_ticking() {
	let spec = Spec::define([
		State::new(IDLE).on(TIMEOUT, DONE).ttl(1, TIMEOUT).action(TIMEOUT, |_| Err(ActionError::new("boom"))),
		State::new(RUNNING).on(TIMEOUT, DONE).ttl(2, TIMEOUT),
		State::new(DONE),
	])
	.unwrap();
	let (set, clock) = manual_set(spec, Options::default());
	let failing = set.add(IDLE).unwrap();
	let healthy = set.add(RUNNING).unwrap();

	clock.tick();
	assert_eq!(failing.state(), Some(DONE));
	assert_eq!(set.action_failures(), 1);

	clock.tick();
	assert_eq!(healthy.state(), Some(DONE));
}

#[test]
fn direct_signal_surfaces_action_failure_after_moving() {
	let spec = Spec::define([
		State::new(IDLE).on(START, RUNNING).action(START, |_| Err(ActionError::new("no capacity"))),
		State::new(RUNNING),
	])
	.unwrap();
	let (set, _clock) = manual_set(spec, Options::default());
	let instance = set.add(IDLE).unwrap();

	let err = instance.signal(START).unwrap_err();
	assert!(matches!(err, FsmError::Action { signal: START, .. }));
	assert_eq!(instance.state(), Some(RUNNING));
}

#[test]
fn actions_may_signal_other_instances() {
	let spec = Arc::new(Spec::define([State::new(IDLE).on(START, RUNNING), State::new(RUNNING)]).unwrap());
	let clock = Clock::new();
	let set = Set::new(spec, clock, Options::default());
	let follower = set.add(IDLE).unwrap();

	let leader_spec = Spec::define([
		State::new(IDLE).on(START, RUNNING).action(START, move |_| {
			follower.signal(START).map(|_| ()).map_err(|e| ActionError::new(e.to_string()))
		}),
		State::new(RUNNING),
	])
	.unwrap();
	let (leaders, _clock) = manual_set(leader_spec, Options::default());
	let leader = leaders.add(IDLE).unwrap();
	leader.signal(START).unwrap();

	assert_eq!(set.count_by_state(RUNNING), 1);
}

#[test]
fn flapping_raises_configured_signal() {
	const PARKED: Index = Index(4);
	const PARK: Signal = Signal(20);

	let spec = Spec::define([
		State::new(IDLE).on(START, RUNNING).on(PARK, PARKED),
		State::new(RUNNING).on(RESET, IDLE).on(PARK, PARKED),
		State::new(PARKED),
	])
	.unwrap()
	.with_flaps([Flap {
		states: (IDLE, RUNNING),
		count: 4,
		raise: PARK,
	}])
	.unwrap();
	let (set, _clock) = manual_set(spec, Options::default());
	let instance = set.add(IDLE).unwrap();

	instance.signal(START).unwrap();
	instance.signal(RESET).unwrap();
	instance.signal(START).unwrap();
	assert_eq!(instance.state(), Some(RUNNING));

	instance.signal(RESET).unwrap();
	assert_eq!(instance.state(), Some(PARKED));
}

#[test]
fn flap_definition_is_validated() {
	let spec = Spec::define([State::new(IDLE).on(START, RUNNING), State::new(RUNNING).on(RESET, IDLE)]).unwrap();
	let err = spec
		.with_flaps([Flap {
			states: (IDLE, RUNNING),
			count: 3,
			raise: TIMEOUT,
		}])
		.unwrap_err();
	assert_eq!(
		err,
		DefineError::FlapWithoutTransition {
			a: IDLE,
			b: RUNNING,
			signal: TIMEOUT
		}
	);
}

#[test]
fn stop_evicts_instances_and_halts_clock() {
	let (set, clock) = manual_set(lifecycle(Arc::new(AtomicUsize::new(0))), Options::default());
	let instance = set.add(RUNNING).unwrap();
	set.add(IDLE).unwrap();

	set.stop();
	set.stop();

	assert!(set.is_empty());
	assert!(clock.is_stopped());
	assert_eq!(instance.state(), None);
	assert_eq!(instance.signal(FINISH), Err(FsmError::Stopped));
	assert_eq!(set.add(IDLE).unwrap_err(), FsmError::Stopped);

	let before = clock.now();
	clock.tick();
	assert_eq!(clock.now(), before);
}

#[test]
fn delete_and_queries() {
	let (set, _clock) = manual_set(lifecycle(Arc::new(AtomicUsize::new(0))), Options::default());
	let a = set.add(IDLE).unwrap();
	let b = set.add(IDLE).unwrap();
	set.add(DONE).unwrap();

	assert_eq!(set.count_by_state(IDLE), 2);
	assert_eq!(set.instances_in_state(IDLE), vec![a.clone(), b.clone()]);
	assert_eq!(set.get(a.id()), Some(a.clone()));

	assert!(set.delete(a.id()));
	assert!(!set.delete(a.id()));
	assert_eq!(a.signal(START), Err(FsmError::UnknownInstance(a.id())));
	assert_eq!(set.len(), 2);
	assert_eq!(set.spec().state_name(IDLE), "IDLE");
	assert_eq!(set.spec().signal_name(RESET), "signal(12)");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn wall_clock_drives_expiry() {
	let clock = Clock::wall(Duration::from_millis(10));
	let set = Set::new(Arc::new(lifecycle(Arc::new(AtomicUsize::new(0)))), clock.clone(), Options::default());
	let instance = set.add(RUNNING).unwrap();

	tokio::time::sleep(Duration::from_millis(15)).await;
	assert_eq!(instance.state(), Some(RUNNING));

	tokio::time::sleep(Duration::from_millis(30)).await;
	assert_eq!(instance.state(), Some(DONE));

	set.stop();
	assert!(clock.is_stopped());
}

#[test]
fn expiry_skips_instances_that_moved_since_the_tick_began() {
	let peer: Arc<parking_lot::Mutex<Option<Instance>>> = Arc::default();
	let slot = Arc::clone(&peer);
	let spec = Spec::define([
		State::new(IDLE).on(START, RUNNING).on(TIMEOUT, DONE),
		State::new(RUNNING)
			.ttl(1, TIMEOUT)
			.on(TIMEOUT, DONE)
			.on(RESET, IDLE)
			.action(TIMEOUT, move |instance| {
				let peer = slot.lock().clone();
				match peer {
					Some(peer) if peer.id() != instance.id() => peer.signal(RESET).map(|_| ()).map_err(|e| ActionError::new(e.to_string())),
					_ => Ok(()),
				}
			}),
		State::new(DONE),
	])
	.unwrap();
	let (set, clock) = manual_set(spec, Options::default());
	let first = set.add(RUNNING).unwrap();
	let second = set.add(RUNNING).unwrap();
	*peer.lock() = Some(second.clone());

	clock.tick();
	assert_eq!(first.state(), Some(DONE));
	// Reset by the first expiry's action; its own expiry was collected before that.
	assert_eq!(second.state(), Some(IDLE));
	assert_eq!(set.action_failures(), 0);
}

#[test]
fn huge_ttls_saturate_instead_of_overflowing() {
	let spec = Spec::define([State::new(RUNNING).on(TIMEOUT, DONE).ttl(u64::MAX, TIMEOUT), State::new(DONE)]).unwrap();
	let (set, clock) = manual_set(spec, Options::default());
	clock.tick();
	clock.tick();

	let instance = set.add(RUNNING).unwrap();
	for _ in 0..10 {
		clock.tick();
	}
	assert_eq!(instance.state(), Some(RUNNING));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn zero_period_wall_clock_still_ticks() {
	let clock = Clock::new();
	clock.drive(Duration::ZERO);
	tokio::time::sleep(Duration::from_millis(5)).await;
	assert!(clock.now() > 0);
	clock.stop();
}
