//! Time-driven finite state machines.
//!
//! # Purpose
//!
//! - Model per-entity lifecycles as explicit transition tables with per-state expiry.
//! - Host many concurrently-live instances on one logical clock.
//! - Sequence state and signal intent; side effects belong to actions, never to the engine.
//!
//! # Mental model
//!
//! - A [`Spec`] is a validated table of [`State`]s. Each state maps [`Signal`]s to target
//!   [`Index`]es, may attach an [`Action`] to any of those edges, and may carry an
//!   [`Expiry`] that raises a signal after a number of ticks.
//! - A [`Set`] owns instances of one spec and subscribes to one [`Clock`]. Every tick it
//!   raises the expiry signal of each instance whose deadline has been reached.
//! - An [`Instance`] is a handle; sending it a signal either fires a declared edge or does
//!   nothing.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`Spec`] | Transition table | MUST only reference defined states | [`Spec::define`] |
//! | [`Set`] | Live instances on one clock | MUST evict everything on stop | [`Set::add`], [`Set::stop`] |
//! | [`Clock`] | Shared tick source | MUST deliver ticks in order to every live set | [`Clock::tick`], [`Clock::wall`] |
//! | [`Instance`] | Handle to one entity | state MUST always be a defined index | [`Instance::signal`] |
//!
//! # Invariants
//!
//! 1. Transitions happen only along declared edges or expiry/flap signals.
//!    - Enforced in: `SetInner::signal`
//!    - Tested by: `tests::undeclared_signal_is_a_noop`
//! 2. An instance entering a state with ttl `d` at tick `t` receives its expiry signal on
//!    the first tick `>= t + d` and never before.
//!    - Enforced in: `SetInner::on_tick`
//!    - Tested by: `tests::expiry_fires_after_ttl_not_before`
//! 3. Action failures never halt the set.
//!    - Enforced in: `SetInner::on_tick`
//!    - Tested by: `tests::failing_action_is_counted_and_set_keeps_ticking`
//! 4. An expiry collected on a tick is dropped if the instance moved before it was applied.
//!    - Enforced in: `SetInner::apply`
//!    - Tested by: `tests::expiry_skips_instances_that_moved_since_the_tick_began`
//!
//! # Concurrency and ordering
//!
//! - Instance state lives behind one mutex per set. Actions run after it is released, so an
//!   action may signal other instances of the same set.
//! - Expired instances of one tick fire in ascending id order.

mod clock;
mod error;
mod set;
mod spec;

pub use clock::Clock;
pub use error::{ActionError, DefineError, FsmError, Result};
pub use set::{Instance, InstanceId, Options, Set};
pub use spec::{Action, Expiry, Flap, Index, Signal, Spec, State, Tick};

#[cfg(test)]
mod tests;
