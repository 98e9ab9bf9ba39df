//! Managed-object controllers and the polling primitives that drive them.
//!
//! # Purpose
//!
//! - Bind exactly one control loop to each named spec and hand it off safely
//!   when the spec is re-committed.
//! - Run periodic reconciliation work without overlap, with advisory errors.
//! - Snapshot external instances and expose drift through set differences.
//!
//! # Mental model
//!
//! - A [`Poller`] is a single loop: tick, check guard, await work.
//! - An [`InstanceObserver`] is a poller whose work publishes the latest
//!   `describe_instances` snapshot into a latest-wins slot.
//! - A [`Managed`] is one control loop. [`Collection`] is the reusable
//!   implementation that tracks FSM-backed [`Item`]s and delegates domain
//!   logic to [`CollectionHooks`].
//! - A [`Controller`] maps spec keys to managed loops and implements
//!   [`steward_types::ControllerPlugin`].
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`Controller`] | Registry of managed loops | MUST hold at most one running loop per key | [`Controller::commit`] |
//! | [`Collection`] | Item-tracking managed loop | MUST validate before side effects | [`Managed::enforce`] |
//! | [`Poller`] | Periodic runner | work MUST NOT overlap itself | [`Poller::run`] |
//! | [`InstanceObserver`] | Snapshot publisher | MUST only poll while leader and unpaused | [`InstanceObserver::start`] |
//!
//! # Invariants
//!
//! 1. At most one managed loop per key is running at any instant.
//!    - Enforced in: `Controller::commit` (per-key gate) and `Controller::swap_for_enforce`
//!    - Tested by: `controller::tests::at_most_one_managed_runs_per_key`
//! 2. A replacement loop inherits the replaced loop's current spec as its previous spec.
//!    - Enforced in: `Controller::swap_for_enforce`
//!    - Tested by: `controller::tests::swap_carries_previous_spec_forward`
//! 3. Enforce rejects invalid specs before touching items or the run task.
//!    - Enforced in: `Collection::enforce`
//!    - Tested by: `collection::tests::invalid_spec_is_rejected_before_any_side_effect`
//! 4. Poll errors never end the loop; only stop or cancellation does.
//!    - Enforced in: `Poller::run`
//!    - Tested by: `poller::tests::guard_is_checked_every_tick_and_errors_do_not_stop_the_loop`
//! 5. Terminate hooks run only after the run loop has exited.
//!    - Enforced in: `Collection::terminate`
//!    - Tested by: `collection::tests::terminate_runs_after_the_loop_has_exited`
//!
//! # Concurrency
//!
//! - Registry and item maps sit behind `parking_lot::RwLock`; no guard is held
//!   across an await. `Managed::start`/`stop` are synchronous so the swap can
//!   happen entirely under the registry write lock.
//! - Enforce and destroy for one key hold that key's `tokio::sync::Mutex` gate
//!   across the managed call; different keys proceed in parallel.

mod collection;
mod controller;
pub mod duration_ms;
mod error;
mod managed;
pub mod metadata;
pub mod observer;
pub mod poller;

pub use collection::{Collection, CollectionHooks, Item};
pub use controller::{Alloc, Controller, KeyFunc, key_by_name};
pub use error::{ControllerError, PollError, Result};
pub use managed::Managed;
pub use metadata::{MetadataUpdater, UpdatableMetadata};
pub use observer::{InstanceObserver, KeyExtractor, KeyTemplate, LeaderCheck, ObserveSpec, TagKey, always_leader, difference, difference_by};
pub use poller::{Poller, TickSender, Ticker, Work, work_fn};
