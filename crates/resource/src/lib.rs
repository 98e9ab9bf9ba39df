//! Dependency-gated provisioning of named resources.
//!
//! # Purpose
//!
//! - Provision one instance per named resource in a spec, each only after the
//!   resources it depends on are ready.
//! - Adopt instances that already exist and destroy surplus ones.
//!
//! # Mental model
//!
//! - [`ResourceConfig`] decodes a spec's properties into accessors and a
//!   provisioning order.
//! - [`Model`] is an FSM set whose actions only enqueue instances onto
//!   bounded [`Channels`]; nothing in the model talks to a plugin.
//! - [`ResourceHooks`] plugs into a [`steward_controller::Collection`]: one
//!   observer per accessor feeds `FOUND`/`LOST`, and the run loop drains the
//!   model channels into plugin calls.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`ResourceConfig`] | Validated accessors | MUST be acyclic with known dependencies | [`ResourceConfig::new`] |
//! | [`Model`] | Resource lifecycle FSM | actions MUST NOT block | [`build_model`] |
//! | [`ResourceHooks`] | Collection behaviour | MUST provision dependencies first | [`resource_controller`] |
//!
//! # Invariants
//!
//! 1. Stopping the model before its first tick provisions nothing.
//!    - Enforced in: `Model::stop`
//!    - Tested by: `model::tests::stop_before_first_tick_provisions_nothing`
//! 2. A resource is provisioned only once every dependency is ready, with one
//!    attachment per dependency.
//!    - Enforced in: `ResourceHooks::provision`
//!    - Tested by: `controller::tests::dependencies_are_provisioned_first_and_attached`
//! 3. Terminate destroys in reverse provisioning order.
//!    - Enforced in: `ResourceHooks::terminate`
//!    - Tested by: `controller::tests::dependencies_are_provisioned_first_and_attached`
//!
//! # Concurrency
//!
//! - FSM actions run on the set's driver task and use `try_send`; a full
//!   channel fails the action instead of stalling the set.
//! - Observer snapshots are fanned into the run loop by one forwarder task
//!   per accessor.

mod config;
mod controller;
mod error;
pub mod model;

pub use config::{AccessSpec, ResourceConfig, ResourceOptions, ResourceProperties};
pub use controller::{RESOURCE_KIND, RESOURCE_TAG, ResourceHooks, resource_controller};
pub use error::ResourceError;
pub use model::{Channels, Model, build_model};
