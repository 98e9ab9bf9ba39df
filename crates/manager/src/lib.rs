//! Leadership-gated execution of mutating operations.
//!
//! # Purpose
//!
//! - Guarantee that only the elected leader reconciles, and that no
//!   operation runs concurrently with a leadership transition.
//! - Keep the authoritative set of committed specs in a snapshot store so a
//!   new leader can take over where the previous one stopped.
//!
//! # Mental model
//!
//! - A [`LeadershipDetector`](steward_types::LeadershipDetector) emits raw
//!   events. The normalizer task turns them into flips, downgrading on any
//!   uncertainty.
//! - The queue task owns every mutation: user operations arrive as queued
//!   ops with a reply channel, and flips arrive on a second channel. On
//!   gaining leadership it reloads [`GlobalSpec`] and re-commits every
//!   record; on losing it frees every group and controller object.
//! - [`Manager`] implements [`GroupPlugin`](steward_types::GroupPlugin) and
//!   hands out [`ControllerProxy`] handles for registered controllers.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`Manager`] | Leadership gate | mutations MUST only run while leader | [`Manager::start`] |
//! | [`GlobalSpec`] | Persisted spec index | memory MUST NOT change when a save fails | [`GlobalSpec::update`] |
//! | [`FileLeadership`] | File-based detector | unreadable file MUST report `Unknown` | [`FileLeadership::new`] |
//! | [`FileStore`] | File-based snapshot store | saves MUST be atomic renames | [`FileStore::new`] |
//!
//! # Invariants
//!
//! 1. An `Unknown` leadership event downgrades a leader to not-leader.
//!    - Enforced in: `Normalizer::observe`
//!    - Tested by: `manager::tests::unknown_status_downgrades_leadership`
//! 2. Leadership transfer frees on the old leader before the new one commits.
//!    - Enforced in: `work_queue`
//!    - Tested by: `manager::tests::leadership_transfer_frees_then_commits`
//! 3. A failed persist leaves the in-memory index and the backend untouched.
//!    - Enforced in: `GlobalSpec::update`
//!    - Tested by: `manager::tests::persistence_failure_changes_nothing`
//! 4. A downgrade observed while a gain is being replayed is never overwritten.
//!    - Enforced in: `Lease::promote`
//!    - Tested by: `manager::tests::downgrade_during_replay_is_not_overwritten`
//!
//! # Concurrency
//!
//! - Two tasks per started manager: the normalizer and the queue.
//! - The spec index lock is a `tokio::sync::Mutex` held across store I/O.
//!   Registries use `parking_lot` locks, never held across an await.

mod error;
mod file_store;
pub mod global_spec;
mod leadership;
mod manager;
mod proxy;

pub use error::{ManagerError, Result};
pub use file_store::FileStore;
pub use global_spec::{GlobalSpec, Record, SpecKey};
pub use leadership::FileLeadership;
pub use manager::{Manager, ManagerOptions};
pub use proxy::ControllerProxy;
