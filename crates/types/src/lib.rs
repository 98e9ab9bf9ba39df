//! Spec, object, and plugin capability types for the steward reconciliation engine.
//!
//! Everything the engine consumes from the outside world is described here as
//! a narrow capability trait: instance and group backends, controllers, the
//! leadership detector, the snapshot store, and plugin lookup. Transports,
//! discovery, and provider SDKs live behind these traits and never leak into
//! the engine crates.

#![warn(missing_docs)]

pub mod any;
pub mod controller;
pub mod error;
pub mod group;
pub mod instance;
pub mod leadership;
pub mod metadata;
pub mod plugin;
pub mod spec;
pub mod store;

pub use any::{Any, AnyError};
pub use controller::{ControllerPlugin, Operation, Plan};
pub use error::{PluginError, Result};
pub use group::{GROUP_KIND, GroupDescription, GroupId, GroupPlugin, GroupSpec};
pub use instance::{Attachment, Description, DestroyContext, InstanceId, InstancePlugin, InstanceSpec};
pub use leadership::{Leadership, LeadershipDetector, Status};
pub use metadata::MetadataPlugin;
pub use plugin::{PluginLookup, StaticPlugins};
pub use spec::{Dependency, Identity, Metadata, Object, Spec};
pub use store::{MemoryStore, SnapshotStore};
