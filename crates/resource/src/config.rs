//! Resource spec decoding and validation.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_controller::ObserveSpec;
use steward_controller::duration_ms;
use steward_types::{InstanceSpec, Spec};

use crate::error::ResourceError;

/// How to provision and observe one named resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSpec {
	/// Instance plugin used to provision; also observed unless `observe.plugin` is set.
	pub plugin: String,
	/// Template for provisioned instances.
	pub instance: InstanceSpec,
	pub observe: ObserveSpec,
	/// Resources that must be ready first.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub depends: Vec<String>,
}

impl AccessSpec {
	/// Observation parameters with the plugin name filled in.
	pub fn observe_spec(&self) -> ObserveSpec {
		let mut observe = self.observe.clone();
		if observe.plugin.is_empty() {
			observe.plugin = self.plugin.clone();
		}
		observe
	}
}

/// Named accessors keyed by resource name.
pub type ResourceProperties = BTreeMap<String, AccessSpec>;

/// Timing knobs for the resource model. Durations are milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOptions {
	#[serde(with = "duration_ms")]
	pub wait_before_provision: Duration,
	#[serde(with = "duration_ms")]
	pub wait_before_destroy: Duration,
	/// Re-provision if the instance has not been observed by then.
	#[serde(with = "duration_ms")]
	pub provision_deadline: Duration,
	/// Re-destroy if the instance is still observed by then.
	#[serde(with = "duration_ms")]
	pub destroy_deadline: Duration,
	#[serde(with = "duration_ms")]
	pub wait_before_cleanup: Duration,
	#[serde(with = "duration_ms")]
	pub dependency_recheck: Duration,
	/// Capacity of each model output channel.
	pub channel_buffer: usize,
}

impl Default for ResourceOptions {
	fn default() -> Self {
		Self {
			wait_before_provision: Duration::from_secs(1),
			wait_before_destroy: Duration::from_secs(10),
			provision_deadline: Duration::from_secs(60),
			destroy_deadline: Duration::from_secs(60),
			wait_before_cleanup: Duration::from_secs(1),
			dependency_recheck: Duration::from_secs(5),
			channel_buffer: 16,
		}
	}
}

/// Decoded and validated resource spec.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
	pub properties: ResourceProperties,
	pub options: ResourceOptions,
	/// Provisioning order: every resource after all of its dependencies.
	pub order: Vec<String>,
}

impl ResourceConfig {
	pub fn from_spec(spec: &Spec) -> Result<Self, ResourceError> {
		let properties: ResourceProperties = spec.properties.as_ref().ok_or(ResourceError::MissingProperties)?.decode()?;
		let options = match &spec.options {
			Some(options) if !options.is_null() => options.decode()?,
			_ => ResourceOptions::default(),
		};
		Self::new(properties, options)
	}

	pub fn new(properties: ResourceProperties, options: ResourceOptions) -> Result<Self, ResourceError> {
		for (name, access) in &properties {
			if access.plugin.trim().is_empty() {
				return Err(ResourceError::MissingPlugin(name.clone()));
			}
			if access.observe.observe_interval.is_zero() {
				return Err(ResourceError::ZeroInterval(name.clone()));
			}
			if let Some(missing) = access.depends.iter().find(|d| !properties.contains_key(*d)) {
				return Err(ResourceError::UnknownDependency {
					resource: name.clone(),
					dependency: missing.clone(),
				});
			}
		}
		let order = topological_order(&properties)?;
		Ok(Self { properties, options, order })
	}

	/// Largest observation interval; the model's tick size.
	pub fn tick(&self) -> Duration {
		self.properties
			.values()
			.map(|a| a.observe.observe_interval)
			.max()
			.unwrap_or_else(|| ObserveSpec::default().observe_interval)
	}
}

/// Depth-first ordering; names are visited in sorted order so the result is stable.
fn topological_order(properties: &ResourceProperties) -> Result<Vec<String>, ResourceError> {
	fn visit<'a>(
		name: &'a str,
		properties: &'a ResourceProperties,
		visiting: &mut BTreeSet<&'a str>,
		done: &mut BTreeSet<&'a str>,
		order: &mut Vec<String>,
	) -> Result<(), ResourceError> {
		if done.contains(name) {
			return Ok(());
		}
		if !visiting.insert(name) {
			return Err(ResourceError::Cycle(name.to_string()));
		}
		if let Some(access) = properties.get(name) {
			for dep in &access.depends {
				visit(dep, properties, visiting, done, order)?;
			}
		}
		visiting.remove(name);
		done.insert(name);
		order.push(name.to_string());
		Ok(())
	}

	let mut visiting = BTreeSet::new();
	let mut done = BTreeSet::new();
	let mut order = Vec::with_capacity(properties.len());
	for name in properties.keys() {
		visit(name, properties, &mut visiting, &mut done, &mut order)?;
	}
	Ok(order)
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;
	use steward_types::Any;

	use super::*;

	fn spec(properties: serde_json::Value) -> Spec {
		Spec::new("resource", "stack").with_properties(Any::from_value(properties))
	}

	#[test]
	fn dependencies_come_first_in_order() {
		let config = ResourceConfig::from_spec(&spec(json!({
			"vm": { "plugin": "compute", "depends": ["disk", "net"] },
			"disk": { "plugin": "storage", "depends": ["net"] },
			"net": { "plugin": "network" },
		})))
		.unwrap();
		assert_eq!(config.order, vec!["net", "disk", "vm"]);
		assert_eq!(config.options, ResourceOptions::default());
		assert_eq!(config.properties["vm"].observe_spec().plugin, "compute");
	}

	#[test]
	fn options_decode_as_milliseconds() {
		let spec = spec(json!({ "net": { "plugin": "network", "observe": { "observe_interval": 250 } } }))
			.with_options(Any::from_value(json!({ "wait_before_provision": 100, "channel_buffer": 4 })));
		let config = ResourceConfig::from_spec(&spec).unwrap();
		assert_eq!(config.options.wait_before_provision, Duration::from_millis(100));
		assert_eq!(config.options.channel_buffer, 4);
		assert_eq!(config.options.dependency_recheck, ResourceOptions::default().dependency_recheck);
		assert_eq!(config.tick(), Duration::from_millis(250));
	}

	#[test]
	fn huge_durations_are_accepted() {
		let spec = spec(json!({ "net": { "plugin": "network", "observe": { "observe_interval": u64::MAX } } }))
			.with_options(Any::from_value(json!({ "wait_before_provision": u64::MAX, "destroy_deadline": u64::MAX })));
		let config = ResourceConfig::from_spec(&spec).unwrap();
		assert_eq!(config.tick(), Duration::from_millis(u64::MAX));
		assert_eq!(config.options.wait_before_provision, Duration::from_millis(u64::MAX));
	}

	#[test]
	fn invalid_graphs_are_rejected() {
		let err = ResourceConfig::from_spec(&spec(json!({ "a": { "plugin": "p", "depends": ["ghost"] } }))).unwrap_err();
		assert!(matches!(err, ResourceError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));

		let err = ResourceConfig::from_spec(&spec(json!({
			"a": { "plugin": "p", "depends": ["b"] },
			"b": { "plugin": "p", "depends": ["a"] },
		})))
		.unwrap_err();
		assert!(matches!(err, ResourceError::Cycle(_)));

		let err = ResourceConfig::from_spec(&spec(json!({ "a": {} }))).unwrap_err();
		assert!(matches!(err, ResourceError::MissingPlugin(ref name) if name == "a"));

		let err = ResourceConfig::from_spec(&spec(json!({ "a": { "plugin": "p", "observe": { "observe_interval": 0 } } }))).unwrap_err();
		assert!(matches!(err, ResourceError::ZeroInterval(ref name) if name == "a"));

		let err = ResourceConfig::from_spec(&Spec::new("resource", "empty")).unwrap_err();
		assert!(matches!(err, ResourceError::MissingProperties));

		let err = ResourceConfig::from_spec(&spec(json!({ "a": { "plugin": 7 } }))).unwrap_err();
		assert!(matches!(err, ResourceError::Decode(_)));
	}
}
