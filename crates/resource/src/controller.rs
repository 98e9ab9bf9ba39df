//! Collection hooks that reconcile named resources against instance plugins.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use steward_controller::{
	Alloc, Collection, CollectionHooks, Controller, ControllerError, InstanceObserver, LeaderCheck, Managed, Result,
};
use steward_fsm::Instance;
use steward_types::{Attachment, Description, DestroyContext, InstanceId, InstanceSpec, PluginError, PluginLookup, Spec};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ResourceConfig;
use crate::model::{self, Model, READY};

/// Kind string resource specs are committed under.
pub const RESOURCE_KIND: &str = "resource";

/// Tag stamped on provisioned instances naming the resource they realize.
pub const RESOURCE_TAG: &str = "steward.resource";

const DATA_RESOURCE: &str = "resource";
const DATA_INSTANCE: &str = "instance";
const DATA_STATUS: &str = "status";

/// Controller that allocates one resource collection per spec name.
pub fn resource_controller(name: impl Into<String>, plugins: Arc<dyn PluginLookup>, leader: LeaderCheck) -> Controller {
	let name = name.into();
	let controller_name = name.clone();
	let alloc: Alloc = Arc::new(move |spec: &Spec| {
		let hooks = Arc::new(ResourceHooks::new(
			format!("{controller_name}/{}", spec.metadata.name),
			Arc::clone(&plugins),
			Arc::clone(&leader),
		));
		Ok(Arc::new(Collection::new(RESOURCE_KIND, spec.metadata.name.clone(), hooks)) as Arc<dyn Managed>)
	});
	Controller::new(name, alloc, None)
}

/// Model and observers owned by one run of the control loop.
struct Active {
	generation: u64,
	model: Arc<Model>,
	observers: Vec<InstanceObserver>,
}

impl Active {
	fn halt(&self) {
		for observer in &self.observers {
			observer.stop();
		}
		self.model.stop();
	}
}

/// Resource-specific behaviour for a [`Collection`].
pub struct ResourceHooks {
	name: String,
	plugins: Arc<dyn PluginLookup>,
	leader: LeaderCheck,
	config: RwLock<Option<Arc<ResourceConfig>>>,
	generation: AtomicU64,
	active: Mutex<Option<Active>>,
}

impl std::fmt::Debug for ResourceHooks {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResourceHooks").field("name", &self.name).finish_non_exhaustive()
	}
}

fn data_str<'a>(data: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
	data.get(key).and_then(Value::as_str)
}

impl ResourceHooks {
	pub fn new(name: impl Into<String>, plugins: Arc<dyn PluginLookup>, leader: LeaderCheck) -> Self {
		Self {
			name: name.into(),
			plugins,
			leader,
			config: RwLock::new(None),
			generation: AtomicU64::new(0),
			active: Mutex::new(None),
		}
	}

	fn config(&self) -> Option<Arc<ResourceConfig>> {
		self.config.read().clone()
	}

	fn observed(&self, collection: &Collection, model: &Model, resource: &str, snapshot: &[Description]) {
		let present: BTreeSet<&str> = snapshot.iter().map(|d| d.id.0.as_str()).collect();
		let mut claimed: BTreeSet<String> = BTreeSet::new();
		let mut tracked = Vec::new();
		collection.visit(|item| {
			if let Some(id) = data_str(&item.data, DATA_INSTANCE) {
				claimed.insert(id.to_string());
			}
			if data_str(&item.data, DATA_RESOURCE) == Some(resource) {
				tracked.push(item.clone());
			}
			true
		});

		for item in tracked {
			let primary = item.key == resource;
			match data_str(&item.data, DATA_INSTANCE).map(str::to_string) {
				Some(id) if present.contains(id.as_str()) => {
					if primary && let Err(err) = model.found(&item.instance) {
						tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.found.failed");
					}
				}
				Some(_) => match model.lost(&item.instance) {
					Ok(Some(next)) if next != model::TERMINATED => {
						collection.update(&item.key, |item| {
							item.data.remove(DATA_INSTANCE);
						});
					}
					Ok(_) => {}
					Err(err) => tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.lost.failed"),
				},
				None if primary => {
					let candidate = snapshot.iter().find(|d| !claimed.contains(&d.id.0));
					if let Some(description) = candidate {
						claimed.insert(description.id.0.clone());
						collection.update(&item.key, |item| {
							item.data.insert(DATA_INSTANCE.to_string(), json!(description.id.0));
						});
						if let Err(err) = model.found(&item.instance) {
							tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.found.failed");
						}
					}
				}
				None => {}
			}
		}

		for description in snapshot.iter().filter(|d| !claimed.contains(&d.id.0)) {
			match model.unmatched() {
				Ok(instance) => {
					let key = format!("{resource}/{}", description.id);
					let data = BTreeMap::from([
						(DATA_RESOURCE.to_string(), json!(resource)),
						(DATA_INSTANCE.to_string(), json!(description.id.0)),
					]);
					tracing::info!(resource = %self.name, key = %key, "resource.unmatched");
					collection.put(key, instance, Arc::clone(model.spec()), data);
				}
				Err(err) => tracing::warn!(resource = %self.name, error = %err, "resource.unmatched.failed"),
			}
		}
	}

	async fn provision(&self, collection: &Collection, model: &Model, config: &ResourceConfig, instance: Instance) {
		let Some(item) = collection.get_by_instance(instance.id()) else {
			return;
		};
		let Some(access) = data_str(&item.data, DATA_RESOURCE).and_then(|r| config.properties.get(r)) else {
			return;
		};
		if data_str(&item.data, DATA_INSTANCE).is_some() {
			tracing::debug!(resource = %self.name, key = %item.key, "resource.provision.pending_observation");
			return;
		}

		let mut attachments = Vec::with_capacity(access.depends.len());
		for dependency in &access.depends {
			let ready = collection.get(dependency).and_then(|dep| {
				let id = data_str(&dep.data, DATA_INSTANCE)?.to_string();
				(dep.instance.state() == Some(READY)).then_some(id)
			});
			match ready {
				Some(id) => attachments.push(Attachment {
					id,
					kind: dependency.clone(),
				}),
				None => {
					tracing::debug!(resource = %self.name, key = %item.key, dependency = %dependency, "resource.dependency.missing");
					if let Err(err) = model.dependency_missing(&instance) {
						tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.signal.failed");
					}
					return;
				}
			}
		}

		let mut tags = access.instance.tags.clone();
		tags.extend(access.observe.select.clone());
		tags.insert(RESOURCE_TAG.to_string(), item.key.clone());
		let spec = InstanceSpec {
			tags,
			logical_id: access.instance.logical_id.clone().or_else(|| Some(item.key.clone())),
			attachments,
			..access.instance.clone()
		};

		let result = match self.plugins.instance(&access.plugin) {
			Ok(plugin) => plugin.provision(spec).await,
			Err(err) => Err(err),
		};
		match result {
			Ok(id) => {
				// The collection may have been reset for a newer run while the plugin call was out.
				let mut recorded = false;
				collection.update(&item.key, |current| {
					if current.instance == instance {
						current.data.insert(DATA_INSTANCE.to_string(), json!(id.0));
						recorded = true;
					}
				});
				if recorded {
					tracing::info!(resource = %self.name, key = %item.key, instance = %id, "resource.provisioned");
				} else {
					tracing::info!(resource = %self.name, key = %item.key, instance = %id, "resource.provisioned.superseded");
				}
			}
			Err(err) => {
				tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.provision.failed");
			}
		}
	}

	async fn destroy_item(&self, config: &ResourceConfig, data: &BTreeMap<String, Value>) -> std::result::Result<bool, PluginError> {
		let Some(id) = data_str(data, DATA_INSTANCE) else {
			return Ok(false);
		};
		let Some(access) = data_str(data, DATA_RESOURCE).and_then(|r| config.properties.get(r)) else {
			return Ok(false);
		};
		let plugin = self.plugins.instance(&access.plugin)?;
		plugin.destroy(&InstanceId(id.to_string()), DestroyContext::Terminate).await?;
		Ok(true)
	}

	async fn destroy(&self, collection: &Collection, model: &Model, config: &ResourceConfig, instance: Instance) {
		let Some(item) = collection.get_by_instance(instance.id()) else {
			return;
		};
		match self.destroy_item(config, &item.data).await {
			Ok(true) => tracing::info!(resource = %self.name, key = %item.key, "resource.destroyed"),
			Ok(false) => {
				if let Err(err) = model.lost(&instance) {
					tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.signal.failed");
				}
			}
			Err(err) => tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.destroy.failed"),
		}
	}

	fn record_status(&self, collection: &Collection, instance: &Instance, status: &str) {
		let Some(item) = collection.get_by_instance(instance.id()) else {
			return;
		};
		collection.update(&item.key, |item| {
			item.data.insert(DATA_STATUS.to_string(), json!(status));
		});
		collection.updater().put(format!("status/{}", item.key), json!(status));
		tracing::debug!(resource = %self.name, key = %item.key, status, "resource.status");
	}

	fn cleanup(&self, collection: &Collection, model: &Model, instance: &Instance) {
		if let Some(item) = collection.get_by_instance(instance.id()) {
			collection.delete(&item.key);
			collection.updater().remove(format!("status/{}", item.key));
			tracing::debug!(resource = %self.name, key = %item.key, "resource.cleanup");
		}
		model.delete(instance.id());
	}

	fn shutdown(&self) {
		let active = self.active.lock().take();
		if let Some(active) = active {
			active.halt();
		}
	}

	/// Tears down the run's state unless a newer run already replaced it.
	fn retire(&self, generation: u64) {
		let active = {
			let mut slot = self.active.lock();
			match slot.as_ref() {
				Some(active) if active.generation == generation => slot.take(),
				_ => None,
			}
		};
		if let Some(active) = active {
			active.halt();
		}
	}
}

#[async_trait]
impl CollectionHooks for ResourceHooks {
	fn validate(&self, spec: &Spec) -> Result<()> {
		ResourceConfig::from_spec(spec).map(|_| ()).map_err(ControllerError::from)
	}

	fn update_spec(&self, spec: &Spec) -> Result<()> {
		let config = ResourceConfig::from_spec(spec)?;
		*self.config.write() = Some(Arc::new(config));
		Ok(())
	}

	async fn run(&self, collection: Collection, token: CancellationToken) {
		let Some(config) = self.config() else {
			tracing::warn!(resource = %self.name, "resource.run.unconfigured");
			return;
		};
		let model = match model::build_model(&config) {
			Ok(model) => Arc::new(model),
			Err(err) => {
				tracing::error!(resource = %self.name, error = %err, "resource.model.invalid");
				return;
			}
		};
		let Some(mut channels) = model.take_channels() else {
			return;
		};
		let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

		let (observed_tx, mut observed_rx) = mpsc::channel::<(String, Vec<Description>)>(config.order.len().max(1));
		let mut observers = Vec::with_capacity(config.order.len());
		for name in &config.order {
			let access = &config.properties[name];
			let observer = InstanceObserver::new(format!("{}/{name}", self.name), access.observe_spec(), Arc::clone(&self.plugins), Arc::clone(&self.leader));
			let mut rx = observer.observations();
			let tx = observed_tx.clone();
			let forward_token = token.clone();
			let resource = name.clone();
			tokio::spawn(async move {
				loop {
					tokio::select! {
						_ = forward_token.cancelled() => break,
						changed = rx.changed() => {
							if changed.is_err() {
								break;
							}
							let snapshot = rx.borrow_and_update().clone();
							if tx.send((resource.clone(), snapshot)).await.is_err() {
								break;
							}
						}
					}
				}
			});
			observer.pause(collection.is_paused());
			observer.start();
			observers.push(observer);
		}
		drop(observed_tx);

		for name in &config.order {
			match model.requested() {
				Ok(instance) => {
					let data = BTreeMap::from([(DATA_RESOURCE.to_string(), json!(name))]);
					collection.put(name.clone(), instance, Arc::clone(model.spec()), data);
				}
				Err(err) => tracing::warn!(resource = %self.name, key = %name, error = %err, "resource.request.failed"),
			}
		}
		if let Err(err) = model.start() {
			tracing::warn!(resource = %self.name, error = %err, "resource.model.start_failed");
		}
		let current = Active {
			generation,
			model: Arc::clone(&model),
			observers,
		};
		let stale = {
			let mut slot = self.active.lock();
			if token.is_cancelled() { Some(current) } else { slot.replace(current) }
		};
		if let Some(stale) = stale {
			stale.halt();
		}
		tracing::info!(resource = %self.name, generation, resources = config.order.len(), "resource.run.start");

		loop {
			tokio::select! {
				biased;
				_ = token.cancelled() => break,
				Some((resource, snapshot)) = observed_rx.recv() => self.observed(&collection, &model, &resource, &snapshot),
				Some(instance) = channels.destroy.recv() => self.destroy(&collection, &model, &config, instance).await,
				Some(instance) = channels.provision.recv() => self.provision(&collection, &model, &config, instance).await,
				Some(instance) = channels.pending.recv() => self.record_status(&collection, &instance, "waiting"),
				Some(instance) = channels.ready.recv() => self.record_status(&collection, &instance, "ready"),
				Some(instance) = channels.cleanup.recv() => self.cleanup(&collection, &model, &instance),
				else => break,
			}
		}

		self.retire(generation);
		model.stop();
		tracing::info!(resource = %self.name, generation, "resource.run.exit");
	}

	fn stop(&self) {
		self.shutdown();
	}

	fn pause(&self, paused: bool) {
		if let Some(active) = self.active.lock().as_ref() {
			for observer in &active.observers {
				observer.pause(paused);
			}
		}
	}

	async fn terminate(&self, collection: &Collection) -> Result<()> {
		let Some(config) = self.config() else {
			return Ok(());
		};
		let mut first_error = None;
		for name in config.order.iter().rev() {
			let mut items = Vec::new();
			collection.visit(|item| {
				if data_str(&item.data, DATA_RESOURCE) == Some(name.as_str()) {
					items.push(item.clone());
				}
				true
			});
			for item in items {
				match self.destroy_item(&config, &item.data).await {
					Ok(destroyed) => {
						if destroyed {
							tracing::info!(resource = %self.name, key = %item.key, "resource.terminate.destroyed");
						}
					}
					Err(err) => {
						tracing::warn!(resource = %self.name, key = %item.key, error = %err, "resource.terminate.failed");
						first_error.get_or_insert(err);
					}
				}
			}
		}
		match first_error {
			Some(err) => Err(ControllerError::Plugin(err)),
			None => Ok(()),
		}
	}
}
