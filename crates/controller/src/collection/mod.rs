//! Keyed, FSM-backed item collections that implement [`Managed`].
//!
//! A [`Collection`] owns the bookkeeping every item-oriented controller
//! needs: a string-keyed map of [`Item`]s behind a read-write lock, spec
//! continuity, the run-task lifecycle, and a metadata export. Domain
//! behaviour is injected through [`CollectionHooks`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use steward_fsm::{Instance, InstanceId};
use steward_types::{Any, MetadataPlugin, Object, Operation, Plan, Spec};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::managed::Managed;
use crate::metadata::{MetadataUpdater, UpdatableMetadata};

/// Domain behaviour plugged into a [`Collection`].
#[async_trait]
pub trait CollectionHooks: Send + Sync + 'static {
	/// Checks a spec without side effects.
	fn validate(&self, spec: &Spec) -> Result<()>;

	/// Accepts a spec about to be enforced. Runs before anything is reset.
	fn update_spec(&self, spec: &Spec) -> Result<()> {
		self.validate(spec)
	}

	/// Control loop body; must return once `token` is cancelled.
	async fn run(&self, collection: Collection, token: CancellationToken);

	fn stop(&self) {}

	fn pause(&self, paused: bool) {
		let _ = paused;
	}

	/// Destroys whatever the loop created. Called once the loop has exited.
	async fn terminate(&self, collection: &Collection) -> Result<()> {
		let _ = collection;
		Ok(())
	}
}

/// One tracked entity.
#[derive(Debug, Clone)]
pub struct Item {
	pub key: String,
	pub instance: Instance,
	pub spec: Arc<steward_fsm::Spec>,
	pub data: BTreeMap<String, Value>,
}

impl Item {
	/// Name of the current FSM state, or `None` once the instance is gone.
	pub fn state_name(&self) -> Option<String> {
		self.instance.state().map(|s| self.spec.state_name(s))
	}
}

#[derive(Default)]
struct Specs {
	current: Option<Spec>,
	prev: Option<Spec>,
}

struct RunHandle {
	token: CancellationToken,
	task: JoinHandle<()>,
}

struct CollectionInner {
	name: String,
	kind: String,
	hooks: Arc<dyn CollectionHooks>,
	items: RwLock<BTreeMap<String, Item>>,
	specs: RwLock<Specs>,
	run: Mutex<Option<RunHandle>>,
	paused: AtomicBool,
	metadata: Arc<UpdatableMetadata>,
}

/// Shared handle to one collection.
#[derive(Clone)]
pub struct Collection {
	inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Collection")
			.field("name", &self.inner.name)
			.field("items", &self.len())
			.field("running", &self.running())
			.finish()
	}
}

impl Collection {
	pub fn new(kind: impl Into<String>, name: impl Into<String>, hooks: Arc<dyn CollectionHooks>) -> Self {
		Self {
			inner: Arc::new(CollectionInner {
				name: name.into(),
				kind: kind.into(),
				hooks,
				items: RwLock::new(BTreeMap::new()),
				specs: RwLock::new(Specs::default()),
				run: Mutex::new(None),
				paused: AtomicBool::new(false),
				metadata: Arc::new(UpdatableMetadata::new()),
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Handle for pushing extra metadata from hooks.
	pub fn updater(&self) -> MetadataUpdater {
		self.inner.metadata.updater()
	}

	pub fn is_paused(&self) -> bool {
		self.inner.paused.load(Ordering::Acquire)
	}

	/// Inserts or replaces the item under `key`.
	pub fn put(&self, key: impl Into<String>, instance: Instance, spec: Arc<steward_fsm::Spec>, data: BTreeMap<String, Value>) {
		let key = key.into();
		let item = Item {
			key: key.clone(),
			instance,
			spec,
			data,
		};
		let state = item.state_name();
		let count = {
			let mut items = self.inner.items.write();
			items.insert(key.clone(), item);
			items.len()
		};
		let updater = self.updater();
		updater.put(format!("items/{key}"), json!(state));
		updater.put("counts/items", json!(count));
	}

	pub fn get(&self, key: &str) -> Option<Item> {
		self.inner.items.read().get(key).cloned()
	}

	pub fn delete(&self, key: &str) -> Option<Item> {
		let (removed, count) = {
			let mut items = self.inner.items.write();
			let removed = items.remove(key);
			(removed, items.len())
		};
		if removed.is_some() {
			let updater = self.updater();
			updater.remove(format!("items/{key}"));
			updater.put("counts/items", json!(count));
		}
		removed
	}

	/// Mutates one item in place. Returns false if `key` is absent.
	pub fn update(&self, key: &str, f: impl FnOnce(&mut Item)) -> bool {
		let state = {
			let mut items = self.inner.items.write();
			let Some(item) = items.get_mut(key) else {
				return false;
			};
			f(item);
			item.state_name()
		};
		self.updater().put(format!("items/{key}"), json!(state));
		true
	}

	/// Visits items in key order under the read lock until `visitor` returns false.
	pub fn visit(&self, mut visitor: impl FnMut(&Item) -> bool) {
		let items = self.inner.items.read();
		for item in items.values() {
			if !visitor(item) {
				break;
			}
		}
	}

	pub fn get_by_instance(&self, id: InstanceId) -> Option<Item> {
		self.inner.items.read().values().find(|item| item.instance.id() == id).cloned()
	}

	pub fn keys(&self) -> Vec<String> {
		self.inner.items.read().keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.items.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Cancels the run task and waits for it to exit.
	async fn halt(&self) -> Result<()> {
		let run = self.inner.run.lock().take();
		let Some(run) = run else {
			return Ok(());
		};
		run.token.cancel();
		self.inner.hooks.stop();
		if let Err(err) = run.task.await {
			tracing::warn!(collection = %self.inner.name, error = %err, "collection.run.panicked");
		}
		tracing::debug!(collection = %self.inner.name, "collection.halt");
		Ok(())
	}

	fn reset(&self) {
		self.inner.items.write().clear();
		let updater = self.updater();
		updater.remove("items");
		updater.put("counts/items", json!(0));
	}

	fn object(&self) -> Object {
		let spec = self
			.current_spec()
			.unwrap_or_else(|| Spec::new(self.inner.kind.clone(), self.inner.name.clone()));
		let items: Vec<Value> = {
			let items = self.inner.items.read();
			items
				.values()
				.map(|item| {
					json!({
						"key": item.key,
						"state": item.state_name(),
						"data": item.data,
					})
				})
				.collect()
		};
		Object::new(spec).with_state(Any::from_value(json!({
			"running": self.running(),
			"paused": self.is_paused(),
			"items": items,
		})))
	}
}

#[async_trait]
impl Managed for Collection {
	fn start(&self) {
		let mut run = self.inner.run.lock();
		if run.as_ref().is_some_and(|r| !r.token.is_cancelled() && !r.task.is_finished()) {
			return;
		}
		let token = CancellationToken::new();
		let hooks = Arc::clone(&self.inner.hooks);
		let collection = self.clone();
		let child = token.clone();
		let task = tokio::spawn(async move { hooks.run(collection, child).await });
		self.inner.paused.store(false, Ordering::Release);
		tracing::debug!(collection = %self.inner.name, "collection.start");
		*run = Some(RunHandle { token, task });
	}

	fn running(&self) -> bool {
		self.inner
			.run
			.lock()
			.as_ref()
			.is_some_and(|r| !r.token.is_cancelled() && !r.task.is_finished())
	}

	fn stop(&self) -> Result<()> {
		let Some(run) = self.inner.run.lock().take() else {
			return Ok(());
		};
		run.token.cancel();
		self.inner.hooks.stop();
		tracing::debug!(collection = %self.inner.name, "collection.stop");
		Ok(())
	}

	fn metadata(&self) -> Option<Arc<dyn MetadataPlugin>> {
		Some(Arc::clone(&self.inner.metadata) as Arc<dyn MetadataPlugin>)
	}

	async fn plan(&self, operation: Operation, spec: Spec) -> Result<(Object, Plan)> {
		self.inner.hooks.validate(&spec)?;
		let mut plan = Plan::default();
		match operation {
			Operation::Enforce => match self.current_spec() {
				Some(current) if current == spec => {}
				Some(_) => plan.push(format!("update {} {}: restart with {} items reset", spec.kind, spec.metadata.name, self.len())),
				None => plan.push(format!("create {} {}", spec.kind, spec.metadata.name)),
			},
			Operation::Destroy => plan.push(format!("terminate {} {}: {} items", spec.kind, spec.metadata.name, self.len())),
		}
		let state = self.object().state.unwrap_or_else(Any::empty_object);
		Ok((Object::new(spec).with_state(state), plan))
	}

	async fn enforce(&self, spec: Spec) -> Result<Object> {
		self.inner.hooks.validate(&spec)?;
		if self.running() && self.current_spec().as_ref() == Some(&spec) {
			tracing::trace!(collection = %self.inner.name, "collection.enforce.unchanged");
			return Ok(self.object());
		}
		self.inner.hooks.update_spec(&spec)?;

		self.stop()?;
		self.reset();
		let exported = serde_json::to_value(&spec).unwrap_or(Value::Null);
		self.inner.specs.write().current = Some(spec);
		self.updater().put("specs/current", exported);
		self.start();
		tracing::info!(collection = %self.inner.name, "collection.enforce");
		Ok(self.object())
	}

	async fn inspect(&self) -> Result<Object> {
		Ok(self.object())
	}

	async fn free(&self) -> Result<Object> {
		self.inner.paused.store(true, Ordering::Release);
		self.inner.hooks.pause(true);
		tracing::debug!(collection = %self.inner.name, "collection.free");
		Ok(self.object())
	}

	async fn terminate(&self) -> Result<Object> {
		self.halt().await?;
		self.inner.hooks.terminate(self).await?;
		let object = self.object();
		self.reset();
		tracing::info!(collection = %self.inner.name, "collection.terminate");
		Ok(object)
	}

	fn current_spec(&self) -> Option<Spec> {
		self.inner.specs.read().current.clone()
	}

	fn set_prev_spec(&self, spec: Option<Spec>) {
		self.inner.specs.write().prev = spec;
	}

	fn prev_spec(&self) -> Option<Spec> {
		self.inner.specs.read().prev.clone()
	}
}
