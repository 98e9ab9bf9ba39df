//! The leadership-gated manager: one queue task, one normalizer task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use steward_types::{
	ControllerPlugin, GROUP_KIND, GroupDescription, GroupId, GroupPlugin, GroupSpec, Leadership, LeadershipDetector, Metadata, Object,
	Operation, Plan, PluginError, PluginLookup, SnapshotStore, Spec,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ManagerError, Result};
use crate::global_spec::{GlobalSpec, Record, SpecKey};
use crate::leadership::{Lease, Normalizer};
use crate::proxy::ControllerProxy;

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
	/// Name of the group plugin the manager fronts.
	pub backend: String,
	/// Capacity of the operation queue and the leadership notification channel.
	pub queue_depth: usize,
}

impl Default for ManagerOptions {
	fn default() -> Self {
		Self {
			backend: GROUP_KIND.to_string(),
			queue_depth: 16,
		}
	}
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Mutating work executed by the queue task, one at a time, only while leader.
pub(crate) enum Op {
	CommitGroup { spec: GroupSpec, pretend: bool, reply: Reply<String> },
	DestroyGroup { id: GroupId, reply: Reply<()> },
	FreeGroup { id: GroupId, reply: Reply<()> },
	Plan { controller: String, operation: Operation, spec: Spec, reply: Reply<(Object, Plan)> },
	Commit { controller: String, operation: Operation, spec: Spec, reply: Reply<Object> },
	Describe { controller: String, search: Option<Metadata>, reply: Reply<Vec<Object>> },
	Free { controller: String, search: Option<Metadata>, reply: Reply<Vec<Object>> },
}

impl Op {
	fn reject(self, err: ManagerError) {
		match self {
			Op::CommitGroup { reply, .. } => {
				let _ = reply.send(Err(err));
			}
			Op::DestroyGroup { reply, .. } | Op::FreeGroup { reply, .. } => {
				let _ = reply.send(Err(err));
			}
			Op::Plan { reply, .. } => {
				let _ = reply.send(Err(err));
			}
			Op::Commit { reply, .. } => {
				let _ = reply.send(Err(err));
			}
			Op::Describe { reply, .. } | Op::Free { reply, .. } => {
				let _ = reply.send(Err(err));
			}
		}
	}
}

pub(crate) struct Inner {
	options: ManagerOptions,
	detector: Arc<dyn LeadershipDetector>,
	plugins: Arc<dyn PluginLookup>,
	global: GlobalSpec,
	controllers: RwLock<BTreeMap<String, Arc<dyn ControllerPlugin>>>,
	lease: Mutex<Lease>,
	started: AtomicBool,
	ops: Mutex<Option<mpsc::Sender<Op>>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	token: CancellationToken,
}

impl Inner {
	fn is_leader(&self) -> bool {
		self.lease.lock().is_leader()
	}

	fn backend(&self) -> Result<Arc<dyn GroupPlugin>> {
		Ok(self.plugins.group(&self.options.backend)?)
	}

	fn controller(&self, name: &str) -> Result<Arc<dyn ControllerPlugin>> {
		self.controllers
			.read()
			.get(name)
			.cloned()
			.ok_or_else(|| ManagerError::UnknownController(name.to_string()))
	}

	/// Enqueues an op and waits for its reply. Fails fast when not leader.
	pub(crate) async fn submit<T>(&self, make: impl FnOnce(Reply<T>) -> Op) -> Result<T> {
		if !self.is_leader() {
			return Err(ManagerError::NotLeader);
		}
		let ops = self.ops.lock().clone();
		let Some(ops) = ops else {
			return Err(if self.token.is_cancelled() { ManagerError::Stopped } else { ManagerError::NotStarted });
		};
		let (reply, rx) = oneshot::channel();
		ops.send(make(reply)).await.map_err(|_| ManagerError::Stopped)?;
		rx.await.map_err(|_| ManagerError::Stopped)?
	}

	async fn execute(&self, op: Op) {
		match op {
			Op::CommitGroup { spec, pretend, reply } => {
				let _ = reply.send(self.commit_group(spec, pretend).await);
			}
			Op::DestroyGroup { id, reply } => {
				let _ = reply.send(self.destroy_group(&id).await);
			}
			Op::FreeGroup { id, reply } => {
				let _ = reply.send(self.free_group(&id).await);
			}
			Op::Plan {
				controller,
				operation,
				spec,
				reply,
			} => {
				let _ = reply.send(self.plan(&controller, operation, spec).await);
			}
			Op::Commit {
				controller,
				operation,
				spec,
				reply,
			} => {
				let _ = reply.send(self.commit_controller(&controller, operation, spec).await);
			}
			Op::Describe { controller, search, reply } => {
				let _ = reply.send(self.describe(&controller, search).await);
			}
			Op::Free { controller, search, reply } => {
				let _ = reply.send(self.free(&controller, search).await);
			}
		}
	}

	async fn commit_group(&self, spec: GroupSpec, pretend: bool) -> Result<String> {
		let backend = self.backend()?;
		if !pretend {
			let record = Record {
				handler: self.options.backend.clone(),
				spec: spec.to_spec(),
			};
			self.global.update(SpecKey::of(&record.spec), record).await?;
		}
		tracing::info!(group = %spec.id, pretend, "manager.commit_group");
		Ok(backend.commit_group(spec, pretend).await?)
	}

	async fn destroy_group(&self, id: &GroupId) -> Result<()> {
		let backend = self.backend()?;
		self.global.remove(&SpecKey::new(GROUP_KIND, id.0.clone())).await?;
		tracing::info!(group = %id, "manager.destroy_group");
		Ok(backend.destroy_group(id).await?)
	}

	async fn free_group(&self, id: &GroupId) -> Result<()> {
		let backend = self.backend()?;
		self.global.remove(&SpecKey::new(GROUP_KIND, id.0.clone())).await?;
		tracing::info!(group = %id, "manager.free_group");
		Ok(backend.free_group(id).await?)
	}

	async fn plan(&self, name: &str, operation: Operation, spec: Spec) -> Result<(Object, Plan)> {
		Ok(self.controller(name)?.plan(operation, spec).await?)
	}

	async fn describe(&self, name: &str, search: Option<Metadata>) -> Result<Vec<Object>> {
		Ok(self.controller(name)?.describe(search).await?)
	}

	async fn free(&self, name: &str, search: Option<Metadata>) -> Result<Vec<Object>> {
		Ok(self.controller(name)?.free(search).await?)
	}

	async fn commit_controller(&self, name: &str, operation: Operation, spec: Spec) -> Result<Object> {
		let controller = self.controller(name)?;
		let key = SpecKey::of(&spec);
		match operation {
			Operation::Enforce => {
				let record = Record {
					handler: name.to_string(),
					spec: spec.clone(),
				};
				self.global.update(key.clone(), record).await?;
			}
			Operation::Destroy => {
				self.global.remove(&key).await?;
			}
		}
		tracing::info!(controller = name, key = %key, ?operation, "manager.commit");
		Ok(controller.commit(operation, spec).await?)
	}

	/// Reloads the persisted index and re-commits every record to its handler.
	async fn on_assume_leadership(&self) {
		let records = match self.global.load().await {
			Ok(records) => records,
			Err(err) => {
				tracing::error!(error = %err, "manager.assume.load_failed");
				return;
			}
		};
		tracing::info!(records = records.len(), "manager.assume");
		for (key, record) in records {
			if let Err(err) = self.exec_record(&key, record).await {
				tracing::warn!(key = %key, error = %err, "manager.assume.commit_failed");
			}
		}
	}

	async fn exec_record(&self, key: &SpecKey, record: Record) -> Result<()> {
		if record.handler == self.options.backend && key.kind == GROUP_KIND {
			let spec = GroupSpec::from_spec(&record.spec);
			self.backend()?.commit_group(spec, false).await?;
			return Ok(());
		}
		let controller = self.controllers.read().get(&record.handler).cloned();
		match controller {
			Some(controller) => {
				controller.commit(Operation::Enforce, record.spec).await?;
			}
			None => tracing::warn!(key = %key, handler = %record.handler, "manager.assume.skipped"),
		}
		Ok(())
	}

	/// Frees every running group and every controller's objects, leaving infrastructure in place.
	async fn on_lost_leadership(&self) {
		match self.backend() {
			Ok(backend) => match backend.inspect_groups().await {
				Ok(groups) => {
					for group in groups {
						if let Err(err) = backend.free_group(&group.id).await {
							tracing::warn!(group = %group.id, error = %err, "manager.lost.free_failed");
						}
					}
				}
				Err(err) => tracing::warn!(error = %err, "manager.lost.inspect_failed"),
			},
			Err(err) => tracing::warn!(error = %err, "manager.lost.no_backend"),
		}

		let controllers: Vec<(String, Arc<dyn ControllerPlugin>)> =
			self.controllers.read().iter().map(|(n, c)| (n.clone(), Arc::clone(c))).collect();
		for (name, controller) in controllers {
			if let Err(err) = controller.free(None).await {
				tracing::warn!(controller = %name, error = %err, "manager.lost.free_failed");
			}
		}
		tracing::info!("manager.lost");
	}
}

async fn normalize(inner: Arc<Inner>, mut events: mpsc::Receiver<Leadership>, notify: mpsc::Sender<(bool, u64)>) {
	let mut normalizer = Normalizer::default();
	loop {
		let flip = tokio::select! {
			biased;
			_ = inner.token.cancelled() => break,
			event = events.recv() => match event {
				Some(event) => {
					if let Some(error) = &event.error {
						tracing::warn!(error = %error, "manager.leadership.error");
					}
					normalizer.observe(&event)
				}
				None => {
					if let Some(leader) = normalizer.closed() {
						let epoch = inner.lease.lock().flip(leader);
						let _ = notify.send((leader, epoch)).await;
					}
					tracing::debug!("manager.leadership.closed");
					break;
				}
			},
		};
		let Some(leader) = flip else {
			continue;
		};
		// Losing takes effect immediately; gaining only once the queue has reloaded.
		let epoch = inner.lease.lock().flip(leader);
		tracing::info!(leader, epoch, "manager.leadership.flip");
		if notify.send((leader, epoch)).await.is_err() {
			break;
		}
	}
	tracing::debug!("manager.leadership.exit");
}

async fn work_queue(inner: Arc<Inner>, mut ops: mpsc::Receiver<Op>, mut notify: mpsc::Receiver<(bool, u64)>) {
	loop {
		tokio::select! {
			biased;
			_ = inner.token.cancelled() => break,
			Some((leader, epoch)) = notify.recv() => {
				if leader {
					inner.on_assume_leadership().await;
					if !inner.lease.lock().promote(epoch) {
						tracing::info!(epoch, "manager.assume.superseded");
					}
				} else {
					inner.on_lost_leadership().await;
				}
			}
			Some(op) = ops.recv() => {
				if inner.is_leader() {
					inner.execute(op).await;
				} else {
					op.reject(ManagerError::NotLeader);
				}
			}
			else => break,
		}
	}
	ops.close();
	while let Ok(op) = ops.try_recv() {
		op.reject(ManagerError::Stopped);
	}
	tracing::debug!("manager.queue.exit");
}

/// Fronts a group backend and a set of controllers behind a leadership gate.
///
/// Mutating calls are serialized through one queue task that only executes
/// while this process is the leader; otherwise they fail with
/// [`ManagerError::NotLeader`] and nothing is changed. On gaining leadership
/// the persisted spec index is reloaded and every record re-committed; on
/// losing it every running group and controller object is freed.
#[derive(Clone)]
pub struct Manager {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for Manager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Manager")
			.field("options", &self.inner.options)
			.field("leader", &self.inner.is_leader())
			.finish_non_exhaustive()
	}
}

impl Manager {
	pub fn new(options: ManagerOptions, detector: Arc<dyn LeadershipDetector>, store: Arc<dyn SnapshotStore>, plugins: Arc<dyn PluginLookup>) -> Self {
		Self {
			inner: Arc::new(Inner {
				options,
				detector,
				plugins,
				global: GlobalSpec::new(store),
				controllers: RwLock::new(BTreeMap::new()),
				lease: Mutex::new(Lease::default()),
				started: AtomicBool::new(false),
				ops: Mutex::new(None),
				tasks: Mutex::new(Vec::new()),
				token: CancellationToken::new(),
			}),
		}
	}

	/// Subscribes to the detector and spawns the normalizer and queue tasks.
	///
	/// Calling it again is a no-op; calling it after [`Manager::stop`] fails.
	pub fn start(&self) -> Result<()> {
		let inner = &self.inner;
		if inner.token.is_cancelled() {
			return Err(ManagerError::Stopped);
		}
		if inner.started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let events = match inner.detector.start() {
			Ok(events) => events,
			Err(err) => {
				inner.started.store(false, Ordering::SeqCst);
				return Err(err.into());
			}
		};

		let depth = inner.options.queue_depth.max(1);
		let (ops_tx, ops_rx) = mpsc::channel(depth);
		let (notify_tx, notify_rx) = mpsc::channel(depth);
		*inner.ops.lock() = Some(ops_tx);

		let normalizer = tokio::spawn(normalize(Arc::clone(inner), events, notify_tx));
		let queue = tokio::spawn(work_queue(Arc::clone(inner), ops_rx, notify_rx));
		inner.tasks.lock().extend([normalizer, queue]);
		tracing::info!(backend = %inner.options.backend, "manager.start");
		Ok(())
	}

	/// Cancels both tasks and stops the detector. Idempotent.
	pub fn stop(&self) {
		let inner = &self.inner;
		if inner.token.is_cancelled() {
			return;
		}
		inner.token.cancel();
		inner.ops.lock().take();
		inner.lease.lock().revoke();
		inner.detector.stop();
		tracing::info!("manager.stop");
	}

	/// Waits for the background tasks to exit after [`Manager::stop`].
	pub async fn join(&self) {
		let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
		for task in tasks {
			if let Err(err) = task.await {
				tracing::warn!(error = %err, "manager.task.panicked");
			}
		}
	}

	pub fn is_leader(&self) -> bool {
		self.inner.is_leader()
	}

	/// Specs as currently persisted.
	pub async fn specs(&self) -> Result<Vec<Spec>> {
		self.inner.global.persisted().await
	}

	/// Registers or replaces a controller under `name`.
	pub fn register_controller(&self, name: impl Into<String>, controller: Arc<dyn ControllerPlugin>) {
		let name = name.into();
		tracing::debug!(controller = %name, "manager.register_controller");
		self.inner.controllers.write().insert(name, controller);
	}

	pub fn controller_names(&self) -> Vec<String> {
		self.inner.controllers.read().keys().cloned().collect()
	}

	/// Queue-routed handle to a registered controller.
	pub fn controller(&self, name: &str) -> Result<ControllerProxy> {
		self.inner.controller(name)?;
		Ok(ControllerProxy::new(name, Arc::clone(&self.inner)))
	}
}

#[async_trait]
impl GroupPlugin for Manager {
	async fn commit_group(&self, spec: GroupSpec, pretend: bool) -> steward_types::Result<String> {
		Ok(self.inner.submit(|reply| Op::CommitGroup { spec, pretend, reply }).await?)
	}

	async fn free_group(&self, id: &GroupId) -> steward_types::Result<()> {
		let id = id.clone();
		Ok(self.inner.submit(|reply| Op::FreeGroup { id, reply }).await?)
	}

	async fn destroy_group(&self, id: &GroupId) -> steward_types::Result<()> {
		let id = id.clone();
		Ok(self.inner.submit(|reply| Op::DestroyGroup { id, reply }).await?)
	}

	async fn describe_group(&self, id: &GroupId) -> steward_types::Result<GroupDescription> {
		self.inner.backend().map_err(PluginError::from)?.describe_group(id).await
	}

	async fn inspect_groups(&self) -> steward_types::Result<Vec<GroupSpec>> {
		self.inner.backend().map_err(PluginError::from)?.inspect_groups().await
	}

	async fn size(&self, id: &GroupId) -> steward_types::Result<usize> {
		self.inner.backend().map_err(PluginError::from)?.size(id).await
	}

	async fn set_size(&self, id: &GroupId, size: usize) -> steward_types::Result<()> {
		self.inner.backend().map_err(PluginError::from)?.set_size(id, size).await
	}
}
