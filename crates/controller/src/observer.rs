//! Periodic snapshots of external instances.
//!
//! An [`InstanceObserver`] polls one instance plugin with a label selector and
//! publishes every full snapshot into a latest-wins slot. Consumers that fall
//! behind only ever see the newest snapshot.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use steward_types::{Description, InstancePlugin, PluginLookup};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PollError;
use crate::poller::{Poller, Ticker, work_fn};

/// Leadership check consulted on every tick.
pub type LeaderCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Leader check that always passes.
pub fn always_leader() -> LeaderCheck {
	Arc::new(|| true)
}

/// Observation parameters for one accessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserveSpec {
	/// Instance plugin name.
	pub plugin: String,
	/// Labels every observed instance must carry.
	pub select: BTreeMap<String, String>,
	/// Poll period.
	#[serde(with = "crate::duration_ms")]
	pub observe_interval: Duration,
	/// Tag whose value is the join key; falls back to logical id, then id.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub key_selector: Option<String>,
}

impl Default for ObserveSpec {
	fn default() -> Self {
		Self {
			plugin: String::new(),
			select: BTreeMap::new(),
			observe_interval: Duration::from_secs(1),
			key_selector: None,
		}
	}
}

/// Renders a join key from a description.
pub trait KeyTemplate: Send + Sync {
	/// Returns `None` when the template does not apply to this description.
	fn render(&self, description: &Description) -> Option<String>;
}

/// Uses the value of one tag as the key.
#[derive(Debug, Clone)]
pub struct TagKey(pub String);

impl KeyTemplate for TagKey {
	fn render(&self, description: &Description) -> Option<String> {
		description.tags.get(&self.0).filter(|v| !v.is_empty()).cloned()
	}
}

/// Derives join keys for descriptions.
#[derive(Clone, Default)]
pub struct KeyExtractor {
	template: Option<Arc<dyn KeyTemplate>>,
}

impl std::fmt::Debug for KeyExtractor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyExtractor").field("templated", &self.template.is_some()).finish()
	}
}

impl KeyExtractor {
	pub fn new(template: Arc<dyn KeyTemplate>) -> Self {
		Self { template: Some(template) }
	}

	/// Extractor for an optional tag selector; blank selectors are ignored.
	pub fn from_selector(selector: Option<&str>) -> Self {
		match selector.map(str::trim) {
			Some(tag) if !tag.is_empty() => Self::new(Arc::new(TagKey(tag.to_string()))),
			_ => Self::default(),
		}
	}

	pub fn key(&self, description: &Description) -> String {
		if let Some(template) = &self.template
			&& let Some(key) = template.render(description)
		{
			return key;
		}
		description.logical_id.clone().unwrap_or_else(|| description.id.0.clone())
	}
}

/// Entries of `before` whose id is absent from `after`, in `before` order.
pub fn difference(before: &[Description], after: &[Description]) -> Vec<Description> {
	difference_by(before, after, |d| d.id.0.clone())
}

/// Like [`difference`] with a caller-supplied key.
pub fn difference_by(before: &[Description], after: &[Description], key: impl Fn(&Description) -> String) -> Vec<Description> {
	let seen: HashSet<String> = after.iter().map(&key).collect();
	before.iter().filter(|d| !seen.contains(&key(d))).cloned().collect()
}

struct Running {
	poller: Arc<Poller>,
	task: JoinHandle<()>,
}

struct ObserverInner {
	name: String,
	spec: ObserveSpec,
	plugins: Arc<dyn PluginLookup>,
	leader: LeaderCheck,
	extractor: KeyExtractor,
	paused: AtomicBool,
	plugin: Mutex<Option<Arc<dyn InstancePlugin>>>,
	snapshot: watch::Sender<Vec<Description>>,
	running: Mutex<Option<Running>>,
}

/// Polls an instance plugin and publishes the latest snapshot.
#[derive(Clone)]
pub struct InstanceObserver {
	inner: Arc<ObserverInner>,
}

impl std::fmt::Debug for InstanceObserver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InstanceObserver")
			.field("name", &self.inner.name)
			.field("plugin", &self.inner.spec.plugin)
			.field("running", &self.is_running())
			.finish()
	}
}

impl InstanceObserver {
	pub fn new(name: impl Into<String>, spec: ObserveSpec, plugins: Arc<dyn PluginLookup>, leader: LeaderCheck) -> Self {
		let extractor = KeyExtractor::from_selector(spec.key_selector.as_deref());
		Self::with_extractor(name, spec, plugins, leader, extractor)
	}

	/// Observer whose join keys come from `extractor` instead of `key_selector`.
	pub fn with_extractor(
		name: impl Into<String>,
		spec: ObserveSpec,
		plugins: Arc<dyn PluginLookup>,
		leader: LeaderCheck,
		extractor: KeyExtractor,
	) -> Self {
		let (snapshot, _) = watch::channel(Vec::new());
		Self {
			inner: Arc::new(ObserverInner {
				name: name.into(),
				spec,
				plugins,
				leader,
				extractor,
				paused: AtomicBool::new(false),
				plugin: Mutex::new(None),
				snapshot,
				running: Mutex::new(None),
			}),
		}
	}

	pub fn spec(&self) -> &ObserveSpec {
		&self.inner.spec
	}

	/// Receiver of snapshots. Unread snapshots are overwritten by newer ones.
	pub fn observations(&self) -> watch::Receiver<Vec<Description>> {
		self.inner.snapshot.subscribe()
	}

	pub fn latest(&self) -> Vec<Description> {
		self.inner.snapshot.borrow().clone()
	}

	pub fn key_of(&self, description: &Description) -> String {
		self.inner.extractor.key(description)
	}

	/// Starts polling at the configured interval. No-op while running.
	pub fn start(&self) {
		self.start_with(Ticker::interval(self.inner.spec.observe_interval));
	}

	/// Starts polling on the given ticker. No-op while running.
	pub fn start_with(&self, ticker: Ticker) {
		let mut running = self.inner.running.lock();
		if running.as_ref().is_some_and(|r| !r.poller.is_stopped() && !r.task.is_finished()) {
			return;
		}

		let weak = Arc::downgrade(&self.inner);
		let guard = {
			let weak = weak.clone();
			move || weak.upgrade().is_some_and(|inner| (inner.leader)() && !inner.paused.load(Ordering::Acquire))
		};
		let work = work_fn(move || {
			let weak: Weak<ObserverInner> = weak.clone();
			async move {
				match weak.upgrade() {
					Some(inner) => inner.observe().await,
					None => Err(PollError::Cancelled),
				}
			}
		});

		let poller = Arc::new(Poller::new(format!("observer:{}", self.inner.name), guard, work, ticker));
		let task = tokio::spawn({
			let poller = Arc::clone(&poller);
			async move { poller.run(CancellationToken::new()).await }
		});
		tracing::debug!(observer = %self.inner.name, plugin = %self.inner.spec.plugin, "observer.start");
		*running = Some(Running { poller, task });
	}

	/// Suspends or resumes polling without stopping the loop.
	pub fn pause(&self, paused: bool) {
		self.inner.paused.store(paused, Ordering::Release);
	}

	pub fn is_paused(&self) -> bool {
		self.inner.paused.load(Ordering::Acquire)
	}

	/// Stops polling. The observer may be started again.
	pub fn stop(&self) {
		if let Some(Running { poller, .. }) = self.inner.running.lock().take() {
			poller.stop();
			tracing::debug!(observer = %self.inner.name, "observer.stop");
		}
	}

	pub fn is_running(&self) -> bool {
		self.inner
			.running
			.lock()
			.as_ref()
			.is_some_and(|r| !r.poller.is_stopped() && !r.task.is_finished())
	}

	/// Runs one observation pass immediately, ignoring the guard.
	pub async fn observe_once(&self) -> Result<(), PollError> {
		self.inner.observe().await
	}
}

impl ObserverInner {
	fn connect(&self) -> Result<Arc<dyn InstancePlugin>, PollError> {
		let mut cached = self.plugin.lock();
		if let Some(plugin) = cached.as_ref() {
			return Ok(Arc::clone(plugin));
		}
		let plugin = self.plugins.instance(&self.spec.plugin)?;
		*cached = Some(Arc::clone(&plugin));
		Ok(plugin)
	}

	async fn observe(&self) -> Result<(), PollError> {
		let plugin = self.connect()?;
		match plugin.describe_instances(&self.spec.select, true).await {
			Ok(instances) => {
				tracing::trace!(observer = %self.name, count = instances.len(), "observer.snapshot");
				self.snapshot.send_replace(instances);
				Ok(())
			}
			Err(err) => {
				self.plugin.lock().take();
				tracing::warn!(observer = %self.name, plugin = %self.spec.plugin, error = %err, "observer.describe.failed");
				Err(err.into())
			}
		}
	}
}

impl Drop for ObserverInner {
	fn drop(&mut self) {
		if let Some(running) = self.running.get_mut().take() {
			running.poller.stop();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use async_trait::async_trait;
	use pretty_assertions::assert_eq;
	use steward_types::{DestroyContext, InstanceId, InstanceSpec, PluginError, StaticPlugins};

	use super::*;

	fn described(ids: &[&str]) -> Vec<Description> {
		ids.iter().map(|id| Description::with_id(*id)).collect()
	}

	#[derive(Default)]
	struct Scripted {
		calls: AtomicUsize,
		fail_first: bool,
		instances: Mutex<Vec<Description>>,
	}

	#[async_trait]
	impl InstancePlugin for Scripted {
		async fn validate(&self, _: &steward_types::Any) -> steward_types::Result<()> {
			Ok(())
		}

		async fn provision(&self, _: InstanceSpec) -> steward_types::Result<InstanceId> {
			Err(PluginError::Unsupported("provision"))
		}

		async fn label(&self, _: &InstanceId, _: BTreeMap<String, String>) -> steward_types::Result<()> {
			Ok(())
		}

		async fn destroy(&self, _: &InstanceId, _: DestroyContext) -> steward_types::Result<()> {
			Ok(())
		}

		async fn describe_instances(&self, _: &BTreeMap<String, String>, _: bool) -> steward_types::Result<Vec<Description>> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail_first && n == 0 {
				return Err(PluginError::Unavailable("connection reset".into()));
			}
			Ok(self.instances.lock().clone())
		}
	}

	fn observer(plugin: Arc<Scripted>, leader: LeaderCheck) -> (InstanceObserver, Arc<StaticPlugins>) {
		let plugins = Arc::new(StaticPlugins::new());
		plugins.register_instance("fake", plugin);
		let spec = ObserveSpec {
			plugin: "fake".into(),
			..ObserveSpec::default()
		};
		(InstanceObserver::new("net", spec, Arc::clone(&plugins) as Arc<dyn PluginLookup>, leader), plugins)
	}

	#[test]
	fn difference_reports_only_departed_entries() {
		let a = described(&["1", "2", "3"]);
		let b = described(&["2", "3", "4"]);
		assert_eq!(difference(&a, &b), described(&["1"]));
		assert_eq!(difference(&b, &a), described(&["4"]));
		assert!(difference(&a, &a).is_empty());
	}

	#[test]
	fn key_extractor_prefers_tag_then_logical_id_then_id() {
		let extractor = KeyExtractor::from_selector(Some("resource"));
		let mut d = Description::with_id("i-1");
		assert_eq!(extractor.key(&d), "i-1");
		d.logical_id = Some("lid".into());
		assert_eq!(extractor.key(&d), "lid");
		d.tags.insert("resource".into(), "net".into());
		assert_eq!(extractor.key(&d), "net");

		assert_eq!(KeyExtractor::from_selector(Some("  ")).key(&d), "lid");
	}

	#[test]
	fn observe_spec_defaults_and_millisecond_interval() {
		let spec: ObserveSpec = serde_json::from_value(serde_json::json!({"plugin": "p", "observe_interval": 250})).unwrap();
		assert_eq!(spec.observe_interval, Duration::from_millis(250));
		assert!(spec.select.is_empty());

		let spec: ObserveSpec = serde_json::from_value(serde_json::json!({})).unwrap();
		assert_eq!(spec.observe_interval, Duration::from_secs(1));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn failed_describe_drops_cached_plugin_and_reconnects() {
		let plugin = Arc::new(Scripted {
			fail_first: true,
			..Scripted::default()
		});
		*plugin.instances.lock() = described(&["a"]);
		let (observer, plugins) = observer(Arc::clone(&plugin), always_leader());

		assert!(observer.observe_once().await.is_err());
		assert!(observer.latest().is_empty());

		// The lookup now resolves to a different backend; the next pass must use it.
		let replacement = Arc::new(Scripted::default());
		*replacement.instances.lock() = described(&["b"]);
		plugins.register_instance("fake", Arc::clone(&replacement) as Arc<dyn InstancePlugin>);

		observer.observe_once().await.unwrap();
		assert_eq!(observer.latest(), described(&["b"]));
		assert_eq!(replacement.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn polling_respects_leadership_and_pause() {
		let plugin = Arc::new(Scripted::default());
		*plugin.instances.lock() = described(&["x"]);
		let leader = Arc::new(AtomicBool::new(false));
		let check = Arc::clone(&leader);
		let (observer, _plugins) = observer(Arc::clone(&plugin), Arc::new(move || check.load(Ordering::SeqCst)));

		let (ticker, ticks) = Ticker::manual();
		observer.start_with(ticker);
		assert!(observer.is_running());
		let mut rx = observer.observations();

		ticks.tick().await;
		tokio::task::yield_now().await;
		assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);

		leader.store(true, Ordering::SeqCst);
		ticks.tick().await;
		rx.changed().await.unwrap();
		assert_eq!(*rx.borrow_and_update(), described(&["x"]));

		observer.pause(true);
		ticks.tick().await;
		tokio::task::yield_now().await;
		assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);

		observer.stop();
		assert!(!observer.is_running());
	}
}
