use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use steward_types::Any;

use super::*;

/// Counts live control loops across every loop allocated by one controller.
#[derive(Default)]
struct Census {
	live: AtomicUsize,
	peak: AtomicUsize,
	allocated: AtomicUsize,
	log: Mutex<Vec<String>>,
}

struct Tracked {
	id: usize,
	census: Arc<Census>,
	running: AtomicBool,
	current: Mutex<Option<Spec>>,
	prev: Mutex<Option<Spec>>,
}

#[async_trait]
impl Managed for Tracked {
	fn start(&self) {
		if !self.running.swap(true, Ordering::SeqCst) {
			let live = self.census.live.fetch_add(1, Ordering::SeqCst) + 1;
			self.census.peak.fetch_max(live, Ordering::SeqCst);
			self.census.log.lock().push(format!("start {}", self.id));
		}
	}

	fn running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	fn stop(&self) -> Result<()> {
		if self.running.swap(false, Ordering::SeqCst) {
			self.census.live.fetch_sub(1, Ordering::SeqCst);
			self.census.log.lock().push(format!("stop {}", self.id));
		}
		Ok(())
	}

	fn metadata(&self) -> Option<Arc<dyn MetadataPlugin>> {
		None
	}

	async fn plan(&self, _operation: Operation, spec: Spec) -> Result<(Object, Plan)> {
		Ok((Object::new(spec), Plan::default()))
	}

	async fn enforce(&self, spec: Spec) -> Result<Object> {
		if spec.properties.is_none() {
			return Err(ControllerError::InvalidSpec("properties required".into()));
		}
		*self.current.lock() = Some(spec.clone());
		let yields = spec.properties.as_ref().and_then(|p| p.value()["yields"].as_u64()).unwrap_or(1);
		for _ in 0..yields {
			tokio::task::yield_now().await;
		}
		self.start();
		Ok(Object::new(spec))
	}

	async fn inspect(&self) -> Result<Object> {
		let spec = self.current.lock().clone().unwrap_or_default();
		Ok(Object::new(spec))
	}

	async fn free(&self) -> Result<Object> {
		self.census.log.lock().push(format!("free {}", self.id));
		self.inspect().await
	}

	async fn terminate(&self) -> Result<Object> {
		self.stop()?;
		self.census.log.lock().push(format!("terminate {}", self.id));
		self.inspect().await
	}

	fn current_spec(&self) -> Option<Spec> {
		self.current.lock().clone()
	}

	fn set_prev_spec(&self, spec: Option<Spec>) {
		*self.prev.lock() = spec;
	}

	fn prev_spec(&self) -> Option<Spec> {
		self.prev.lock().clone()
	}
}

fn controller() -> (Arc<Controller>, Arc<Census>) {
	let census = Arc::new(Census::default());
	let alloc_census = Arc::clone(&census);
	let alloc: Alloc = Arc::new(move |_spec: &Spec| {
		let id = alloc_census.allocated.fetch_add(1, Ordering::SeqCst);
		Ok(Arc::new(Tracked {
			id,
			census: Arc::clone(&alloc_census),
			running: AtomicBool::new(false),
			current: Mutex::new(None),
			prev: Mutex::new(None),
		}) as Arc<dyn Managed>)
	});
	(Arc::new(Controller::new("loops", alloc, None)), census)
}

fn spec(name: &str, generation: u64) -> Spec {
	yielding(name, generation, 1)
}

/// Spec whose enforce yields `yields` times before starting its loop.
fn yielding(name: &str, generation: u64, yields: u64) -> Spec {
	Spec::new("loop", name).with_properties(Any::from_value(serde_json::json!({ "generation": generation, "yields": yields })))
}

#[tokio::test(flavor = "current_thread")]
async fn at_most_one_managed_runs_per_key() {
	let _ = tracing_subscriber::fmt::try_init();
	let (controller, census) = controller();
	controller.commit(Operation::Enforce, spec("db", 1)).await.unwrap();

	let mut tasks = Vec::new();
	for (generation, yields) in [(2, 1), (3, 3), (4, 1)] {
		let controller = Arc::clone(&controller);
		tasks.push(tokio::spawn(async move { controller.commit(Operation::Enforce, yielding("db", generation, yields)).await }));
	}
	for task in tasks {
		task.await.unwrap().unwrap();
	}

	assert_eq!(census.peak.load(Ordering::SeqCst), 1);
	assert_eq!(census.live.load(Ordering::SeqCst), 1);
	assert_eq!(controller.keys(), vec!["db".to_string()]);
	assert!(controller.managed("db").unwrap().running());
	assert_eq!(
		*census.log.lock(),
		vec!["start 0", "stop 0", "start 1", "stop 1", "start 2", "stop 2", "start 3"]
	);
}

#[tokio::test(flavor = "current_thread")]
async fn destroy_waits_for_an_enforce_in_flight() {
	let (controller, census) = controller();

	let enforce = tokio::spawn({
		let controller = Arc::clone(&controller);
		async move { controller.commit(Operation::Enforce, yielding("db", 1, 3)).await }
	});
	tokio::task::yield_now().await;
	controller.commit(Operation::Destroy, spec("db", 1)).await.unwrap();
	enforce.await.unwrap().unwrap();

	assert_eq!(census.live.load(Ordering::SeqCst), 0);
	assert!(controller.keys().is_empty());
	assert_eq!(*census.log.lock(), vec!["start 0", "stop 0", "terminate 0"]);
}

#[tokio::test(flavor = "current_thread")]
async fn swap_carries_previous_spec_forward() {
	let (controller, census) = controller();

	controller.commit(Operation::Enforce, spec("db", 1)).await.unwrap();
	let first = controller.managed("db").unwrap();
	assert!(first.running());
	assert_eq!(first.prev_spec(), None);

	controller.commit(Operation::Enforce, spec("db", 2)).await.unwrap();
	let second = controller.managed("db").unwrap();
	assert!(!Arc::ptr_eq(&first, &second));
	assert!(!first.running());
	assert!(second.running());
	assert_eq!(second.prev_spec(), first.current_spec());
	assert_eq!(second.current_spec(), Some(spec("db", 2)));
	assert_eq!(*census.log.lock(), vec!["start 0", "stop 0", "start 1"]);
}

#[tokio::test(flavor = "current_thread")]
async fn idle_entry_is_reused_after_failed_enforce() {
	let (controller, census) = controller();

	let err = controller.commit(Operation::Enforce, Spec::new("loop", "db")).await.unwrap_err();
	assert!(matches!(err, ControllerError::InvalidSpec(_)));
	controller.commit(Operation::Enforce, spec("db", 1)).await.unwrap();
	assert_eq!(census.allocated.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn destroy_terminates_and_removes() {
	let (controller, census) = controller();
	controller.commit(Operation::Enforce, spec("db", 1)).await.unwrap();

	controller.commit(Operation::Destroy, spec("db", 1)).await.unwrap();
	assert!(controller.keys().is_empty());
	assert_eq!(census.live.load(Ordering::SeqCst), 0);
	assert_eq!(census.log.lock().last().map(String::as_str), Some("terminate 0"));

	let err = controller.commit(Operation::Destroy, spec("db", 1)).await.unwrap_err();
	assert_eq!(err, ControllerError::NotFound("db".into()));
}

#[tokio::test(flavor = "current_thread")]
async fn describe_and_free_never_allocate() {
	let (controller, census) = controller();
	controller.commit(Operation::Enforce, spec("b", 1)).await.unwrap();
	controller.commit(Operation::Enforce, spec("a", 1)).await.unwrap();

	let all = controller.describe(None).await.unwrap();
	let names: Vec<_> = all.iter().map(|o| o.spec.metadata.name.as_str()).collect();
	assert_eq!(names, vec!["a", "b"]);

	assert!(controller.describe(Some(Metadata::named("zzz"))).await.unwrap().is_empty());
	assert_eq!(census.allocated.load(Ordering::SeqCst), 2);

	let freed = controller.free(Some(Metadata::named("a"))).await.unwrap();
	assert_eq!(freed.len(), 1);
	assert_eq!(freed[0].spec, spec("a", 1));
	assert!(controller.managed("a").unwrap().running());
	assert!(census.log.lock().contains(&"free 1".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn plan_allocates_and_missing_name_is_rejected() {
	let (controller, census) = controller();
	let (object, plan) = controller.plan(Operation::Enforce, spec("web", 1)).await.unwrap();
	assert_eq!(object.spec, spec("web", 1));
	assert!(plan.is_empty());
	assert_eq!(census.allocated.load(Ordering::SeqCst), 1);
	assert!(!controller.managed("web").unwrap().running());

	let err = controller.commit(Operation::Enforce, Spec::new("loop", "")).await.unwrap_err();
	assert_eq!(err, ControllerError::MissingName);

	let plugin: &dyn ControllerPlugin = controller.as_ref();
	assert_eq!(
		plugin.commit(Operation::Destroy, spec("nope", 1)).await.unwrap_err(),
		PluginError::NotFound("nope".into())
	);
}
