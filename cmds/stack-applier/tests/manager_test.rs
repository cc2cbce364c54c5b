//! End-to-end tests of the manager against an in-memory store.

use std::{fs, path::Path, sync::Arc, time::Duration};

use kube::discovery::verbs;
use stack_applier::{
	config::{ManagerConfig, RetryConfig},
	k8s::memory::MemoryStore,
	labels::STACK_LABEL,
	leaderelection::{LeaderStatus, LocalLeader},
	manager::{Manager, IGNORED_MARKER_CONTENT, IGNORED_MARKER_FILE},
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn write_config_map(stack_dir: &Path, name: &str) {
	fs::create_dir_all(stack_dir).unwrap();
	fs::write(
		stack_dir.join(format!("{name}.yaml")),
		format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: apps\ndata:\n  key: value\n"),
	)
	.unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
	for _ in 0..400 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	panic!("condition not met in time");
}

struct Running {
	cancel: CancellationToken,
	task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
	async fn shutdown(self) {
		self.cancel.cancel();
		self.task.await.unwrap().unwrap();
	}
}

fn start(
	root: &Path,
	ignored: &[&str],
	store: &Arc<MemoryStore>,
	leader: &Arc<LocalLeader>,
) -> Running {
	let config = ManagerConfig {
		manifests_dir: root.to_path_buf(),
		ignored_stacks: ignored.iter().map(|s| (*s).to_string()).collect(),
		debounce_millis: 50,
		retry: RetryConfig {
			attempts: 3,
			initial_backoff_millis: 10,
			max_backoff_millis: 50,
		},
		..Default::default()
	};
	let manager = Manager::builder()
		.config(config)
		.store(store.clone())
		.leader(leader.clone())
		.build();
	let cancel = CancellationToken::new();
	let task = tokio::spawn({
		let cancel = cancel.clone();
		async move { manager.run(cancel).await }
	});
	Running { cancel, task }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stacks_follow_directories() {
	let root = TempDir::new().unwrap();
	write_config_map(&root.path().join("before"), "first");
	let store = Arc::new(MemoryStore::new());
	let leader = Arc::new(LocalLeader::leading());

	let running = start(root.path(), &[], &store, &leader);
	eventually(|| store.object("ConfigMap", Some("apps"), "first").is_some()).await;
	let live = store.object("ConfigMap", Some("apps"), "first").unwrap();
	assert_eq!(live["metadata"]["labels"][STACK_LABEL], "before");

	write_config_map(&root.path().join("after"), "second");
	eventually(|| store.object("ConfigMap", Some("apps"), "second").is_some()).await;

	// Removing a stack directory deletes what the stack owned and nothing else.
	fs::remove_dir_all(root.path().join("before")).unwrap();
	eventually(|| store.object("ConfigMap", Some("apps"), "first").is_none()).await;
	assert!(store.object("ConfigMap", Some("apps"), "second").is_some());

	running.shutdown().await;
	// Shutting down leaves everything in place.
	assert!(store.object("ConfigMap", Some("apps"), "second").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nothing_happens_until_leading() {
	let root = TempDir::new().unwrap();
	write_config_map(&root.path().join("web"), "site");
	let store = Arc::new(MemoryStore::new());
	let leader = Arc::new(LocalLeader::default());

	let running = start(root.path(), &[], &store, &leader);
	tokio::time::sleep(Duration::from_millis(400)).await;
	assert!(store.calls().is_empty());

	leader.set(LeaderStatus::Leading);
	eventually(|| store.object("ConfigMap", Some("apps"), "site").is_some()).await;

	running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acquiring_leadership_applies_each_stack_once() {
	let root = TempDir::new().unwrap();
	write_config_map(&root.path().join("one"), "a");
	write_config_map(&root.path().join("two"), "b");
	let store = Arc::new(MemoryStore::new());
	let leader = Arc::new(LocalLeader::default());

	let running = start(root.path(), &[], &store, &leader);
	tokio::time::sleep(Duration::from_millis(400)).await;
	assert!(store.calls().is_empty());

	leader.set(LeaderStatus::Leading);
	eventually(|| {
		store.object("ConfigMap", Some("apps"), "a").is_some()
			&& store.object("ConfigMap", Some("apps"), "b").is_some()
	})
	.await;
	tokio::time::sleep(Duration::from_millis(300)).await;

	let gets = |name: &str| {
		store
			.calls()
			.iter()
			.filter(|call| call.verb == verbs::GET && call.name == name)
			.count()
	};
	assert_eq!(gets("a"), 1);
	assert_eq!(gets("b"), 1);

	running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_losing_leadership_pauses_without_deleting() {
	let root = TempDir::new().unwrap();
	write_config_map(&root.path().join("before"), "first");
	write_config_map(&root.path().join("after"), "second");
	let store = Arc::new(MemoryStore::new());
	let leader = Arc::new(LocalLeader::leading());

	let running = start(root.path(), &[], &store, &leader);
	eventually(|| {
		store.object("ConfigMap", Some("apps"), "first").is_some()
			&& store.object("ConfigMap", Some("apps"), "second").is_some()
	})
	.await;

	leader.set(LeaderStatus::Pending);
	tokio::time::sleep(Duration::from_millis(200)).await;
	store.clear_calls();

	write_config_map(&root.path().join("after"), "third");
	fs::remove_dir_all(root.path().join("before")).unwrap();
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert!(store.calls().is_empty());
	assert!(store.object("ConfigMap", Some("apps"), "first").is_some());
	assert!(store.object("ConfigMap", Some("apps"), "third").is_none());

	// Back in charge: the edit lands and the removed stack is deleted.
	leader.set(LeaderStatus::Leading);
	eventually(|| store.object("ConfigMap", Some("apps"), "third").is_some()).await;
	eventually(|| store.object("ConfigMap", Some("apps"), "first").is_none()).await;
	assert!(store.object("ConfigMap", Some("apps"), "second").is_some());

	running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ignored_stack_is_marked_and_left_alone() {
	let root = TempDir::new().unwrap();
	write_config_map(&root.path().join("bootstrap"), "rbac");
	write_config_map(&root.path().join("web"), "site");
	let store = Arc::new(MemoryStore::new());
	let leader = Arc::new(LocalLeader::leading());

	let running = start(root.path(), &["bootstrap"], &store, &leader);
	eventually(|| store.object("ConfigMap", Some("apps"), "site").is_some()).await;
	let marker = root.path().join("bootstrap").join(IGNORED_MARKER_FILE);
	eventually(|| fs::read_to_string(&marker).is_ok_and(|c| c == IGNORED_MARKER_CONTENT)).await;

	assert!(store.object("ConfigMap", Some("apps"), "rbac").is_none());
	assert!(store.calls().iter().all(|call| call.name != "rbac"));

	running.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_symlinked_stack_directories() {
	let root = TempDir::new().unwrap();
	let elsewhere = TempDir::new().unwrap();
	write_config_map(elsewhere.path(), "linked");
	std::os::unix::fs::symlink(elsewhere.path(), root.path().join("linked")).unwrap();
	std::os::unix::fs::symlink("/nonexistent/stack", root.path().join("broken")).unwrap();
	let store = Arc::new(MemoryStore::new());
	let leader = Arc::new(LocalLeader::leading());

	let running = start(root.path(), &[], &store, &leader);
	eventually(|| store.object("ConfigMap", Some("apps"), "linked").is_some()).await;
	let live = store.object("ConfigMap", Some("apps"), "linked").unwrap();
	assert_eq!(live["metadata"]["labels"][STACK_LABEL], "linked");

	running.shutdown().await;
}
