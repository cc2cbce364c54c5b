//! Stack discovery and lifecycle.
//!
//! The [`Manager`] keeps one [`StackApplier`] running per directory under the
//! manifests root. Directories that appear get a new applier, directories that
//! disappear have their applier stopped and their resources deleted once this
//! replica leads. Leadership changes and a periodic sweep re-trigger every
//! stack.

use std::{
	collections::{BTreeMap, BTreeSet},
	fs,
	path::{Path, PathBuf},
	sync::Arc,
};

use anyhow::{Context, Result};
use bon::Builder;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
	config::ManagerConfig,
	k8s::store::ResourceStore,
	leaderelection::{LeaderElector, LeaderStatus, LeadershipWatch},
	manifest,
	stack_applier::{RunningStack, StackApplier, Trigger},
};

/// File written into ignored stack directories.
pub const IGNORED_MARKER_FILE: &str = "ignored.txt";

pub const IGNORED_MARKER_CONTENT: &str = "The ignored stack is handled internally.\n\
	This directory is ignored and can be safely removed.\n";

/// Root change notifications beyond this are dropped; a queued one already
/// causes a rescan.
const EVENT_CAPACITY: usize = 16;

/// Stacks known to the manager.
#[derive(Default)]
struct Stacks {
	running: BTreeMap<String, RunningStack>,
	/// Stacks whose directory is gone but whose resources may still exist.
	orphaned: BTreeMap<String, Arc<StackApplier>>,
	/// Orphans with a cleanup in flight.
	cleaning: BTreeSet<String>,
	cleanups: JoinSet<(String, bool)>,
}

/// Runs a [`StackApplier`] for every stack directory.
#[derive(Builder)]
pub struct Manager {
	config: ManagerConfig,
	store: Arc<dyn ResourceStore>,
	leader: Arc<dyn LeaderElector>,
}

impl Manager {
	/// Manage stacks until `cancel` fires, then stop every stack without
	/// deleting anything.
	#[instrument(skip_all, fields(root = %self.config.manifests_dir.display()))]
	pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
		let root = &self.config.manifests_dir;
		fs::create_dir_all(root)
			.with_context(|| format!("creating manifests directory {}", root.display()))?;

		let (events_tx, mut events) = mpsc::channel(EVENT_CAPACITY);
		let _watcher = watch_root(root, events_tx);
		let mut leadership = LeadershipWatch::new(Arc::clone(&self.leader));

		let mut stacks = Stacks::default();
		self.rescan(&mut stacks, &cancel).await;

		let mut sweep = tokio::time::interval(self.config.sweep_interval());
		sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
		sweep.tick().await;

		loop {
			tokio::select! {
				() = cancel.cancelled() => break,
				Some(()) = events.recv() => self.rescan(&mut stacks, &cancel).await,
				status = leadership.changed() => match status {
					LeaderStatus::Leading => {
						tracing::info!(stacks = stacks.running.len(), "leading, re-applying all stacks");
						trigger_all(&stacks, Trigger::LeaderAcquired);
						self.clean_orphans(&mut stacks, &cancel);
					}
					LeaderStatus::Pending => {
						tracing::info!("no longer leading, pausing stacks");
					}
				},
				_ = sweep.tick() => {
					tracing::debug!("periodic sweep");
					self.rescan(&mut stacks, &cancel).await;
					trigger_all(&stacks, Trigger::Sweep);
				}
				Some(finished) = stacks.cleanups.join_next() => {
					match finished {
						Ok((name, deleted)) => {
							stacks.cleaning.remove(&name);
							if deleted {
								stacks.orphaned.remove(&name);
								// A directory recreated during cleanup was held back.
								self.rescan(&mut stacks, &cancel).await;
							} else {
								tracing::warn!(stack = %name, "stack cleanup incomplete, retrying on the next sweep");
							}
						}
						Err(e) => {
							tracing::error!(error = %e, "stack cleanup panicked");
							stacks.cleaning.clear();
						}
					}
				}
			}
		}

		while stacks.cleanups.join_next().await.is_some() {}
		for (name, stack) in stacks.running {
			tracing::debug!(stack = %name, "stopping stack");
			stack.stop().await;
		}
		tracing::info!("manager stopped");
		Ok(())
	}

	/// Reconcile running stacks with the directories on disk.
	async fn rescan(&self, stacks: &mut Stacks, cancel: &CancellationToken) {
		let found: BTreeMap<String, PathBuf> =
			match manifest::find_stack_dirs(&self.config.manifests_dir) {
				Ok(found) => found.into_iter().collect(),
				Err(e) => {
					tracing::warn!(error = %e, "cannot list stack directories");
					return;
				}
			};

		let removed: Vec<String> = stacks
			.running
			.keys()
			.filter(|name| !found.contains_key(*name))
			.cloned()
			.collect();
		for name in removed {
			let Some(stack) = stacks.running.remove(&name) else {
				continue;
			};
			if self.leader.is_leader() {
				tracing::info!(stack = %name, "stack directory removed, deleting stack");
			} else {
				tracing::warn!(stack = %name, "stack directory removed while not leading, deleting once leading");
			}
			let applier = stack.stop().await;
			stacks.orphaned.insert(name, applier);
		}
		self.clean_orphans(stacks, cancel);

		for (name, dir) in found {
			if self.config.ignored_stacks.contains(&name) {
				mark_ignored(&name, &dir);
				continue;
			}
			if stacks.orphaned.contains_key(&name) {
				if stacks.cleaning.contains(&name) {
					tracing::debug!(stack = %name, "stack directory is back, waiting for cleanup");
					continue;
				}
				// The new applier prunes whatever the old one left.
				stacks.orphaned.remove(&name);
			}
			match stacks.running.get(&name) {
				Some(stack) if stack.is_alive() => continue,
				Some(_) => tracing::warn!(stack = %name, "stack loop exited, restarting"),
				None => tracing::info!(stack = %name, "stack added"),
			}
			let stack = self.start_stack(&name, dir);
			stacks.running.insert(name, stack);
		}
	}

	/// Start deleting every orphaned stack that has no cleanup in flight.
	fn clean_orphans(&self, stacks: &mut Stacks, cancel: &CancellationToken) {
		if cancel.is_cancelled() || !self.leader.is_leader() {
			return;
		}
		for (name, applier) in &stacks.orphaned {
			if !stacks.cleaning.insert(name.clone()) {
				continue;
			}
			let name = name.clone();
			let applier = Arc::clone(applier);
			let cancel = cancel.child_token();
			stacks.cleanups.spawn(async move {
				let deleted = applier.cleanup(&cancel).await;
				(name, deleted)
			});
		}
	}

	fn start_stack(&self, name: &str, dir: PathBuf) -> RunningStack {
		StackApplier::builder()
			.name(name)
			.dir(dir)
			.store(Arc::clone(&self.store))
			.leader(Arc::clone(&self.leader))
			.debounce(self.config.debounce())
			.retry(self.config.retry)
			.build()
			.start()
	}
}

fn trigger_all(stacks: &Stacks, trigger: Trigger) {
	for stack in stacks.running.values() {
		stack.trigger(trigger.clone());
	}
}

/// Watch the root for stack directories coming and going.
fn watch_root(root: &Path, events: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
	let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
		match res {
			Ok(event) if !event.kind.is_access() => {
				let _ = events.try_send(());
			}
			Ok(_) => {}
			Err(e) => tracing::warn!(error = %e, "manifests directory watcher error"),
		}
	});

	let result = watcher.and_then(|mut watcher| {
		watcher.watch(root, RecursiveMode::NonRecursive)?;
		Ok(watcher)
	});
	match result {
		Ok(watcher) => Some(watcher),
		Err(e) => {
			tracing::warn!(error = %e, "cannot watch manifests directory, relying on periodic sweeps");
			None
		}
	}
}

/// Leave a note in an ignored stack directory.
fn mark_ignored(name: &str, dir: &Path) {
	let marker = dir.join(IGNORED_MARKER_FILE);
	if fs::read_to_string(&marker).is_ok_and(|content| content == IGNORED_MARKER_CONTENT) {
		return;
	}
	match fs::write(&marker, IGNORED_MARKER_CONTENT) {
		Ok(()) => tracing::info!(stack = %name, "stack is ignored"),
		Err(e) => tracing::warn!(stack = %name, error = %e, "cannot write ignored stack marker"),
	}
}
