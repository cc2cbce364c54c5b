//! The per-stack convergence loop.
//!
//! A [`StackApplier`] binds one stack directory to the cluster. Once started
//! it applies the stack right away, then re-applies it whenever its manifest
//! files change (debounced) or the manager asks it to. Failed passes are
//! retried a bounded number of times; after that the stack waits for the next
//! trigger.

use std::{
	error::Error as StdError,
	path::{Path, PathBuf},
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use bon::Builder;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
	config::RetryConfig,
	debounce::Debouncer,
	k8s::store::ResourceStore,
	leaderelection::LeaderElector,
	manifest::is_manifest_file,
	stack::{ApplyOutcome, Stack, StackError},
};

/// Capacity of the trigger channel. Triggers beyond it are dropped, the
/// pending ones already cause an apply.
const TRIGGER_CAPACITY: usize = 64;

/// Why a stack is being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
	Initial,
	FileChanged(PathBuf),
	LeaderAcquired,
	Sweep,
}

impl Trigger {
	/// Only manifest file changes matter; everything else always applies.
	fn is_relevant(&self) -> bool {
		match self {
			Self::FileChanged(path) => is_manifest_file(path),
			_ => true,
		}
	}
}

/// Converges one stack directory.
#[derive(Builder)]
pub struct StackApplier {
	#[builder(into)]
	name: String,
	#[builder(into)]
	dir: PathBuf,
	store: Arc<dyn ResourceStore>,
	leader: Arc<dyn LeaderElector>,
	#[builder(default = Duration::from_secs(1))]
	debounce: Duration,
	#[builder(default)]
	retry: RetryConfig,
	/// Serializes passes and the final cleanup.
	#[builder(skip)]
	pass: tokio::sync::Mutex<()>,
	#[builder(skip)]
	last_outcome: Mutex<Option<ApplyOutcome>>,
}

impl StackApplier {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Spawn the convergence loop.
	pub fn start(self) -> RunningStack {
		let applier = Arc::new(self);
		let (triggers, rx) = mpsc::channel(TRIGGER_CAPACITY);
		let cancel = CancellationToken::new();
		let watcher = applier.watch(triggers.clone());

		let task = tokio::spawn({
			let applier = Arc::clone(&applier);
			let cancel = cancel.clone();
			async move {
				applier.run(rx, cancel).await;
				drop(watcher);
			}
		});

		RunningStack {
			applier,
			triggers,
			cancel,
			task,
		}
	}

	/// Watch the stack directory. `None` leaves the stack to manager triggers.
	fn watch(&self, triggers: mpsc::Sender<Trigger>) -> Option<RecommendedWatcher> {
		let stack = self.name.clone();
		let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
			Ok(event) => {
				if !matches!(
					event.kind,
					EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
				) {
					return;
				}
				for path in event.paths {
					if triggers.try_send(Trigger::FileChanged(path)).is_err() {
						tracing::trace!(%stack, "trigger channel full");
					}
				}
			}
			Err(e) => tracing::warn!(%stack, error = %e, "filesystem watcher error"),
		});

		let result = watcher.and_then(|mut watcher| {
			watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
			Ok(watcher)
		});
		match result {
			Ok(watcher) => Some(watcher),
			Err(e) => {
				tracing::warn!(
					stack = %self.name,
					error = %e,
					"cannot watch stack directory, relying on periodic sweeps"
				);
				None
			}
		}
	}

	async fn run(self: Arc<Self>, triggers: mpsc::Receiver<Trigger>, cancel: CancellationToken) {
		self.converge(Trigger::Initial, &cancel).await;

		let applier = Arc::clone(&self);
		let converge_cancel = cancel.clone();
		Debouncer::new(self.debounce)
			.with_filter(Trigger::is_relevant)
			.run(triggers, cancel, move |trigger| {
				let applier = Arc::clone(&applier);
				let cancel = converge_cancel.clone();
				async move { applier.converge(trigger, &cancel).await }
			})
			.await;
		tracing::debug!(stack = %self.name, "stack loop stopped");
	}

	/// Apply the stack from disk, with retries.
	#[instrument(skip(self, cancel), fields(stack = %self.name))]
	async fn converge(&self, trigger: Trigger, cancel: &CancellationToken) {
		let outcome = self
			.with_retry(cancel, || async {
				let stack = Stack::from_dir(&self.name, &self.dir)?;
				stack.apply(&self.store, true).await
			})
			.await;
		if let Some(outcome) = outcome {
			*self
				.last_outcome
				.lock()
				.unwrap_or_else(PoisonError::into_inner) = Some(outcome);
		}
	}

	/// Delete everything the stack owns. Returns whether that finished; a
	/// replica that is not leading, or is cancelled, deletes nothing.
	#[instrument(skip(self, cancel), fields(stack = %self.name))]
	pub async fn cleanup(&self, cancel: &CancellationToken) -> bool {
		let deleted = self
			.with_retry(cancel, || async {
				Stack::empty(self.name.as_str()).apply(&self.store, true).await
			})
			.await;
		match deleted {
			Some(outcome) => {
				tracing::info!(pruned = outcome.pruned.len(), "stack deleted");
				true
			}
			None => false,
		}
	}

	/// Run `pass` while leading, retrying failures with backoff.
	///
	/// Returns `None` when not leading, cancelled or out of attempts.
	async fn with_retry<F, Fut>(&self, cancel: &CancellationToken, mut pass: F) -> Option<ApplyOutcome>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<ApplyOutcome, StackError>>,
	{
		let attempts = self.retry.attempts.max(1);
		for attempt in 0..attempts {
			if cancel.is_cancelled() {
				return None;
			}
			if !self.leader.is_leader() {
				tracing::debug!("not leading, skipping");
				return None;
			}

			let result = {
				let _pass = self.pass.lock().await;
				pass().await
			};
			match result {
				Ok(outcome) => return Some(outcome),
				Err(e) => {
					self.store.invalidate_discovery();
					tracing::warn!(attempt = attempt + 1, attempts, error = %error_chain(&e), "stack pass failed");
				}
			}

			if attempt + 1 < attempts {
				tokio::select! {
					() = cancel.cancelled() => return None,
					() = tokio::time::sleep(self.retry.backoff(attempt)) => {}
				}
			}
		}

		tracing::error!("giving up until the next trigger");
		None
	}
}

fn error_chain(err: &dyn StdError) -> String {
	let mut message = err.to_string();
	let mut source = err.source();
	while let Some(cause) = source {
		message.push_str(": ");
		message.push_str(&cause.to_string());
		source = cause.source();
	}
	message
}

/// Handle to a started [`StackApplier`].
pub struct RunningStack {
	applier: Arc<StackApplier>,
	triggers: mpsc::Sender<Trigger>,
	cancel: CancellationToken,
	task: JoinHandle<()>,
}

impl RunningStack {
	pub fn name(&self) -> &str {
		self.applier.name()
	}

	/// Request an apply. Returns false if the trigger was dropped.
	pub fn trigger(&self, trigger: Trigger) -> bool {
		match self.triggers.try_send(trigger) {
			Ok(()) => true,
			Err(e) => {
				tracing::debug!(stack = %self.name(), error = %e, "dropping trigger");
				false
			}
		}
	}

	/// Whether the loop is still running. Says nothing about apply success.
	pub fn is_alive(&self) -> bool {
		!self.task.is_finished()
	}

	/// Outcome of the most recent successful pass.
	pub fn last_outcome(&self) -> Option<ApplyOutcome> {
		self.applier
			.last_outcome
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Stop the loop, waiting for an in-flight pass to finish. The returned
	/// applier can still [`cleanup`](StackApplier::cleanup) the stack.
	pub async fn stop(self) -> Arc<StackApplier> {
		self.cancel.cancel();
		if let Err(e) = self.task.await {
			tracing::warn!(stack = %self.applier.name(), error = %e, "stack loop panicked");
		}
		self.applier
	}
}
