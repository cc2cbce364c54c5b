//! Leader election.
//!
//! Only the elected replica converges stacks. Electors publish their status
//! through a [`Latest`] cell, so any number of stack loops can follow
//! leadership changes without polling.
//!
//! [`LeasePool`] competes for a `coordination.k8s.io/v1` Lease. [`LocalLeader`]
//! is a manually controlled elector for single-replica setups and tests.

use std::{
	fmt,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use chrono::{SecondsFormat, Utc};
use k8s_openapi::{api::coordination::v1::Lease, apimachinery::pkg::apis::meta::v1::MicroTime};
use kube::{
	api::{Api, PostParams},
	Client,
};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::latest::{Latest, Snapshot};

/// Leadership status of this replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeaderStatus {
	#[default]
	Pending,
	Leading,
}

impl fmt::Display for LeaderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Pending => "pending",
			Self::Leading => "leading",
		})
	}
}

/// Source of leadership status.
pub trait LeaderElector: Send + Sync {
	/// The current status and a signal that fires when it changes.
	fn current_status(&self) -> Arc<Snapshot<LeaderStatus>>;

	fn is_leader(&self) -> bool {
		*self.current_status().value() == LeaderStatus::Leading
	}
}

/// Elector whose status is set by hand.
#[derive(Debug, Default)]
pub struct LocalLeader {
	status: Latest<LeaderStatus>,
}

impl LocalLeader {
	pub fn new(initial: LeaderStatus) -> Self {
		let leader = Self::default();
		leader.status.set(initial);
		leader
	}

	/// Always leading; used when election is disabled.
	pub fn leading() -> Self {
		Self::new(LeaderStatus::Leading)
	}

	/// Publish `status` if it differs from the current one.
	pub fn set(&self, status: LeaderStatus) {
		if *self.status.peek().value() != status {
			self.status.set(status);
		}
	}
}

impl LeaderElector for LocalLeader {
	fn current_status(&self) -> Arc<Snapshot<LeaderStatus>> {
		self.status.peek()
	}
}

/// Follows an elector and yields each status transition.
///
/// Starts from [`LeaderStatus::Pending`], so an elector that is already
/// leading reports [`LeaderStatus::Leading`] on the first call.
pub struct LeadershipWatch {
	elector: Arc<dyn LeaderElector>,
	previous: LeaderStatus,
}

impl LeadershipWatch {
	pub fn new(elector: Arc<dyn LeaderElector>) -> Self {
		Self {
			elector,
			previous: LeaderStatus::Pending,
		}
	}

	/// Wait for the status to differ from the last one returned.
	///
	/// Cancel safe: dropping the future before it completes loses nothing,
	/// the next call still reports the transition.
	pub async fn changed(&mut self) -> LeaderStatus {
		loop {
			let snapshot = self.elector.current_status();
			let status = *snapshot.value();
			if status != self.previous {
				tracing::info!(%status, "leadership changed");
				self.previous = status;
				return status;
			}
			snapshot.expired().await;
		}
	}
}

/// Invoke `on_acquired`/`on_lost` on every status transition until cancelled.
pub async fn watch_leadership<A, L>(
	elector: Arc<dyn LeaderElector>,
	cancel: CancellationToken,
	mut on_acquired: A,
	mut on_lost: L,
) where
	A: FnMut(),
	L: FnMut(),
{
	let mut watch = LeadershipWatch::new(elector);
	loop {
		tokio::select! {
			() = cancel.cancelled() => return,
			status = watch.changed() => match status {
				LeaderStatus::Leading => on_acquired(),
				LeaderStatus::Pending => on_lost(),
			},
		}
	}
}

#[derive(Debug, Error)]
pub enum LeaderElectionError {
	#[error("lease namespace may not be empty")]
	EmptyNamespace,

	#[error("lease name may not be empty")]
	EmptyName,

	#[error("lease identity may not be empty")]
	EmptyIdentity,

	#[error("renew deadline ({renew_deadline:?}) must be shorter than the lease duration ({lease_duration:?})")]
	InvalidTiming {
		lease_duration: Duration,
		renew_deadline: Duration,
	},

	#[error("building lease object")]
	Serialization(#[source] serde_json::Error),

	#[error(transparent)]
	Kube(Box<kube::Error>),
}

impl From<kube::Error> for LeaderElectionError {
	fn from(err: kube::Error) -> Self {
		Self::Kube(Box::new(err))
	}
}

/// Lease parameters.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
	pub namespace: String,
	pub name: String,
	pub identity: String,
	pub lease_duration: Duration,
	pub renew_deadline: Duration,
	pub retry_period: Duration,
}

impl LeaseConfig {
	fn validate(&self) -> Result<(), LeaderElectionError> {
		if self.namespace.is_empty() {
			return Err(LeaderElectionError::EmptyNamespace);
		}
		if self.name.is_empty() {
			return Err(LeaderElectionError::EmptyName);
		}
		if self.identity.is_empty() {
			return Err(LeaderElectionError::EmptyIdentity);
		}
		if self.renew_deadline >= self.lease_duration {
			return Err(LeaderElectionError::InvalidTiming {
				lease_duration: self.lease_duration,
				renew_deadline: self.renew_deadline,
			});
		}
		Ok(())
	}
}

/// Last change of the lease record seen by this replica.
///
/// Expiry is judged by when we saw the record change, on our own clock,
/// never by the timestamps other replicas wrote.
#[derive(Debug, Clone)]
struct Observed {
	holder: Option<String>,
	renew_time: Option<MicroTime>,
	at: Instant,
}

/// Whether a lease held by `holder` may be taken over by `identity`.
fn may_take(
	holder: Option<&str>,
	identity: &str,
	observed_at: Instant,
	lease_duration: Duration,
	now: Instant,
) -> bool {
	match holder {
		None | Some("") => true,
		Some(holder) if holder == identity => true,
		Some(_) => observed_at + lease_duration <= now,
	}
}

fn now_micro() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lease-based elector.
pub struct LeasePool {
	api: Api<Lease>,
	config: LeaseConfig,
	status: Latest<LeaderStatus>,
	observed: Mutex<Option<Observed>>,
}

impl LeaderElector for LeasePool {
	fn current_status(&self) -> Arc<Snapshot<LeaderStatus>> {
		self.status.peek()
	}
}

impl LeasePool {
	pub fn new(client: Client, config: LeaseConfig) -> Result<Self, LeaderElectionError> {
		config.validate()?;
		Ok(Self {
			api: Api::namespaced(client, &config.namespace),
			config,
			status: Latest::new(),
			observed: Mutex::new(None),
		})
	}

	/// Compete for the lease until cancelled, then release it if held.
	#[instrument(skip_all, fields(lease = %self.config.name, identity = %self.config.identity))]
	pub async fn run(&self, cancel: CancellationToken) {
		loop {
			if !self.acquire(&cancel).await {
				return;
			}
			self.status.set(LeaderStatus::Leading);
			tracing::info!("acquired lease");

			let cancelled = self.hold(&cancel).await;
			self.status.set(LeaderStatus::Pending);
			if cancelled {
				if let Err(e) = self.release().await {
					tracing::warn!(error = %e, "failed to release lease");
				}
				return;
			}
			tracing::warn!("lost lease");
		}
	}

	/// Retry until the lease is ours. Returns false when cancelled.
	async fn acquire(&self, cancel: &CancellationToken) -> bool {
		loop {
			match self.try_acquire_or_renew().await {
				Ok(true) => return true,
				Ok(false) => {}
				Err(e) => tracing::debug!(error = %e, "failed to acquire lease"),
			}
			tokio::select! {
				() = cancel.cancelled() => return false,
				() = tokio::time::sleep(self.config.retry_period) => {}
			}
		}
	}

	/// Keep renewing. Returns true when cancelled, false when the lease is lost.
	async fn hold(&self, cancel: &CancellationToken) -> bool {
		let mut renewed_at = Instant::now();
		loop {
			tokio::select! {
				() = cancel.cancelled() => return true,
				() = tokio::time::sleep(self.config.retry_period) => {}
			}
			match self.try_acquire_or_renew().await {
				Ok(true) => renewed_at = Instant::now(),
				Ok(false) => return false,
				Err(e) => {
					tracing::debug!(error = %e, "failed to renew lease");
					if renewed_at.elapsed() >= self.config.renew_deadline {
						return false;
					}
				}
			}
		}
	}

	/// Record the lease's (holder, renewTime) and return when it last changed.
	fn observe(&self, holder: &Option<String>, renew_time: &Option<MicroTime>) -> Instant {
		let mut observed = self
			.observed
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		match observed.as_ref() {
			Some(seen) if seen.holder == *holder && seen.renew_time == *renew_time => seen.at,
			_ => {
				let at = Instant::now();
				*observed = Some(Observed {
					holder: holder.clone(),
					renew_time: renew_time.clone(),
					at,
				});
				at
			}
		}
	}

	fn lease_object(
		&self,
		resource_version: Option<String>,
		acquire_time: serde_json::Value,
		transitions: i32,
	) -> Result<Lease, LeaderElectionError> {
		serde_json::from_value(json!({
			"apiVersion": "coordination.k8s.io/v1",
			"kind": "Lease",
			"metadata": {
				"name": self.config.name,
				"namespace": self.config.namespace,
				"resourceVersion": resource_version,
			},
			"spec": {
				"holderIdentity": self.config.identity,
				"leaseDurationSeconds": self.config.lease_duration.as_secs(),
				"acquireTime": acquire_time,
				"renewTime": now_micro(),
				"leaseTransitions": transitions,
			},
		}))
		.map_err(LeaderElectionError::Serialization)
	}

	async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
		let Some(existing) = self.api.get_opt(&self.config.name).await? else {
			let lease = self.lease_object(None, json!(now_micro()), 0)?;
			return match self.api.create(&PostParams::default(), &lease).await {
				Ok(_) => Ok(true),
				Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
				Err(e) => Err(e.into()),
			};
		};

		let spec = existing.spec.unwrap_or_default();
		let observed_at = self.observe(&spec.holder_identity, &spec.renew_time);
		let lease_duration = spec
			.lease_duration_seconds
			.and_then(|s| u64::try_from(s).ok())
			.map_or(self.config.lease_duration, Duration::from_secs);
		let holder = spec.holder_identity.as_deref();
		if !may_take(holder, &self.config.identity, observed_at, lease_duration, Instant::now()) {
			return Ok(false);
		}

		let ours = holder == Some(self.config.identity.as_str());
		let (acquire_time, transitions) = if ours {
			(
				serde_json::to_value(&spec.acquire_time).map_err(LeaderElectionError::Serialization)?,
				spec.lease_transitions.unwrap_or(0),
			)
		} else {
			(json!(now_micro()), spec.lease_transitions.unwrap_or(0) + 1)
		};
		let lease = self.lease_object(existing.metadata.resource_version, acquire_time, transitions)?;

		match self
			.api
			.replace(&self.config.name, &PostParams::default(), &lease)
			.await
		{
			Ok(_) => Ok(true),
			Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Give up the lease so another replica can take over immediately.
	async fn release(&self) -> Result<(), LeaderElectionError> {
		let Some(existing) = self.api.get_opt(&self.config.name).await? else {
			return Ok(());
		};
		let spec = existing.spec.clone().unwrap_or_default();
		if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
			return Ok(());
		}

		let lease: Lease = serde_json::from_value(json!({
			"apiVersion": "coordination.k8s.io/v1",
			"kind": "Lease",
			"metadata": {
				"name": self.config.name,
				"namespace": self.config.namespace,
				"resourceVersion": existing.metadata.resource_version,
			},
			"spec": {
				"leaseDurationSeconds": 1,
				"renewTime": now_micro(),
				"leaseTransitions": spec.lease_transitions,
			},
		}))
		.map_err(LeaderElectionError::Serialization)?;
		self.api
			.replace(&self.config.name, &PostParams::default(), &lease)
			.await?;
		tracing::info!("released lease");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn test_local_leader_status() {
		let leader = LocalLeader::default();
		assert!(!leader.is_leader());

		let before = leader.current_status();
		leader.set(LeaderStatus::Leading);
		assert!(before.is_expired());
		assert!(leader.is_leader());

		// Setting the same status again does not wake readers.
		let current = leader.current_status();
		leader.set(LeaderStatus::Leading);
		assert!(!current.is_expired());
	}

	#[tokio::test]
	async fn test_watch_leadership_reports_transitions() {
		let leader = Arc::new(LocalLeader::default());
		let acquired = Arc::new(AtomicUsize::new(0));
		let lost = Arc::new(AtomicUsize::new(0));
		let cancel = CancellationToken::new();

		let task = tokio::spawn({
			let elector: Arc<dyn LeaderElector> = leader.clone();
			let acquired = Arc::clone(&acquired);
			let lost = Arc::clone(&lost);
			watch_leadership(
				elector,
				cancel.clone(),
				move || {
					acquired.fetch_add(1, Ordering::SeqCst);
				},
				move || {
					lost.fetch_add(1, Ordering::SeqCst);
				},
			)
		});

		leader.set(LeaderStatus::Leading);
		tokio::time::sleep(Duration::from_millis(50)).await;
		leader.set(LeaderStatus::Pending);
		tokio::time::sleep(Duration::from_millis(50)).await;
		leader.set(LeaderStatus::Leading);
		tokio::time::sleep(Duration::from_millis(50)).await;
		cancel.cancel();
		task.await.unwrap();

		assert_eq!(acquired.load(Ordering::SeqCst), 2);
		assert_eq!(lost.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_leadership_watch_survives_dropped_waits() {
		let leader = Arc::new(LocalLeader::default());
		let mut watch = LeadershipWatch::new(leader.clone());

		let timed_out = tokio::time::timeout(Duration::from_millis(20), watch.changed()).await;
		assert!(timed_out.is_err());

		leader.set(LeaderStatus::Leading);
		leader.set(LeaderStatus::Pending);
		leader.set(LeaderStatus::Leading);
		// Only the net change since the last report is seen.
		assert_eq!(watch.changed().await, LeaderStatus::Leading);
		let timed_out = tokio::time::timeout(Duration::from_millis(20), watch.changed()).await;
		assert!(timed_out.is_err());

		leader.set(LeaderStatus::Pending);
		assert_eq!(watch.changed().await, LeaderStatus::Pending);
	}

	#[test]
	fn test_may_take() {
		let now = Instant::now();
		let duration = Duration::from_secs(60);
		let later = now + Duration::from_secs(61);

		assert!(may_take(None, "me", now, duration, now));
		assert!(may_take(Some(""), "me", now, duration, now));
		assert!(may_take(Some("me"), "me", now, duration, now));
		assert!(!may_take(Some("other"), "me", now, duration, now));
		assert!(may_take(Some("other"), "me", now, duration, later));
	}

	#[test]
	fn test_lease_config_validation() {
		let config = LeaseConfig {
			namespace: "kube-system".into(),
			name: "stack-applier".into(),
			identity: "node-a".into(),
			lease_duration: Duration::from_secs(60),
			renew_deadline: Duration::from_secs(15),
			retry_period: Duration::from_secs(5),
		};
		assert!(config.validate().is_ok());

		let config = LeaseConfig {
			renew_deadline: Duration::from_secs(60),
			..config
		};
		assert_matches!(config.validate(), Err(LeaderElectionError::InvalidTiming { .. }));

		let config = LeaseConfig {
			identity: String::new(),
			..config
		};
		assert_matches!(config.validate(), Err(LeaderElectionError::EmptyIdentity));
	}
}
