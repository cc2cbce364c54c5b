//! Lock-free "latest value" broadcast.
//!
//! A [`Latest`] holds the current value together with a token that gets
//! cancelled once that value is replaced. Readers take a [`Snapshot`], act on
//! its value and await [`Snapshot::expired`] to learn when to look again. No
//! per-reader queues, no polling.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;

/// A value paired with its staleness signal.
#[derive(Debug)]
pub struct Snapshot<T> {
	value: T,
	expired: CancellationToken,
}

impl<T> Snapshot<T> {
	fn new(value: T) -> Self {
		Self {
			value,
			expired: CancellationToken::new(),
		}
	}

	pub fn value(&self) -> &T {
		&self.value
	}

	/// Resolves once a newer value has been published.
	pub async fn expired(&self) {
		self.expired.cancelled().await;
	}

	pub fn is_expired(&self) -> bool {
		self.expired.is_cancelled()
	}
}

/// Atomic cell of the most recent [`Snapshot`].
#[derive(Debug)]
pub struct Latest<T> {
	current: ArcSwapOption<Snapshot<T>>,
}

impl<T> Default for Latest<T> {
	fn default() -> Self {
		Self {
			current: ArcSwapOption::const_empty(),
		}
	}
}

impl<T: Default> Latest<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Current snapshot.
	///
	/// Before the first [`Latest::set`] this is `T::default()`, whose signal
	/// fires on the first write. Concurrent first readers all get the same
	/// snapshot: only one of them installs it.
	pub fn peek(&self) -> Arc<Snapshot<T>> {
		if let Some(current) = self.current.load_full() {
			return current;
		}

		let fresh = Arc::new(Snapshot::new(T::default()));
		let previous = self
			.current
			.compare_and_swap(&None::<Arc<Snapshot<T>>>, Some(Arc::clone(&fresh)));
		match &*previous {
			Some(winner) => Arc::clone(winner),
			None => fresh,
		}
	}

	/// Publish a new value and expire the previous snapshot.
	pub fn set(&self, value: T) {
		if let Some(previous) = self.current.swap(Some(Arc::new(Snapshot::new(value)))) {
			previous.expired.cancel();
		}
	}
}
