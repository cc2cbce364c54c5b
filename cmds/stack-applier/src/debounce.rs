//! Coalescing of bursty change notifications.

use std::{future::Future, time::Duration};

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Fires a callback once per quiet period with the most recent notification.
///
/// Idle until a notification arrives, then pending until `quiet` has passed
/// without another one. Each new notification replaces the pending payload
/// and restarts the timer. Cancellation drops whatever is pending and no
/// callback runs afterwards.
pub struct Debouncer<T> {
	quiet: Duration,
	filter: Box<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> Debouncer<T> {
	pub fn new(quiet: Duration) -> Self {
		Self {
			quiet,
			filter: Box::new(|_| true),
		}
	}

	/// Only notifications matching `filter` are considered.
	pub fn with_filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
		self.filter = Box::new(filter);
		self
	}

	/// Drive the debouncer until `cancel` fires or `input` closes.
	///
	/// The callback is awaited in place, so firings never overlap. When the
	/// input closes, a pending notification still fires after its quiet period.
	pub async fn run<F, Fut>(
		self,
		mut input: mpsc::Receiver<T>,
		cancel: CancellationToken,
		mut on_fire: F,
	) where
		F: FnMut(T) -> Fut,
		Fut: Future<Output = ()>,
	{
		let mut pending: Option<T> = None;
		let mut open = true;
		let timer = tokio::time::sleep(self.quiet);
		tokio::pin!(timer);

		loop {
			tokio::select! {
				biased;

				() = cancel.cancelled() => return,

				item = input.recv(), if open => match item {
					Some(item) => {
						if (self.filter)(&item) {
							pending = Some(item);
							timer.as_mut().reset(Instant::now() + self.quiet);
						}
					}
					None => {
						open = false;
						if pending.is_none() {
							return;
						}
					}
				},

				() = &mut timer, if pending.is_some() => {
					if let Some(item) = pending.take() {
						on_fire(item).await;
					}
					if !open {
						return;
					}
				}
			}
		}
	}
}
