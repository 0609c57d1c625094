//! Exponential backoff with a grace-period reset, shared across the connections
//! the supervisor is retrying.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tunnel_core::clock::Clock;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
	pub base: Duration,
	/// `None` means retry forever; the exhaustion condition never fires.
	pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(1),
			max_retries: Some(5),
		}
	}
}

#[derive(Debug, Default)]
struct State {
	retries: u32,
	reset_deadline: Option<Instant>,
}

/// Per-connection retry clock. Cheap to clone; state is shared.
#[derive(Clone)]
pub struct Backoff {
	config: BackoffConfig,
	clock: Arc<dyn Clock>,
	state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Backoff {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.state.lock();
		f.debug_struct("Backoff")
			.field("config", &self.config)
			.field("retries", &state.retries)
			.finish()
	}
}

impl Backoff {
	pub fn new(config: BackoffConfig, clock: Arc<dyn Clock>) -> Self {
		Self {
			config,
			clock,
			state: Arc::new(Mutex::new(State::default())),
		}
	}

	pub fn retries(&self) -> u32 {
		self.state.lock().retries
	}

	fn duration_for(&self, retries: u32) -> Duration {
		self.config.base.saturating_mul(1u32.checked_shl(retries).unwrap_or(u32::MAX))
	}

	/// Returns the next backoff duration without consuming a retry. `ok=false`
	/// if `cancel` is already cancelled or retries are exhausted.
	pub fn peek(&self, cancel: &CancellationToken) -> (Duration, bool) {
		if cancel.is_cancelled() {
			return (Duration::ZERO, false);
		}
		let mut state = self.state.lock();
		if let Some(deadline) = state.reset_deadline {
			if self.clock.now() >= deadline {
				state.retries = 0;
				state.reset_deadline = None;
			}
		}
		if let Some(max) = self.config.max_retries {
			if state.retries >= max {
				return (Duration::ZERO, false);
			}
		}
		(self.duration_for(state.retries), true)
	}

	/// Sleeps the computed duration, then consumes one retry. Returns `false`
	/// if `cancel` fires first or retries were already exhausted.
	pub async fn wait(&self, cancel: &CancellationToken) -> bool {
		let (duration, ok) = self.peek(cancel);
		if !ok {
			return false;
		}
		let deadline = self.clock.now() + duration;
		tokio::select! {
			_ = self.clock.sleep_until(deadline) => {
				self.state.lock().retries += 1;
				true
			}
			_ = cancel.cancelled() => false,
		}
	}

	/// Marks the connection healthy: a reset deadline is armed `base * 2^retries`
	/// from now. Once it passes, the next `peek`/`wait` resets retries to zero.
	pub fn mark_connected_grace(&self) {
		let mut state = self.state.lock();
		let grace = self.duration_for(state.retries);
		state.reset_deadline = Some(self.clock.now() + grace);
	}

	/// A one-shot deadline future for the current backoff, for use in `select!`
	/// without consuming a retry.
	pub fn timer(&self, cancel: &CancellationToken) -> Pin<Box<dyn Future<Output = bool> + Send>> {
		let (duration, ok) = self.peek(cancel);
		if !ok {
			return Box::pin(async { false });
		}
		let clock = self.clock.clone();
		let deadline = clock.now() + duration;
		Box::pin(async move {
			clock.sleep_until(deadline).await;
			true
		})
	}
}

#[cfg(test)]
mod tests {
	use tunnel_core::clock::FakeClock;

	use super::*;

	fn backoff(max_retries: Option<u32>, clock: Arc<FakeClock>) -> Backoff {
		Backoff::new(
			BackoffConfig {
				base: Duration::from_millis(10),
				max_retries,
			},
			clock,
		)
	}

	#[tokio::test]
	async fn schedule_is_base_times_two_to_the_retries() {
		let clock = Arc::new(FakeClock::new());
		let b = backoff(Some(10), clock.clone());
		let cancel = CancellationToken::new();
		for k in 0..4u32 {
			let (d, ok) = b.peek(&cancel);
			assert!(ok);
			assert_eq!(d, Duration::from_millis(10) * 2u32.pow(k));
			let waiter = tokio::spawn({
				let b = b.clone();
				let cancel = cancel.clone();
				async move { b.wait(&cancel).await }
			});
			tokio::task::yield_now().await;
			clock.advance(d);
			assert!(waiter.await.unwrap());
		}
	}

	#[tokio::test]
	async fn exhaustion_then_grace_resets() {
		let clock = Arc::new(FakeClock::new());
		let b = backoff(Some(3), clock.clone());
		let cancel = CancellationToken::new();
		for _ in 0..3 {
			let (d, ok) = b.peek(&cancel);
			assert!(ok);
			let waiter = tokio::spawn({
				let b = b.clone();
				let cancel = cancel.clone();
				async move { b.wait(&cancel).await }
			});
			tokio::task::yield_now().await;
			clock.advance(d);
			assert!(waiter.await.unwrap());
		}
		assert_eq!(b.retries(), 3);
		// retries == max_retries is exhaustion: the fourth peek must be false.
		let (_, ok) = b.peek(&cancel);
		assert!(!ok, "expected exhaustion once retries reaches max_retries");

		b.mark_connected_grace();
		let grace = Duration::from_millis(10) * 2u32.pow(3);
		clock.advance(grace + Duration::from_millis(1));

		let (d, ok) = b.peek(&cancel);
		assert!(ok);
		assert_eq!(d, Duration::from_millis(10));
		assert_eq!(b.retries(), 0);
	}

	#[tokio::test]
	async fn cancellation_stops_wait_immediately() {
		let clock = Arc::new(FakeClock::new());
		let b = backoff(Some(10), clock);
		let cancel = CancellationToken::new();
		cancel.cancel();
		assert!(!b.wait(&cancel).await);
	}
}
