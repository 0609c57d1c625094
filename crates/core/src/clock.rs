//! An injectable time source so components that schedule retries and refreshes
//! (backoff, credential refresh) can be driven deterministically in tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Capability for reading "now" and sleeping until a point in time.
///
/// Production code uses [`SystemClock`]; tests use [`FakeClock`] and advance it
/// explicitly instead of relying on `tokio::time::pause`, since every caller here
/// already takes a `Clock` rather than reading wall time itself.
pub trait Clock: Send + Sync + std::fmt::Debug {
	fn now(&self) -> Instant;

	/// Sleep until `deadline` has passed according to this clock.
	fn sleep_until<'a>(
		&'a self,
		deadline: Instant,
	) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}

	fn sleep_until<'a>(&'a self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
		Box::pin(tokio::time::sleep_until(deadline.into()))
	}
}

/// A manually-advanced clock for deterministic tests.
///
/// `sleep_until` resolves as soon as [`FakeClock::advance`] moves the fake `now`
/// past the requested deadline; it polls a notify channel rather than busy-waiting.
#[derive(Clone)]
pub struct FakeClock {
	inner: Arc<Mutex<Instant>>,
	notify: Arc<tokio::sync::Notify>,
}

impl std::fmt::Debug for FakeClock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FakeClock").field("now", &*self.inner.lock()).finish()
	}
}

impl FakeClock {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(Instant::now())),
			notify: Arc::new(tokio::sync::Notify::new()),
		}
	}

	pub fn advance(&self, by: Duration) {
		{
			let mut now = self.inner.lock();
			*now += by;
		}
		self.notify.notify_waiters();
	}
}

impl Default for FakeClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for FakeClock {
	fn now(&self) -> Instant {
		*self.inner.lock()
	}

	fn sleep_until<'a>(&'a self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
		Box::pin(async move {
			loop {
				if self.now() >= deadline {
					return;
				}
				let notified = self.notify.notified();
				if self.now() >= deadline {
					return;
				}
				notified.await;
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn fake_clock_resolves_once_advanced_past_deadline() {
		let clock = FakeClock::new();
		let deadline = clock.now() + Duration::from_secs(5);
		let waiter = tokio::spawn({
			let clock = clock.clone();
			async move { clock.sleep_until(deadline).await }
		});
		tokio::task::yield_now().await;
		clock.advance(Duration::from_secs(3));
		tokio::task::yield_now().await;
		assert!(!waiter.is_finished());
		clock.advance(Duration::from_secs(2));
		waiter.await.unwrap();
	}
}
