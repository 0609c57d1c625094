//! Counting semaphore bounding concurrent in-flight flows.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;

use crate::metrics::Metrics;

#[derive(Debug, thiserror::Error)]
#[error("too many concurrent flows")]
pub struct TooManyFlows;

#[derive(Debug)]
struct Inner {
	active: AtomicI64,
	/// 0 means unlimited. Stored behind a lock since `set_limit` is rare and
	/// `acquire` needs a consistent read of both the limit and the counter.
	max: RwLock<u64>,
	metrics: Arc<Metrics>,
}

/// Process-wide bound on concurrent flows. `acquire`/`release` are lock-free
/// on the hot path; `set_limit` takes effect immediately but never closes
/// flows that are already open.
#[derive(Clone)]
pub struct FlowLimiter {
	inner: Arc<Inner>,
}

impl FlowLimiter {
	pub fn new(max: u64, metrics: Arc<Metrics>) -> Self {
		Self {
			inner: Arc::new(Inner {
				active: AtomicI64::new(0),
				max: RwLock::new(max),
				metrics,
			}),
		}
	}

	pub fn set_limit(&self, n: u64) {
		*self.inner.max.write() = n;
	}

	pub fn active(&self) -> i64 {
		self.inner.active.load(Ordering::SeqCst)
	}

	/// Attempts to reserve one flow slot. `label` identifies the caller for the
	/// per-label dropped-flow counter.
	pub fn acquire(&self, label: &str) -> Result<FlowGuard, TooManyFlows> {
		let max = *self.inner.max.read();
		if max != 0 {
			loop {
				let current = self.inner.active.load(Ordering::SeqCst);
				if current as u64 >= max {
					self
						.inner
						.metrics
						.flow_drops
						.get_or_create(&crate::metrics::FlowLabel { label: label.to_string() })
						.inc();
					return Err(TooManyFlows);
				}
				if self
					.inner
					.active
					.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
					.is_ok()
				{
					break;
				}
			}
		} else {
			self.inner.active.fetch_add(1, Ordering::SeqCst);
		}
		Ok(FlowGuard { inner: self.inner.clone() })
	}
}

/// Releases its flow slot on drop. Releasing below zero is a no-op.
pub struct FlowGuard {
	inner: Arc<Inner>,
}

impl Drop for FlowGuard {
	fn drop(&mut self) {
		loop {
			let current = self.inner.active.load(Ordering::SeqCst);
			if current <= 0 {
				return;
			}
			if self
				.inner
				.active
				.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
			{
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use prometheus_client::registry::Registry;

	use super::*;

	fn metrics() -> Arc<Metrics> {
		Arc::new(Metrics::new(&mut Registry::default()))
	}

	#[test]
	fn bounded_limit_rejects_past_max() {
		let limiter = FlowLimiter::new(2, metrics());
		let a = limiter.acquire("test").unwrap();
		let b = limiter.acquire("test").unwrap();
		assert!(limiter.acquire("test").is_err());
		assert_eq!(limiter.active(), 2);
		drop(a);
		assert_eq!(limiter.active(), 1);
		let _c = limiter.acquire("test").unwrap();
		drop(b);
	}

	#[test]
	fn zero_limit_is_unbounded() {
		let limiter = FlowLimiter::new(0, metrics());
		let guards: Vec<_> = (0..100).map(|_| limiter.acquire("x").unwrap()).collect();
		assert_eq!(limiter.active(), 100);
		drop(guards);
		assert_eq!(limiter.active(), 0);
	}

	#[test]
	fn set_limit_does_not_retroactively_close_flows() {
		let limiter = FlowLimiter::new(5, metrics());
		let guards: Vec<_> = (0..5).map(|_| limiter.acquire("x").unwrap()).collect();
		limiter.set_limit(1);
		assert_eq!(limiter.active(), 5);
		assert!(limiter.acquire("x").is_err());
		drop(guards);
		assert!(limiter.acquire("x").is_ok());
	}
}
