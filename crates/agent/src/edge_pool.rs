//! Ordered reserve of candidate edge addresses, with replacement and
//! singleflight re-resolution.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tunnel_core::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeAddress(pub SocketAddr);

#[derive(Debug)]
struct State {
	addrs: Vec<EdgeAddress>,
	next_unused: usize,
	last_resolve: Option<std::time::Instant>,
	resolving: bool,
}

/// Flat array of edge addresses plus a cursor into the unused tail. Mutated
/// only by the supervisor, but internally locked since re-resolution races
/// with `replace` calls from per-connection tasks.
pub struct EdgePool {
	state: Mutex<State>,
	resolve_ttl: Duration,
	clock: Arc<dyn Clock>,
}

impl EdgePool {
	pub fn new(addrs: Vec<EdgeAddress>, resolve_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
		Self {
			state: Mutex::new(State {
				addrs,
				next_unused: 0,
				last_resolve: None,
				resolving: false,
			}),
			resolve_ttl,
			clock,
		}
	}

	pub fn len(&self) -> usize {
		self.state.lock().addrs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Addresses never yet tried.
	pub fn available(&self) -> usize {
		let state = self.state.lock();
		state.addrs.len() - state.next_unused
	}

	pub fn addr_for(&self, index: usize) -> EdgeAddress {
		let state = self.state.lock();
		state.addrs[index % state.addrs.len()]
	}

	/// Advances the cursor so the address returned for `index` is distinct
	/// from the one currently assigned there.
	pub fn different_addr(&self, index: usize) -> EdgeAddress {
		let mut state = self.state.lock();
		let len = state.addrs.len();
		let current = state.addrs[index % len];
		let mut cursor = (index + 1) % len;
		while state.addrs[cursor] == current && cursor != index % len {
			cursor = (cursor + 1) % len;
		}
		state.addrs[cursor]
	}

	/// Swaps `addrs[bad_index]` for the next unused address. Returns `None`
	/// once the pool is exhausted; the caller must request re-resolution.
	pub fn replace(&self, bad_index: usize) -> Option<EdgeAddress> {
		let mut state = self.state.lock();
		if state.next_unused >= state.addrs.len() {
			return None;
		}
		let fresh = state.addrs[state.next_unused];
		let len = state.addrs.len();
		state.addrs[bad_index % len] = fresh;
		state.next_unused += 1;
		Some(fresh)
	}

	/// Runs `resolve` to repopulate the pool if no re-resolution has happened
	/// within `resolve_ttl` and none is currently in flight. On failure the
	/// existing pool is left intact.
	pub async fn maybe_reresolve<F, Fut>(&self, resolve: F)
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = anyhow::Result<Vec<EdgeAddress>>>,
	{
		{
			let mut state = self.state.lock();
			if state.resolving {
				return;
			}
			if let Some(last) = state.last_resolve {
				if self.clock.now().saturating_duration_since(last) < self.resolve_ttl {
					return;
				}
			}
			state.resolving = true;
		}
		let result = resolve().await;
		let mut state = self.state.lock();
		state.resolving = false;
		state.last_resolve = Some(self.clock.now());
		if let Ok(addrs) = result {
			state.addrs = addrs;
			state.next_unused = 0;
		}
	}
}

/// Interleaves per-source candidate lists round-robin:
/// `L1[0], L2[0], …, Lk[0], L1[1], L2[1], …`, skipping exhausted lists.
pub fn flatten_srv(mut lists: Vec<Vec<EdgeAddress>>) -> Vec<EdgeAddress> {
	let mut out = Vec::new();
	let mut round = 0;
	loop {
		let mut any = false;
		for list in lists.iter_mut() {
			if round < list.len() {
				out.push(list[round]);
				any = true;
			}
		}
		if !any {
			break;
		}
		round += 1;
	}
	out
}
