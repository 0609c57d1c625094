//! Chooses the primary wire protocol for a connection and computes a
//! one-shot fallback once the supervisor has exhausted retries against it.

use parking_lot::Mutex;

use crate::config::{Protocol, ProtocolSelectorConfig};

/// Consulted at construction time to decide the initial protocol from a
/// rollout percentage, when the config doesn't pin a fixed preference.
pub trait PercentageFetcher: Send + Sync {
	/// A value in `0..100`.
	fn percentage(&self) -> u8;
}

/// A fetcher that always returns the same value; useful for tests and for
/// binaries that read the percentage once from a static config file.
pub struct FixedPercentage(pub u8);

impl PercentageFetcher for FixedPercentage {
	fn percentage(&self) -> u8 {
		self.0
	}
}

struct State {
	current: Protocol,
	fallback: Option<Protocol>,
	fallback_consumed: bool,
}

/// Current + fallback protocol for one connection. `fallback()` is a
/// one-shot latch: it both returns and switches `current` to the configured
/// fallback exactly once, then returns `None` until [`ProtocolSelector::reset`].
pub struct ProtocolSelector {
	state: Mutex<State>,
}

impl ProtocolSelector {
	pub fn new(config: &ProtocolSelectorConfig, percentage_fetcher: Option<&dyn PercentageFetcher>) -> Self {
		let current = match (config.percentage, percentage_fetcher) {
			(Some(threshold), Some(fetcher)) if fetcher.percentage() < threshold => {
				config.fallback.clone().unwrap_or_else(|| config.primary.clone())
			},
			_ => config.primary.clone(),
		};
		Self {
			state: Mutex::new(State {
				current,
				fallback: config.fallback.clone(),
				fallback_consumed: false,
			}),
		}
	}

	pub fn current(&self) -> Protocol {
		self.state.lock().current.clone()
	}

	/// Returns the configured fallback exactly once, switching `current` to
	/// it in the process. Subsequent calls return `None` until [`Self::reset`].
	pub fn fallback(&self) -> Option<Protocol> {
		let mut state = self.state.lock();
		if state.fallback_consumed {
			return None;
		}
		state.fallback_consumed = true;
		let fallback = state.fallback.clone()?;
		state.current = fallback.clone();
		Some(fallback)
	}

	/// Re-arms the fallback latch, e.g. after a fresh connection attempt with
	/// its own failure budget.
	pub fn reset(&self) {
		self.state.lock().fallback_consumed = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config() -> ProtocolSelectorConfig {
		ProtocolSelectorConfig {
			primary: Protocol::H2mux,
			fallback: Some(Protocol::Http2),
			percentage: None,
		}
	}

	#[test]
	fn fallback_is_one_shot_until_reset() {
		let selector = ProtocolSelector::new(&config(), None);
		assert_eq!(selector.current(), Protocol::H2mux);
		assert_eq!(selector.fallback(), Some(Protocol::Http2));
		assert_eq!(selector.current(), Protocol::Http2);
		assert_eq!(selector.fallback(), None, "fallback already consumed");
		selector.reset();
		assert_eq!(selector.fallback(), Some(Protocol::Http2));
	}

	#[test]
	fn percentage_below_threshold_starts_on_fallback() {
		let mut config = config();
		config.percentage = Some(50);
		let selector = ProtocolSelector::new(&config, Some(&FixedPercentage(10)));
		assert_eq!(selector.current(), Protocol::Http2);
	}

	#[test]
	fn percentage_at_or_above_threshold_starts_on_primary() {
		let mut config = config();
		config.percentage = Some(50);
		let selector = ProtocolSelector::new(&config, Some(&FixedPercentage(90)));
		assert_eq!(selector.current(), Protocol::H2mux);
	}

	#[test]
	fn no_fallback_configured_yields_none() {
		let config = ProtocolSelectorConfig { primary: Protocol::Quic, fallback: None, percentage: None };
		let selector = ProtocolSelector::new(&config, None);
		assert_eq!(selector.fallback(), None);
	}
}
