//! Thread-safe store for the reconnection JWT and per-connection digests,
//! plus the auth-refresh loop that keeps the JWT current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::metrics::Metrics;
use crate::rpc::{AuthOutcome, RpcClient, RpcError};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
	#[error("{0} is not set")]
	Unset(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("authentication transport failure and backoff exhausted: {0}")]
	Transport(String),
	#[error("authentication permanently rejected: {0}")]
	Fail(String),
}

/// Safe for concurrent use: the JWT is swapped atomically, and the digest
/// maps are behind their own locks since writers (register/reconnect) and
/// readers (reconnect) don't contend often.
#[derive(Default)]
pub struct CredentialManager {
	jwt: ArcSwapOption<String>,
	event_digest: Mutex<HashMap<u32, Vec<u8>>>,
	conn_digest: Mutex<HashMap<u32, Vec<u8>>>,
}

impl CredentialManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn jwt(&self) -> Result<Arc<String>, CredentialError> {
		self.jwt.load_full().ok_or(CredentialError::Unset("jwt"))
	}

	fn set_jwt(&self, jwt: String) {
		self.jwt.store(Some(Arc::new(jwt)));
	}

	pub fn set_digests(&self, conn_index: u32, event_digest: Vec<u8>, conn_digest: Vec<u8>) {
		self.event_digest.lock().insert(conn_index, event_digest);
		self.conn_digest.lock().insert(conn_index, conn_digest);
	}

	/// A reconnect needs both digests for the index; a missing piece degrades
	/// to a fresh registration per the design's preserved source behavior.
	pub fn digests_for_reconnect(&self, conn_index: u32) -> Option<(Vec<u8>, Vec<u8>)> {
		let event = self.event_digest.lock().get(&conn_index).cloned()?;
		let conn = self.conn_digest.lock().get(&conn_index).cloned()?;
		Some((event, conn))
	}

	/// Runs one refresh cycle: authenticate, then report how long until the
	/// next call. Callers loop this, sleeping the returned duration between
	/// calls (see [`crate::supervisor::Supervisor`]).
	pub async fn refresh_auth(
		&self,
		cancel: &CancellationToken,
		backoff: &Backoff,
		rpc: &dyn RpcClient,
		metrics: &Metrics,
	) -> Result<Duration, AuthError> {
		let retries = backoff.retries();
		match rpc.authenticate(retries).await {
			Err(err @ (RpcError::Transport(_) | RpcError::Timeout(_))) => {
				let (duration, ok) = backoff.peek(cancel);
				if ok {
					warn!(retries, "auth transport failure, retrying later");
					Ok(duration)
				} else {
					Err(AuthError::Transport(err.to_string()))
				}
			},
			Ok(AuthOutcome::Success { jwt, hours_until_refresh }) => {
				self.set_jwt(jwt);
				backoff.mark_connected_grace();
				metrics.auth_successes.inc();
				debug!(hours_until_refresh, "authentication succeeded");
				Ok(Duration::from_secs(hours_until_refresh * 3600))
			},
			Ok(AuthOutcome::Unknown { message, hours_until_refresh }) => {
				warn!(message, "authentication outcome unknown, retrying at hinted interval");
				Ok(Duration::from_secs(hours_until_refresh * 3600))
			},
			Ok(AuthOutcome::Fail { message }) => {
				metrics.auth_failures.inc();
				Err(AuthError::Fail(message))
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use assert_matches::assert_matches;
	use prometheus_client::registry::Registry;
	use tunnel_core::clock::FakeClock;

	use super::*;
	use crate::backoff::BackoffConfig;
	use crate::testutil::FakeRpcClient;

	fn metrics() -> Metrics {
		Metrics::new(&mut Registry::default())
	}

	#[tokio::test]
	async fn success_stores_jwt_and_schedules_next_refresh() {
		let creds = CredentialManager::new();
		let clock = Arc::new(FakeClock::new());
		let backoff = Backoff::new(BackoffConfig::default(), clock);
		let cancel = CancellationToken::new();
		let metrics = metrics();

		let rpc = FakeRpcClient::with_outcomes(vec![AuthOutcome::Success { jwt: "jwt".into(), hours_until_refresh: 19 }]);
		let next = creds.refresh_auth(&cancel, &backoff, &rpc, &metrics).await.unwrap();
		assert_eq!(next, Duration::from_secs(19 * 3600));
		assert_eq!(*creds.jwt().unwrap(), "jwt");

		let rpc = FakeRpcClient::with_outcomes(vec![AuthOutcome::Unknown { message: "retry".into(), hours_until_refresh: 19 }]);
		let next = creds.refresh_auth(&cancel, &backoff, &rpc, &metrics).await.unwrap();
		assert_eq!(next, Duration::from_secs(19 * 3600));
		assert_eq!(*creds.jwt().unwrap(), "jwt", "unknown outcome must not clobber the existing jwt");
	}

	#[tokio::test]
	async fn permanent_failure_surfaces_as_error() {
		let creds = CredentialManager::new();
		let clock = Arc::new(FakeClock::new());
		let backoff = Backoff::new(BackoffConfig::default(), clock);
		let cancel = CancellationToken::new();
		let metrics = metrics();
		let rpc = FakeRpcClient::with_outcomes(vec![AuthOutcome::Fail { message: "bad credentials".into() }]);
		let result = creds.refresh_auth(&cancel, &backoff, &rpc, &metrics).await;
		assert_matches!(result, Err(AuthError::Fail(_)));
	}

	#[test]
	fn reconnect_digest_requires_both_pieces() {
		let creds = CredentialManager::new();
		assert!(creds.digests_for_reconnect(0).is_none());
		creds.set_digests(0, vec![1], vec![2]);
		assert_eq!(creds.digests_for_reconnect(0), Some((vec![1], vec![2])));
	}
}
