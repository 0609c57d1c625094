//! Top-level control loop: brings up the configured number of HA tunnels,
//! retries failed ones with shared backoff, and drives the auth-refresh loop.
//!
//! Tunnel tasks never hold a pointer back into the supervisor; they report
//! their outcome over a channel instead, so there is no cycle between
//! `Supervisor` and the tasks it spawns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel_core::clock::Clock;

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::TunnelConfig;
use crate::credentials::CredentialManager;
use crate::edge_pool::{EdgeAddress, EdgePool};
use crate::metrics::Metrics;
use crate::muxer::MuxerDialer;
use crate::protocol::ProtocolSelector;
use crate::proxy::ProxyEngine;
use crate::rpc::RpcClient;
use crate::tunnel::{TunnelError, TunnelHandler};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
	#[error("edge pool has no addresses")]
	EmptyEdgePool,
	#[error("tunnel {index} failed permanently: {source}")]
	TunnelFailed { index: u32, source: TunnelError },
}

enum ReportOutcome {
	/// The connection stopped because `shutdown` was cancelled; not an error.
	ShuttingDown,
	/// Backoff gave up retrying a recoverable failure.
	Exhausted,
	/// A non-recoverable error; the whole supervisor should give up.
	Fatal(TunnelError),
}

struct TunnelReport {
	index: u32,
	#[allow(dead_code)]
	addr: EdgeAddress,
	outcome: ReportOutcome,
}

/// Desired parallelism, clamped to what the edge pool can actually offer.
fn clamp_ha_connections(configured: u32, available: usize) -> u32 {
	configured.min(available as u32).max(if available == 0 { 0 } else { 1 })
}

pub struct Supervisor {
	config: Arc<TunnelConfig>,
	edge_pool: Arc<EdgePool>,
	credentials: Arc<CredentialManager>,
	rpc: Arc<dyn RpcClient>,
	muxer_dialer: Arc<dyn MuxerDialer>,
	proxy_engine: Arc<ProxyEngine>,
	metrics: Arc<Metrics>,
	backoff: Backoff,
	auth_backoff: Backoff,
	active: AtomicU32,
}

impl Supervisor {
	/// Number of tunnel tasks currently spawned (connecting, connected, or
	/// backing off between attempts).
	pub fn active_connections(&self) -> u32 {
		self.active.load(Ordering::SeqCst)
	}

	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Arc<TunnelConfig>,
		edge_pool: Arc<EdgePool>,
		credentials: Arc<CredentialManager>,
		rpc: Arc<dyn RpcClient>,
		muxer_dialer: Arc<dyn MuxerDialer>,
		proxy_engine: Arc<ProxyEngine>,
		metrics: Arc<Metrics>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let backoff = Backoff::new(
			BackoffConfig { base: Duration::from_secs(1), max_retries: if config.retries == 0 { None } else { Some(config.retries) } },
			clock.clone(),
		);
		let auth_backoff = Backoff::new(BackoffConfig { base: Duration::from_secs(1), max_retries: None }, clock);
		Self {
			config,
			edge_pool,
			credentials,
			rpc,
			muxer_dialer,
			proxy_engine,
			metrics,
			backoff,
			auth_backoff,
			active: AtomicU32::new(0),
		}
	}

	/// Runs until `shutdown` is cancelled, draining in-flight tunnels (up to
	/// `grace_period`) before returning. Returns an error only when a tunnel
	/// fails in a way the backoff controller has given up retrying.
	pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), SupervisorError> {
		if self.edge_pool.is_empty() {
			return Err(SupervisorError::EmptyEdgePool);
		}
		let ha_connections = clamp_ha_connections(self.config.ha_connections, self.edge_pool.len());
		info!(ha_connections, "starting supervisor");

		let (report_tx, mut report_rx) = mpsc::unbounded_channel();
		let mut tasks = JoinSet::new();

		let first_fuse = self.spawn_tunnel(0, &mut tasks, shutdown.clone(), report_tx.clone());
		tokio::select! {
			_ = first_fuse.wait() => {},
			_ = shutdown.cancelled() => return self.drain(tasks, shutdown).await,
		}

		for index in 1..ha_connections {
			tokio::select! {
				_ = tokio::time::sleep(self.config.registration_interval) => {},
				_ = shutdown.cancelled() => return self.drain(tasks, shutdown).await,
			}
			self.spawn_tunnel(index, &mut tasks, shutdown.clone(), report_tx.clone());
		}

		let mut auth_timer: std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::credentials::AuthError>> + Send>> =
			Box::pin(self.clone().auth_refresh_once());

		loop {
			tokio::select! {
				_ = shutdown.cancelled() => {
					return self.drain(tasks, shutdown).await;
				},
				report = report_rx.recv() => {
					let Some(report) = report else { continue };
					self.active.fetch_sub(1, Ordering::SeqCst);
					match report.outcome {
						ReportOutcome::ShuttingDown => {},
						ReportOutcome::Exhausted => {
							warn!(index = report.index, "tunnel retries exhausted, giving up on this connection");
						},
						ReportOutcome::Fatal(error) => {
							warn!(index = report.index, %error, "tunnel failed permanently");
							return Err(SupervisorError::TunnelFailed { index: report.index, source: error });
						},
					}
				},
				next = &mut auth_timer => {
					match next {
						Ok(()) => auth_timer = Box::pin(self.clone().auth_refresh_once()),
						Err(e) => {
							warn!(error = %e, "auth refresh failed, leaving timer disarmed until next tunnel activity");
							auth_timer = Box::pin(std::future::pending());
						},
					}
				},
			}
		}
	}

	fn spawn_tunnel(self: &Arc<Self>, index: u32, tasks: &mut JoinSet<()>, shutdown: CancellationToken, report_tx: mpsc::UnboundedSender<TunnelReport>) -> Arc<crate::tunnel::ConnectedFuse> {
		let supervisor = self.clone();
		let fuse = Arc::new(crate::tunnel::ConnectedFuse::new());
		let task_fuse = fuse.clone();
		self.active.fetch_add(1, Ordering::SeqCst);
		tasks.spawn(async move {
			supervisor.run_connection(index, shutdown, report_tx, task_fuse).await;
		});
		fuse
	}

	async fn run_connection(self: Arc<Self>, index: u32, shutdown: CancellationToken, report_tx: mpsc::UnboundedSender<TunnelReport>, fuse: Arc<crate::tunnel::ConnectedFuse>) {
		let protocol_selector = ProtocolSelector::new(&self.config.protocol_selector, None);
		let mut consecutive_failures = 0u32;

		loop {
			let mut addr = self.edge_pool.addr_for(index as usize);

			if shutdown.is_cancelled() {
				let _ = report_tx.send(TunnelReport { index, addr, outcome: ReportOutcome::ShuttingDown });
				return;
			}

			let dial_hostname = addr.0.ip().to_string();
			let protocol = protocol_selector.current();
			let connect = TunnelHandler::connect(
				index,
				addr,
				&dial_hostname,
				protocol.clone(),
				&self.config,
				self.muxer_dialer.as_ref(),
				self.rpc.clone(),
				&self.credentials,
				self.proxy_engine.clone(),
				self.metrics.clone(),
			)
			.await;

			let mut fallback_exhausted = false;
			let outcome: Result<(), TunnelError> = match connect {
				Ok(handler) => {
					consecutive_failures = 0;
					fuse.fire();
					self.backoff.mark_connected_grace();
					self.metrics.ha_connections.inc();
					let result = handler.serve(shutdown.child_token()).await;
					self.metrics.ha_connections.dec();
					result
				},
				Err(e) => {
					if e.recoverable() {
						if let Some(replacement) = self.edge_pool.replace(index as usize) {
							addr = replacement;
						}
					}
					consecutive_failures += 1;
					if consecutive_failures >= self.config.protocol_fallback_threshold {
						match protocol_selector.fallback() {
							Some(next) => {
								warn!(index, from = ?protocol, to = ?next, "switching connection to fallback protocol after repeated failures");
								consecutive_failures = 0;
							},
							None => {
								// Already on fallback (or none configured) and it
								// too has exhausted its failure budget: surface.
								fallback_exhausted = true;
							},
						}
					}
					Err(e)
				},
			};

			if shutdown.is_cancelled() {
				let _ = report_tx.send(TunnelReport { index, addr, outcome: ReportOutcome::ShuttingDown });
				return;
			}

			match outcome {
				Ok(()) => {},
				Err(e) if !e.recoverable() || fallback_exhausted => {
					let _ = report_tx.send(TunnelReport { index, addr, outcome: ReportOutcome::Fatal(e) });
					return;
				},
				Err(_) => {},
			}

			if !self.backoff.wait(&shutdown).await {
				let _ = report_tx.send(TunnelReport { index, addr, outcome: ReportOutcome::Exhausted });
				return;
			}
		}
	}

	async fn auth_refresh_once(self: Arc<Self>) -> Result<(), crate::credentials::AuthError> {
		let next = self.credentials.refresh_auth(&CancellationToken::new(), &self.auth_backoff, self.rpc.as_ref(), &self.metrics).await?;
		tokio::time::sleep(next).await;
		Ok(())
	}

	async fn drain(&self, mut tasks: JoinSet<()>, shutdown: CancellationToken) -> Result<(), SupervisorError> {
		let _ = shutdown; // already cancelled by the caller; child tokens propagate.
		let grace = tokio::time::sleep(self.config.grace_period);
		tokio::pin!(grace);
		loop {
			tokio::select! {
				joined = tasks.join_next() => {
					if joined.is_none() {
						return Ok(());
					}
				},
				_ = &mut grace => {
					tasks.abort_all();
					return Ok(());
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ha_connections_clamp_to_available_addresses_with_at_least_one() {
		assert_eq!(clamp_ha_connections(4, 2), 2);
		assert_eq!(clamp_ha_connections(4, 10), 4);
		assert_eq!(clamp_ha_connections(4, 0), 0);
	}
}
