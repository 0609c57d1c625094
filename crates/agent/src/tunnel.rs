//! One established edge connection: dials the edge, performs the muxer
//! handshake and initial registration, then serves inbound streams until the
//! muxer closes or a fatal error occurs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http::{HeaderValue, Request, StatusCode};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::TunnelConfig;
use crate::credentials::CredentialManager;
use crate::edge_pool::EdgeAddress;
use crate::metrics::{ConnIndexLabel, Metrics};
use crate::muxer::{InboundStream, Muxer, MuxerDialer, MuxerError};
use crate::origin::body_from_reader;
use crate::proxy::{self, ProxyEngine};
use crate::rpc::{RegisterTunnelRequest, ReconnectTunnelRequest, RpcClient, RpcError, TunnelRegistration};
use crate::transport::{self, DialError};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
	#[error("dial failed: {0}")]
	Dial(#[from] DialError),
	#[error("muxer handshake failed: {0}")]
	Muxer(#[from] MuxerError),
	#[error("registration rpc failed: {0}")]
	Rpc(#[from] RpcError),
	#[error("registration rejected: {0:?}")]
	Registration(TunnelRegistration),
	#[error("missed {0} consecutive heartbeats")]
	HeartbeatsMissed(u32),
}

impl TunnelError {
	/// Whether the supervisor should retry this connection (possibly against a
	/// different edge address) rather than treat it as a permanent failure.
	pub fn recoverable(&self) -> bool {
		match self {
			TunnelError::Registration(r) => r.recoverable(),
			TunnelError::Dial(_) | TunnelError::Muxer(_) | TunnelError::Rpc(_) | TunnelError::HeartbeatsMissed(_) => true,
		}
	}
}

/// One-shot latch fired the moment a connection completes registration.
/// The supervisor's initialization sequencing awaits tunnel 0's fuse before
/// starting the rest of the HA pool.
#[derive(Default)]
pub struct ConnectedFuse {
	fired: AtomicBool,
	notify: Notify,
}

impl ConnectedFuse {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn fire(&self) {
		self.fired.store(true, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub async fn wait(&self) {
		if self.fired.load(Ordering::SeqCst) {
			return;
		}
		self.notify.notified().await;
	}
}

/// An established, registered edge connection. Holds no reference back to the
/// supervisor; failures are returned from [`TunnelHandler::serve`] for the
/// caller to act on, per the message-passing design.
pub struct TunnelHandler {
	conn_index: u32,
	muxer: Arc<dyn Muxer>,
	rpc: Arc<dyn RpcClient>,
	proxy_engine: Arc<ProxyEngine>,
	metrics: Arc<Metrics>,
	heartbeat_interval: Duration,
	max_heartbeats: u32,
}

impl TunnelHandler {
	/// Dials `addr`, performs the muxer handshake, then registers (or
	/// reconnects) over the resulting control stream's RPC client.
	#[allow(clippy::too_many_arguments)]
	pub async fn connect(
		conn_index: u32,
		addr: EdgeAddress,
		dial_hostname: &str,
		protocol: crate::config::Protocol,
		config: &TunnelConfig,
		muxer_dialer: &dyn MuxerDialer,
		rpc: Arc<dyn RpcClient>,
		credentials: &CredentialManager,
		proxy_engine: Arc<ProxyEngine>,
		metrics: Arc<Metrics>,
	) -> Result<Self, TunnelError> {
		let tls_config = transport::edge_tls_config(&config.edge_tls);
		let server_name = transport::server_name_for(&config.edge_tls, dial_hostname);
		let stream = transport::dial_tls(addr.0, server_name, tls_config, config.dial_timeout).await?;

		let muxer = tokio::time::timeout(config.muxer_timeout, muxer_dialer.handshake(Box::new(stream), conn_index, protocol))
			.await
			.map_err(|_| MuxerError::Handshake("timed out".into()))??;

		let registration = if let Some((event_digest, conn_digest)) = credentials.digests_for_reconnect(conn_index) {
			rpc.reconnect_tunnel(ReconnectTunnelRequest { conn_index, event_digest, conn_digest }).await?
		} else {
			rpc.register_tunnel(RegisterTunnelRequest { conn_index, tags: config.tags.iter().map(|t| (t.name.clone(), t.value.clone())).collect() })
				.await?
		};

		match registration {
			TunnelRegistration::Success { event_digest, conn_digest } => {
				credentials.set_digests(conn_index, event_digest, conn_digest);
			},
			TunnelRegistration::DupConn => {
				debug!(conn_index, "edge reported a duplicate connection, will retry");
				return Err(TunnelError::Registration(TunnelRegistration::DupConn));
			},
			other => return Err(TunnelError::Registration(other)),
		}

		Ok(Self {
			conn_index,
			muxer,
			rpc,
			proxy_engine,
			metrics,
			heartbeat_interval: config.heartbeat_interval,
			max_heartbeats: config.max_heartbeats,
		})
	}

	pub fn conn_index(&self) -> u32 {
		self.conn_index
	}

	/// Serves the connection until `shutdown` fires, the muxer closes cleanly,
	/// or heartbeats are missed past the configured limit.
	pub async fn serve(&self, shutdown: CancellationToken) -> Result<(), TunnelError> {
		let accept_loop = self.accept_loop(&shutdown);
		let muxer_serve = self.muxer.serve(shutdown.clone());
		let heartbeat_loop = self.heartbeat_loop(&shutdown);

		tokio::select! {
			r = accept_loop => r,
			r = muxer_serve => r.map_err(TunnelError::from),
			r = heartbeat_loop => r,
		}
	}

	async fn accept_loop(&self, shutdown: &CancellationToken) -> Result<(), TunnelError> {
		loop {
			let stream = tokio::select! {
				stream = self.muxer.accept() => stream,
				_ = shutdown.cancelled() => return Ok(()),
			};
			let Some(stream) = stream else {
				return Ok(());
			};
			let proxy_engine = self.proxy_engine.clone();
			let metrics = self.metrics.clone();
			let conn_index = self.conn_index;
			let stream_cancel = shutdown.child_token();
			tokio::spawn(async move {
				serve_stream(stream, proxy_engine, metrics, conn_index, stream_cancel).await;
			});
		}
	}

	async fn heartbeat_loop(&self, shutdown: &CancellationToken) -> Result<(), TunnelError> {
		let mut missed = 0u32;
		loop {
			tokio::select! {
				_ = tokio::time::sleep(self.heartbeat_interval) => {},
				_ = shutdown.cancelled() => return Ok(()),
			}
			match self.rpc.get_server_info().await {
				Ok(_) => missed = 0,
				Err(e) => {
					missed += 1;
					warn!(conn_index = self.conn_index, missed, max = self.max_heartbeats, error = %e, "heartbeat failed");
					if missed >= self.max_heartbeats {
						return Err(TunnelError::HeartbeatsMissed(missed));
					}
				},
			}
		}
	}
}

/// Handles one inbound stream end to end: classifies it, proxies it, and
/// writes a synthesized 502 if the origin round-trip failed outright.
async fn serve_stream(mut stream: InboundStream, proxy_engine: Arc<ProxyEngine>, metrics: Arc<Metrics>, conn_index: u32, cancel: CancellationToken) {
	let source = proxy::classify_source(&stream.headers);

	let mut builder = Request::builder().method(stream.method.clone()).uri(stream.uri.clone());
	for (name, value) in stream.headers.iter() {
		builder = builder.header(name, value);
	}
	let body = body_from_reader(stream.body);
	let req = match builder.body(body) {
		Ok(req) => req,
		Err(e) => {
			error!(conn_index, error = %e, "could not reconstruct inbound request");
			return;
		},
	};

	match proxy_engine.proxy(&mut stream.response, req, source, &cancel).await {
		Ok(()) => {
			metrics.tunnel_200s.get_or_create(&ConnIndexLabel { conn_index }).inc();
		},
		Err(e) => {
			warn!(conn_index, error = %e, "proxying inbound stream failed");
			metrics.tunnel_502s.get_or_create(&ConnIndexLabel { conn_index }).inc();
			let mut headers = http::HeaderMap::new();
			proxy::insert_response_meta(&mut headers, "cloudflared");
			if let Ok(value) = HeaderValue::from_str(&e.to_string()) {
				headers.insert("cf-cloudflared-error", value);
			}
			let _ = proxy::write_response_head(&mut stream.response, StatusCode::BAD_GATEWAY, &headers).await;
		},
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use prometheus_client::registry::Registry;

	use super::*;
	use crate::buffer_pool::BufferPool;
	use crate::flow_limiter::FlowLimiter;
	use crate::ingress::{Ingress, IngressRule};
	use crate::origin::{OriginService, StatusOrigin};
	use crate::proxy::ProxyEngineConfig;

	fn engine() -> Arc<ProxyEngine> {
		let mut registry = Registry::default();
		let metrics = Arc::new(Metrics::new(&mut registry));
		let ingress = Arc::new(Ingress::new(vec![IngressRule::catch_all(OriginService::Status(StatusOrigin::new(204)))]).unwrap());
		Arc::new(ProxyEngine::new(
			ingress,
			ProxyEngineConfig { tags: vec![], warp_routing_enabled: false },
			BufferPool::default(),
			FlowLimiter::new(0, metrics.clone()),
			metrics,
		))
	}

	#[test]
	fn dup_conn_is_recoverable_but_other_registrations_follow_their_own_rule() {
		assert!(TunnelError::Registration(TunnelRegistration::DupConn).recoverable());
		assert!(!TunnelError::Registration(TunnelRegistration::ServerError { permanent: true, message: "no".into() }).recoverable());
	}

	#[tokio::test]
	async fn connected_fuse_fires_once_and_wait_returns_immediately_after() {
		let fuse = ConnectedFuse::new();
		fuse.fire();
		tokio::time::timeout(Duration::from_millis(50), fuse.wait()).await.expect("wait must not block once fired");
	}

	#[tokio::test]
	async fn serve_stream_writes_status_line_for_matched_rule() {
		use std::io::Cursor;

		use http::{HeaderMap, Method, Uri};

		struct Sink(Vec<u8>);
		impl tokio::io::AsyncWrite for Sink {
			fn poll_write(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
				self.get_mut().0.extend_from_slice(buf);
				std::task::Poll::Ready(Ok(buf.len()))
			}
			fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
				std::task::Poll::Ready(Ok(()))
			}
			fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
				std::task::Poll::Ready(Ok(()))
			}
		}

		let stream = InboundStream {
			method: Method::GET,
			uri: Uri::from_static("http://example.com/"),
			headers: HeaderMap::new(),
			body: Box::new(Cursor::new(Vec::new())),
			response: Box::new(Sink(Vec::new())),
		};
		let metrics = Arc::new(Metrics::default());
		serve_stream(stream, engine(), metrics.clone(), 0, CancellationToken::new()).await;
		assert_eq!(metrics.tunnel_200s.get_or_create(&ConnIndexLabel { conn_index: 0 }).get(), 1);
	}
}
