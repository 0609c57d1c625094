//! In-memory fakes of the external collaborator traits (`RpcClient`, `Muxer`),
//! shared by unit tests across this crate's modules.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::muxer::{ControlStream, InboundStream, Muxer, MuxerError};
use crate::rpc::{
	AuthOutcome, ConnectionResponse, ReconnectTunnelRequest, RegisterTunnelRequest, RegisterUdpSessionRequest, RpcClient, RpcError, TunnelRegistration,
};

/// Replays a fixed queue of `authenticate` outcomes; other RPCs always
/// succeed trivially unless queued with [`FakeRpcClient::with_registrations`].
#[derive(Default)]
pub struct FakeRpcClient {
	auth_outcomes: Mutex<VecDeque<AuthOutcome>>,
	registrations: Mutex<VecDeque<TunnelRegistration>>,
}

impl FakeRpcClient {
	pub fn with_outcomes(outcomes: Vec<AuthOutcome>) -> Self {
		Self {
			auth_outcomes: Mutex::new(outcomes.into()),
			registrations: Mutex::new(VecDeque::new()),
		}
	}

	pub fn with_registrations(registrations: Vec<TunnelRegistration>) -> Self {
		Self {
			auth_outcomes: Mutex::new(VecDeque::new()),
			registrations: Mutex::new(registrations.into()),
		}
	}
}

#[async_trait]
impl RpcClient for FakeRpcClient {
	async fn register_tunnel(&self, _req: RegisterTunnelRequest) -> Result<TunnelRegistration, RpcError> {
		Ok(self.registrations.lock().pop_front().unwrap_or(TunnelRegistration::Success { event_digest: vec![], conn_digest: vec![] }))
	}

	async fn reconnect_tunnel(&self, _req: ReconnectTunnelRequest) -> Result<TunnelRegistration, RpcError> {
		Ok(self.registrations.lock().pop_front().unwrap_or(TunnelRegistration::Success { event_digest: vec![], conn_digest: vec![] }))
	}

	async fn unregister_tunnel(&self, _conn_index: u32) -> Result<(), RpcError> {
		Ok(())
	}

	async fn authenticate(&self, _num_retries: u32) -> Result<AuthOutcome, RpcError> {
		self
			.auth_outcomes
			.lock()
			.pop_front()
			.ok_or_else(|| RpcError::Transport("no queued outcome".into()))
	}

	async fn get_server_info(&self) -> Result<String, RpcError> {
		Ok("fake-edge/0.0".to_string())
	}

	async fn register_connection(&self, _conn_index: u32) -> Result<ConnectionResponse, RpcError> {
		Ok(ConnectionResponse::Success)
	}

	async fn unregister_connection(&self, _conn_index: u32) -> Result<ConnectionResponse, RpcError> {
		Ok(ConnectionResponse::Success)
	}

	async fn update_local_configuration(&self, _raw: Vec<u8>) -> Result<(), RpcError> {
		Ok(())
	}

	async fn register_udp_session(&self, _req: RegisterUdpSessionRequest) -> Result<ConnectionResponse, RpcError> {
		Ok(ConnectionResponse::Success)
	}

	async fn unregister_udp_session(&self, _session_id: uuid::Uuid) -> Result<(), RpcError> {
		Ok(())
	}

	async fn update_configuration(&self, _raw: Vec<u8>) -> Result<(), RpcError> {
		Ok(())
	}
}

/// An in-memory `Muxer`: streams pushed onto it are handed out one at a time
/// by `accept`, and `close` makes `accept` (and `serve`) return as if the edge
/// hung up cleanly.
#[derive(Default)]
pub struct FakeMuxer {
	pending: Mutex<VecDeque<InboundStream>>,
	closed: std::sync::atomic::AtomicBool,
	notify: Notify,
}

impl FakeMuxer {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn push(&self, stream: InboundStream) {
		self.pending.lock().push_back(stream);
		self.notify.notify_waiters();
	}

	pub fn close(&self) {
		self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
		self.notify.notify_waiters();
	}
}

#[async_trait]
impl Muxer for FakeMuxer {
	async fn accept(&self) -> Option<InboundStream> {
		loop {
			if let Some(stream) = self.pending.lock().pop_front() {
				return Some(stream);
			}
			if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
				return None;
			}
			self.notify.notified().await;
		}
	}

	async fn open_control_stream(&self) -> Result<Box<dyn ControlStream>, MuxerError> {
		Err(MuxerError::Handshake("FakeMuxer has no control stream".into()))
	}

	async fn serve(&self, shutdown: CancellationToken) -> Result<(), MuxerError> {
		tokio::select! {
			_ = shutdown.cancelled() => Ok(()),
			_ = self.wait_closed() => Ok(()),
		}
	}
}

impl FakeMuxer {
	async fn wait_closed(&self) {
		loop {
			if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
				return;
			}
			self.notify.notified().await;
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[tokio::test]
	async fn fake_rpc_client_replays_queued_outcomes_in_order() {
		let rpc = FakeRpcClient::with_outcomes(vec![
			AuthOutcome::Success { jwt: "a".into(), hours_until_refresh: 1 },
			AuthOutcome::Fail { message: "bad".into() },
		]);
		assert_matches!(rpc.authenticate(0).await, Ok(AuthOutcome::Success { .. }));
		assert_matches!(rpc.authenticate(0).await, Ok(AuthOutcome::Fail { .. }));
		assert_matches!(rpc.authenticate(0).await, Err(RpcError::Transport(_)));
	}

	#[tokio::test]
	async fn fake_muxer_accept_waits_then_returns_pushed_streams() {
		use http::{HeaderMap, Method, Uri};

		let muxer = FakeMuxer::new();
		let pushed = {
			let muxer = muxer.clone();
			tokio::spawn(async move {
				tokio::task::yield_now().await;
				muxer.push(InboundStream {
					method: Method::GET,
					uri: Uri::from_static("http://x/"),
					headers: HeaderMap::new(),
					body: Box::new(std::io::Cursor::new(Vec::new())),
					response: Box::new(tokio::io::sink()),
				});
			})
		};
		let stream = muxer.accept().await;
		assert!(stream.is_some());
		pushed.await.unwrap();

		muxer.close();
		assert!(muxer.accept().await.is_none());
	}
}
