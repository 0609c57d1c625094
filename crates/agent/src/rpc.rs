//! Typed seam over the control-stream RPC. Wire framing (Cap'n Proto) is an
//! external concern; this module only defines the request/response shapes
//! and the trait a real client implements.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct RegisterTunnelRequest {
	pub conn_index: u32,
	pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ReconnectTunnelRequest {
	pub conn_index: u32,
	pub event_digest: Vec<u8>,
	pub conn_digest: Vec<u8>,
}

/// Outcome of registering or reconnecting a tunnel.
#[derive(Debug, Clone)]
pub enum TunnelRegistration {
	Success { event_digest: Vec<u8>, conn_digest: Vec<u8> },
	DupConn,
	ServerError { permanent: bool, message: String },
	ClientError { message: String },
}

impl TunnelRegistration {
	pub fn recoverable(&self) -> bool {
		match self {
			TunnelRegistration::Success { .. } => true,
			TunnelRegistration::DupConn => true,
			TunnelRegistration::ServerError { permanent, .. } => !permanent,
			TunnelRegistration::ClientError { .. } => true,
		}
	}
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
	Success { jwt: String, hours_until_refresh: u64 },
	Unknown { message: String, hours_until_refresh: u64 },
	Fail { message: String },
}

const AUTH_OUTCOME_TAG_SUCCESS: u8 = 0;
const AUTH_OUTCOME_TAG_UNKNOWN: u8 = 1;
const AUTH_OUTCOME_TAG_FAIL: u8 = 2;

impl AuthOutcome {
	pub fn refresh_after(&self) -> Option<Duration> {
		match self {
			AuthOutcome::Success { hours_until_refresh, .. } | AuthOutcome::Unknown { hours_until_refresh, .. } => {
				Some(Duration::from_secs(hours_until_refresh * 3600))
			},
			AuthOutcome::Fail { .. } => None,
		}
	}

	/// Serializes this outcome to a tagged, length-prefixed byte encoding, so
	/// it can ride over the same opaque control-stream bytes as the rest of
	/// the RPC surface without pulling in a general-purpose wire format.
	pub fn to_wire(&self) -> Vec<u8> {
		let mut out = Vec::new();
		match self {
			AuthOutcome::Success { jwt, hours_until_refresh } => {
				out.push(AUTH_OUTCOME_TAG_SUCCESS);
				out.extend_from_slice(&hours_until_refresh.to_le_bytes());
				write_wire_string(&mut out, jwt);
			},
			AuthOutcome::Unknown { message, hours_until_refresh } => {
				out.push(AUTH_OUTCOME_TAG_UNKNOWN);
				out.extend_from_slice(&hours_until_refresh.to_le_bytes());
				write_wire_string(&mut out, message);
			},
			AuthOutcome::Fail { message } => {
				out.push(AUTH_OUTCOME_TAG_FAIL);
				write_wire_string(&mut out, message);
			},
		}
		out
	}

	/// Inverse of [`Self::to_wire`]. `None` on truncated or malformed input.
	pub fn from_wire(bytes: &[u8]) -> Option<Self> {
		let (&tag, rest) = bytes.split_first()?;
		match tag {
			AUTH_OUTCOME_TAG_SUCCESS => {
				let (hours_until_refresh, rest) = read_wire_u64(rest)?;
				let (jwt, rest) = read_wire_string(rest)?;
				rest.is_empty().then_some(AuthOutcome::Success { jwt, hours_until_refresh })
			},
			AUTH_OUTCOME_TAG_UNKNOWN => {
				let (hours_until_refresh, rest) = read_wire_u64(rest)?;
				let (message, rest) = read_wire_string(rest)?;
				rest.is_empty().then_some(AuthOutcome::Unknown { message, hours_until_refresh })
			},
			AUTH_OUTCOME_TAG_FAIL => {
				let (message, rest) = read_wire_string(rest)?;
				rest.is_empty().then_some(AuthOutcome::Fail { message })
			},
			_ => None,
		}
	}
}

fn write_wire_string(out: &mut Vec<u8>, s: &str) {
	out.extend_from_slice(&(s.len() as u32).to_le_bytes());
	out.extend_from_slice(s.as_bytes());
}

fn read_wire_u64(bytes: &[u8]) -> Option<(u64, &[u8])> {
	let (head, rest) = bytes.split_at_checked(8)?;
	Some((u64::from_le_bytes(head.try_into().ok()?), rest))
}

fn read_wire_string(bytes: &[u8]) -> Option<(String, &[u8])> {
	let (len, rest) = bytes.split_at_checked(4)?;
	let len = u32::from_le_bytes(len.try_into().ok()?) as usize;
	let (body, rest) = rest.split_at_checked(len)?;
	Some((String::from_utf8(body.to_vec()).ok()?, rest))
}

/// Outcome of a RegisterConnection/UnregisterConnection RPC.
#[derive(Debug, Clone)]
pub enum ConnectionResponse {
	Success,
	Error { message: String },
}

/// Parameters for registering a UDP session (warp-routing's datagram mode).
#[derive(Debug, Clone)]
pub struct RegisterUdpSessionRequest {
	pub session_id: uuid::Uuid,
	pub dest: String,
	pub idle_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
	#[error("transport failure talking to the edge: {0}")]
	Transport(String),
	#[error("rpc timed out after {0:?}")]
	Timeout(Duration),
}

/// The control-stream RPC surface. The core depends only on this trait;
/// a binary wires in a real Cap'n-Proto-backed implementation.
#[async_trait]
pub trait RpcClient: Send + Sync {
	async fn register_tunnel(&self, req: RegisterTunnelRequest) -> Result<TunnelRegistration, RpcError>;
	async fn reconnect_tunnel(&self, req: ReconnectTunnelRequest) -> Result<TunnelRegistration, RpcError>;
	async fn unregister_tunnel(&self, conn_index: u32) -> Result<(), RpcError>;
	async fn authenticate(&self, num_retries: u32) -> Result<AuthOutcome, RpcError>;
	async fn get_server_info(&self) -> Result<String, RpcError>;
	async fn register_connection(&self, conn_index: u32) -> Result<ConnectionResponse, RpcError>;
	async fn unregister_connection(&self, conn_index: u32) -> Result<ConnectionResponse, RpcError>;
	async fn update_local_configuration(&self, raw: Vec<u8>) -> Result<(), RpcError>;
	async fn register_udp_session(&self, req: RegisterUdpSessionRequest) -> Result<ConnectionResponse, RpcError>;
	async fn unregister_udp_session(&self, session_id: uuid::Uuid) -> Result<(), RpcError>;
	/// Pushed-config acknowledgement; the core only acks receipt, it does not
	/// parse or apply `raw` (dynamic config distribution is out of scope).
	async fn update_configuration(&self, raw: Vec<u8>) -> Result<(), RpcError>;
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn registration_recoverability_matches_design() {
		assert!(TunnelRegistration::DupConn.recoverable());
		assert!(!TunnelRegistration::ServerError { permanent: true, message: "no".into() }.recoverable());
		assert!(TunnelRegistration::ServerError { permanent: false, message: "retry".into() }.recoverable());
		assert!(TunnelRegistration::ClientError { message: "bad req".into() }.recoverable());
	}

	#[test]
	fn refresh_after_is_none_for_fail() {
		assert_matches!(AuthOutcome::Fail { message: _ }.refresh_after(), None);
		let success = AuthOutcome::Success { jwt: "jwt".into(), hours_until_refresh: 19 };
		assert_eq!(success.refresh_after(), Some(Duration::from_secs(19 * 3600)));
	}

	#[test]
	fn auth_outcome_round_trips_through_wire_encoding_for_every_variant() {
		let outcomes = vec![
			AuthOutcome::Success { jwt: "jwt-value".into(), hours_until_refresh: 19 },
			AuthOutcome::Unknown { message: "server couldn't decide".into(), hours_until_refresh: 1 },
			AuthOutcome::Fail { message: "bad credentials".into() },
		];
		for outcome in outcomes {
			let wire = outcome.to_wire();
			assert_eq!(AuthOutcome::from_wire(&wire), Some(outcome));
		}
	}

	#[test]
	fn auth_outcome_from_wire_rejects_truncated_input() {
		assert_eq!(AuthOutcome::from_wire(&[]), None);
		assert_eq!(AuthOutcome::from_wire(&[AUTH_OUTCOME_TAG_FAIL]), None);
		assert_eq!(AuthOutcome::from_wire(&[0xff]), None);
	}
}
