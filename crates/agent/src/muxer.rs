//! Abstraction over the inbound-stream transport. A real implementation
//! multiplexes many logical streams over one TLS connection (h2mux/quic);
//! this crate only sees the typed seam below.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// The 6-byte signature distinguishing RPC streams from data streams, and the
/// 2-byte ASCII version tag that follows it on data streams. This is the one
/// wire invariant a `Muxer` implementor must honor; everything else is opaque
/// to this crate.
pub const PROTOCOL_SIGNATURE: [u8; 6] = *b"CFTUN\0";
pub const DATA_STREAM_VERSION: [u8; 2] = *b"01";

#[derive(Debug, thiserror::Error)]
pub enum MuxerError {
	#[error("multiplexer handshake failed: {0}")]
	Handshake(String),
	#[error("multiplexer shut down")]
	Shutdown,
	#[error("multiplexer io error: {0}")]
	Io(#[from] std::io::Error),
}

/// One inbound request arriving over the muxer: parsed headers plus a
/// bidirectional byte stream for body/response.
pub struct InboundStream {
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub body: Box<dyn AsyncRead + Send + Unpin>,
	pub response: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A control-plane byte stream, used to carry the RPC trait's messages once
/// framed by a real RPC client.
pub trait ControlStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlStream for T {}

#[async_trait]
pub trait Muxer: Send + Sync {
	/// Waits for the next inbound request stream. `None` once the muxer has
	/// shut down cleanly.
	async fn accept(&self) -> Option<InboundStream>;

	/// Opens the dedicated control stream used for the RPC trait's messages.
	async fn open_control_stream(&self) -> Result<Box<dyn ControlStream>, MuxerError>;

	/// Serves the muxer until `shutdown` fires or a fatal error occurs.
	async fn serve(&self, shutdown: CancellationToken) -> Result<(), MuxerError>;
}

/// Blanket alias for the raw connection a [`MuxerDialer`] upgrades: whatever
/// `transport::dial_tls` handed back, type-erased so this crate doesn't need
/// to name the concrete TLS stream type outside `transport`.
pub trait EdgeStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> EdgeStream for T {}

/// Performs the muxer's opening handshake over an already-established edge
/// connection. A real implementation negotiates h2mux/quic framing on `io`;
/// this crate only needs the resulting [`Muxer`] handle. `protocol` is
/// whatever the connection's [`crate::protocol::ProtocolSelector`] currently
/// has selected, so the dialer knows which wire protocol to negotiate.
#[async_trait]
pub trait MuxerDialer: Send + Sync {
	async fn handshake(&self, io: Box<dyn EdgeStream>, conn_index: u32, protocol: crate::config::Protocol) -> Result<std::sync::Arc<dyn Muxer>, MuxerError>;
}

/// Trivial helper for implementors: frames a data-stream payload with the
/// protocol signature and version tag.
pub fn frame_data_stream(payload: &[u8]) -> Bytes {
	let mut out = Vec::with_capacity(PROTOCOL_SIGNATURE.len() + DATA_STREAM_VERSION.len() + payload.len());
	out.extend_from_slice(&PROTOCOL_SIGNATURE);
	out.extend_from_slice(&DATA_STREAM_VERSION);
	out.extend_from_slice(payload);
	Bytes::from(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_data_stream_leads_with_signature_and_version() {
		let framed = frame_data_stream(b"hello");
		assert_eq!(&framed[..6], &PROTOCOL_SIGNATURE);
		assert_eq!(&framed[6..8], &DATA_STREAM_VERSION);
		assert_eq!(&framed[8..], b"hello");
	}
}
